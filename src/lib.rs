pub mod config;
pub mod data_loader;
pub mod error;
pub mod generator;
pub mod image_utils;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod samplers;

// Re-export common types
pub use config::{load_job, GeneratorSettings, JobConfig, ProcessConfig};
pub use error::{Error, Result};
pub use generator::Img2ImgGenerator;

use log::info;

/// Process type handled by [`Img2ImgGenerator`].
pub const BATCH_IMG2IMG: &str = "batch_img2img";

/// Run every process of a job in order, stopping at the first failure.
pub fn run_job(job: &JobConfig) -> Result<()> {
    if let Some(name) = &job.name {
        info!("Running job: {name}");
    }
    for (index, process) in job.process.iter().enumerate() {
        match process.process_type() {
            Some(BATCH_IMG2IMG) => {
                info!("Process {}/{}: {BATCH_IMG2IMG}", index + 1, job.process.len());
                Img2ImgGenerator::new(process)?.run()?;
            }
            Some(other) => return Err(Error::UnknownProcess(other.to_string())),
            None => {
                return Err(Error::MissingConfig {
                    key: format!("config.process[{index}].type"),
                })
            }
        }
    }
    Ok(())
}

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped INFO logging; `RUST_LOG` overrides the level.
    ///
    /// Returns `false` when another logger was already installed.
    pub fn init_logger() -> bool {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info);
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        match builder.try_init() {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Keeping the installed logger: {e}");
                false
            }
        }
    }
}
