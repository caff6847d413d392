use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Batch image-to-image generation over captioned image datasets.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Job config file (YAML or JSON)
    config: PathBuf,

    /// Job name, replaces `[name]` in the config
    #[arg(long)]
    name: Option<String>,
}

fn main() -> Result<()> {
    img2img_generator::logging::init_logger();
    let args = Args::parse();

    info!("Starting job with config: {}", args.config.display());
    let job = img2img_generator::load_job(&args.config, args.name.as_deref())
        .with_context(|| format!("failed to load job config {}", args.config.display()))?;

    img2img_generator::run_job(&job)?;

    info!("Job completed successfully");
    Ok(())
}
