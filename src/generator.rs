//! The `batch_img2img` process: run every dataset image through the img2img
//! pipeline and write the result next to its caption.

use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{GeneratorSettings, ProcessConfig};
use crate::data_loader::{DataLoader, DataLoaderBatch};
use crate::error::{Error, Result};
use crate::image_utils::{save_image, tensor_to_image};
use crate::memory::DeviceSession;
use crate::models::StableDiffusion;
use crate::pipeline::{assemble_pipeline, DiffusionBackend, Img2ImgPipeline, Img2ImgRequest};
use crate::samplers::SamplerKind;

/// Placeholder in captions replaced by the configured trigger word.
pub const TRIGGER_TAG: &str = "[trigger]";

/// Image and caption file written for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub image: PathBuf,
    pub caption: PathBuf,
}

/// Where one dataset item's outputs go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub output: PathPair,
    /// Pre-generation copy of the input, when mirroring is configured.
    pub mirror: Option<PathPair>,
}

/// `<folder>/<stem>.<ext>` and `<folder>/<stem>.txt` for the output folder
/// and, optionally, the input mirror folder.
pub fn output_paths(
    source: &Path,
    output_folder: &Path,
    copy_inputs_to: Option<&Path>,
    ext: &str,
) -> Result<OutputPaths> {
    let stem = source.file_stem().ok_or_else(|| Error::Dataset {
        path: source.to_path_buf(),
        reason: "image path has no file name".to_string(),
    })?;
    let image_name = {
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(ext);
        name
    };
    let caption_name = {
        let mut name = stem.to_os_string();
        name.push(".txt");
        name
    };
    let pair = |folder: &Path| PathPair {
        image: folder.join(&image_name),
        caption: folder.join(&caption_name),
    };

    Ok(OutputPaths {
        output: pair(output_folder),
        mirror: copy_inputs_to.map(pair),
    })
}

pub fn apply_trigger_word(caption: &str, trigger_word: Option<&str>) -> String {
    match trigger_word {
        Some(word) => caption.replace(TRIGGER_TAG, word),
        None => caption.to_string(),
    }
}

/// Base seed for a run: the configured one, or a random one when negative.
pub fn resolve_base_seed(seed: i64) -> u64 {
    if seed < 0 {
        u64::from(rand::random::<u32>())
    } else {
        seed as u64
    }
}

pub fn seed_for_item(base_seed: u64, index: usize, walk_seed: bool) -> u64 {
    if walk_seed {
        base_seed.wrapping_add(index as u64)
    } else {
        base_seed
    }
}

/// Batch img2img generator over the configured datasets.
pub struct Img2ImgGenerator<B: DiffusionBackend> {
    settings: GeneratorSettings,
    backend: B,
}

impl Img2ImgGenerator<StableDiffusion> {
    pub fn new(process: &ProcessConfig) -> Result<Self> {
        let settings = GeneratorSettings::from_process(process)?;
        let backend = StableDiffusion::new(settings.device, settings.model.clone(), settings.dtype)?;
        Ok(Self::with_backend(settings, backend))
    }
}

impl<B: DiffusionBackend> Img2ImgGenerator<B> {
    pub fn with_backend(settings: GeneratorSettings, backend: B) -> Self {
        Self { settings, backend }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Generate every item. The model is released on every exit path.
    pub fn run(&mut self) -> Result<()> {
        let _session = DeviceSession::begin(self.backend.device(), "batch_img2img");
        let result = self.generate_all();
        self.backend.release();
        result
    }

    fn generate_all(&mut self) -> Result<()> {
        let generate = &self.settings.generate;

        info!("Loading model...");
        self.backend.load_model()?;
        let sampler = SamplerKind::from_name(&generate.sampler)?;
        let mut pipeline = assemble_pipeline(&self.settings.model, &mut self.backend, sampler)?;

        let data_loader = DataLoader::from_datasets(&self.settings.datasets, 1)?;
        let base_seed = resolve_base_seed(generate.seed);
        info!(
            "Generating {} image(s) with {} ({} steps, strength {}, seed {base_seed}{})",
            data_loader.len(),
            sampler.name(),
            generate.sample_steps,
            generate.denoise_strength,
            if generate.walk_seed { ", walking" } else { "" }
        );

        let mut progress = Progress::new(data_loader.len());
        for (index, batch) in data_loader.enumerate() {
            let batch = batch?;
            let seed = seed_for_item(base_seed, index, generate.walk_seed);
            self.process_batch(pipeline.as_mut(), &batch, seed)?;
            progress.inc();
            batch.cleanup();
        }
        progress.finish();

        info!("Done generating images");
        Ok(())
    }

    fn process_batch(
        &self,
        pipeline: &mut dyn Img2ImgPipeline,
        batch: &DataLoaderBatch,
        seed: u64,
    ) -> Result<()> {
        let settings = &self.settings;
        let generate = &settings.generate;
        let file_item = batch.file_items.first().ok_or_else(|| Error::Dataset {
            path: settings.output_folder.clone(),
            reason: "data loader produced an empty batch".to_string(),
        })?;

        let paths = output_paths(
            &file_item.path,
            &settings.output_folder,
            settings.copy_inputs_to.as_deref(),
            &generate.ext,
        )?;
        let caption = batch.get_caption_list().into_iter().next().unwrap_or_default();
        let caption = apply_trigger_word(&caption, generate.trigger_word.as_deref());
        let image = tensor_to_image(&batch.tensor)?;

        let request = Img2ImgRequest {
            prompt: caption,
            negative_prompt: generate.neg.clone(),
            image,
            num_inference_steps: generate.sample_steps,
            guidance_scale: generate.guidance_scale,
            guidance_rescale: generate.guidance_rescale,
            strength: generate.denoise_strength,
            seed,
        };
        let generated = pipeline.generate(&request)?;

        write_pair(&paths.output, &generated, &request.prompt)?;
        if let Some(mirror) = &paths.mirror {
            write_pair(mirror, &request.image, &request.prompt)?;
        }
        Ok(())
    }
}

fn write_pair(paths: &PathPair, image: &image::RgbImage, caption: &str) -> Result<()> {
    if let Some(parent) = paths.image.parent() {
        fs::create_dir_all(parent)?;
    }
    save_image(image, &paths.image)?;
    fs::write(&paths.caption, caption)?;
    Ok(())
}

/// "Generating images" progress, as a bar or as log lines.
struct Progress {
    #[cfg(feature = "progress-bar")]
    bar: indicatif::ProgressBar,
    #[cfg(not(feature = "progress-bar"))]
    done: usize,
    #[cfg(not(feature = "progress-bar"))]
    total: usize,
}

impl Progress {
    #[cfg(feature = "progress-bar")]
    fn new(total: usize) -> Self {
        use indicatif::{ProgressBar, ProgressStyle};

        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message("Generating images");
        Self { bar }
    }

    #[cfg(not(feature = "progress-bar"))]
    fn new(total: usize) -> Self {
        Self { done: 0, total }
    }

    #[cfg(feature = "progress-bar")]
    fn inc(&mut self) {
        self.bar.inc(1);
    }

    #[cfg(not(feature = "progress-bar"))]
    fn inc(&mut self) {
        self.done += 1;
        info!("Generating images: {}/{}", self.done, self.total);
    }

    #[cfg(feature = "progress-bar")]
    fn finish(self) {
        self.bar.finish();
    }

    #[cfg(not(feature = "progress-bar"))]
    fn finish(self) {}
}
