//! Stable Diffusion model wrapper.
//!
//! Locates the component weights of a diffusers-layout model directory and
//! loads UNet, VAE and text encoders onto one device with one dtype.

use candle_core::{DType, Device};
use candle_transformers::models::stable_diffusion::{
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::text_encoders::{ClipEncoder, TextEncoders};
use super::vae_encoder::LatentEncoder;
use crate::config::{DeviceSpec, ModelArch, ModelConfig};
use crate::error::{Error, Result};
use crate::memory;
use crate::pipeline::{DiffusionBackend, Img2ImgPipeline, SdxlImg2ImgPipeline};
use crate::samplers::{PredictionType, SamplerKind};

const WEIGHTS_STEM_UNET: &str = "diffusion_pytorch_model";
const WEIGHTS_STEM_CLIP: &str = "model";
const TOKENIZER_FILE: &str = "tokenizer.json";

const VAE_SCALE_SD: f64 = 0.18215;
const VAE_SCALE_XL: f64 = 0.13025;

/// Paths of every file a model needs, resolved up front.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    /// One entry per text encoder, in encoder order.
    pub text_encoders: Vec<PathBuf>,
    pub tokenizers: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn resolve(config: &ModelConfig) -> Result<Self> {
        let root = &config.name_or_path;
        if !root.is_dir() {
            return Err(Error::ModelFiles(format!(
                "{} is not a model directory",
                root.display()
            )));
        }

        let unet = weights_in(&root.join("unet"), WEIGHTS_STEM_UNET)?;
        let vae = match &config.vae_path {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => weights_in(path, WEIGHTS_STEM_UNET)?,
            None => weights_in(&root.join("vae"), WEIGHTS_STEM_UNET)?,
        };

        let mut text_encoders = vec![weights_in(&root.join("text_encoder"), WEIGHTS_STEM_CLIP)?];
        let mut tokenizers = vec![tokenizer_at(
            config.tokenizer_path.as_deref(),
            &root.join("tokenizer"),
        )?];
        if config.is_xl {
            text_encoders.push(weights_in(&root.join("text_encoder_2"), WEIGHTS_STEM_CLIP)?);
            tokenizers.push(tokenizer_at(
                config.tokenizer_2_path.as_deref(),
                &root.join("tokenizer_2"),
            )?);
        }

        Ok(Self {
            unet,
            vae,
            text_encoders,
            tokenizers,
        })
    }
}

/// `<stem>.fp16.safetensors` if present, else `<stem>.safetensors`.
fn weights_in(dir: &Path, stem: &str) -> Result<PathBuf> {
    let candidates = [
        dir.join(format!("{stem}.fp16.safetensors")),
        dir.join(format!("{stem}.safetensors")),
    ];
    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Error::ModelFiles(format!(
                "no {stem}.safetensors weights in {}",
                dir.display()
            ))
        })
}

fn tokenizer_at(override_path: Option<&Path>, default_dir: &Path) -> Result<PathBuf> {
    let path = match override_path {
        Some(path) if path.is_dir() => path.join(TOKENIZER_FILE),
        Some(path) => path.to_path_buf(),
        None => default_dir.join(TOKENIZER_FILE),
    };
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::ModelFiles(format!(
            "tokenizer not found at {}",
            path.display()
        )))
    }
}

/// Everything a pipeline needs from a loaded model.
pub struct SdComponents {
    pub arch: ModelArch,
    pub unet: UNet2DConditionModel,
    /// Decodes latents; encoding goes through `latent_encoder`.
    pub vae: AutoEncoderKL,
    pub latent_encoder: LatentEncoder,
    pub text_encoders: TextEncoders,
    pub device: Device,
    pub dtype: DType,
    pub prediction: PredictionType,
    /// Latent scaling factor of the VAE.
    pub vae_scale: f64,
}

/// A Stable Diffusion model bound to a device, loaded on demand.
pub struct StableDiffusion {
    device_spec: DeviceSpec,
    device: Device,
    model_config: ModelConfig,
    dtype: DType,
    components: Option<Arc<SdComponents>>,
}

impl StableDiffusion {
    pub fn new(device_spec: DeviceSpec, model_config: ModelConfig, dtype: DType) -> Result<Self> {
        let device = device_spec.open()?;
        info!("Using device {device_spec}");
        Ok(Self {
            device_spec,
            device,
            model_config,
            dtype,
            components: None,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.components.is_some()
    }

    pub fn components(&self) -> Result<Arc<SdComponents>> {
        self.components.clone().ok_or(Error::ModelNotLoaded)
    }

    fn sd_config(&self) -> StableDiffusionConfig {
        let sliced = self.model_config.sliced_attention_size;
        match self.model_config.arch() {
            ModelArch::Sd15 => StableDiffusionConfig::v1_5(sliced, None, None),
            ModelArch::Sd21 => StableDiffusionConfig::v2_1(sliced, None, None),
            ModelArch::Xl => StableDiffusionConfig::sdxl(sliced, None, None),
        }
    }
}

impl DiffusionBackend for StableDiffusion {
    fn load_model(&mut self) -> Result<()> {
        let arch = self.model_config.arch();
        let files = ModelFiles::resolve(&self.model_config)?;
        let sd_config = self.sd_config();
        info!(
            "Loading {arch:?} model from {} on {} as {:?}",
            self.model_config.name_or_path.display(),
            self.device_spec,
            self.dtype
        );
        debug!("{}", memory::gpu_memory_info());

        let mut clip_configs = vec![&sd_config.clip];
        if let Some(clip2) = &sd_config.clip2 {
            clip_configs.push(clip2);
        }
        let encoders = clip_configs
            .into_iter()
            .zip(files.text_encoders.iter().zip(&files.tokenizers))
            .map(|(config, (weights, tokenizer))| {
                ClipEncoder::load(config, weights, tokenizer, &self.device, self.dtype)
            })
            .collect::<Result<Vec<_>>>()?;
        let text_encoders =
            TextEncoders::new(encoders, self.model_config.is_xl, self.device.clone(), self.dtype);

        debug!("Loading VAE from: {}", files.vae.display());
        let vae = sd_config.build_vae(&files.vae, &self.device, self.dtype)?;
        let latent_encoder =
            LatentEncoder::load(&vae.config, &files.vae, &self.device, self.dtype)?;
        debug!("Loading UNet from: {}", files.unet.display());
        let unet = sd_config.build_unet(
            &files.unet,
            &self.device,
            4,
            self.model_config.use_flash_attn,
            self.dtype,
        )?;

        let prediction = if self.model_config.is_v_pred {
            PredictionType::VPrediction
        } else {
            PredictionType::Epsilon
        };
        let vae_scale = match arch {
            ModelArch::Xl => VAE_SCALE_XL,
            ModelArch::Sd15 | ModelArch::Sd21 => VAE_SCALE_SD,
        };

        self.components = Some(Arc::new(SdComponents {
            arch,
            unet,
            vae,
            latent_encoder,
            text_encoders,
            device: self.device.clone(),
            dtype: self.dtype,
            prediction,
            vae_scale,
        }));
        info!("Model loaded");
        debug!("{}", memory::gpu_memory_info());
        Ok(())
    }

    fn build_xl_img2img(&mut self, sampler: SamplerKind) -> Result<Box<dyn Img2ImgPipeline>> {
        Ok(Box::new(SdxlImg2ImgPipeline::new(self.components()?, sampler)))
    }

    fn release(&mut self) {
        if self.components.take().is_some() {
            info!("Released model components");
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    fn sd15_layout(root: &Path) {
        touch(&root.join("unet/diffusion_pytorch_model.safetensors"));
        touch(&root.join("vae/diffusion_pytorch_model.safetensors"));
        touch(&root.join("text_encoder/model.safetensors"));
        touch(&root.join("tokenizer/tokenizer.json"));
    }

    #[test]
    fn test_resolve_single_encoder_layout() {
        let dir = tempfile::tempdir().unwrap();
        sd15_layout(dir.path());
        let files = ModelFiles::resolve(&ModelConfig::new(dir.path())).unwrap();
        assert_eq!(files.unet, dir.path().join("unet/diffusion_pytorch_model.safetensors"));
        assert_eq!(files.text_encoders.len(), 1);
        assert_eq!(files.tokenizers, vec![dir.path().join("tokenizer/tokenizer.json")]);
    }

    #[test]
    fn test_resolve_xl_prefers_fp16_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        sd15_layout(root);
        touch(&root.join("unet/diffusion_pytorch_model.fp16.safetensors"));
        touch(&root.join("text_encoder_2/model.safetensors"));
        touch(&root.join("custom/tok2.json"));
        touch(&root.join("fixed_vae.safetensors"));

        let mut config = ModelConfig::new(root);
        config.is_xl = true;
        config.tokenizer_2_path = Some(root.join("custom/tok2.json"));
        config.vae_path = Some(root.join("fixed_vae.safetensors"));

        let files = ModelFiles::resolve(&config).unwrap();
        assert_eq!(files.unet, root.join("unet/diffusion_pytorch_model.fp16.safetensors"));
        assert_eq!(files.vae, root.join("fixed_vae.safetensors"));
        assert_eq!(files.text_encoders[1], root.join("text_encoder_2/model.safetensors"));
        assert_eq!(files.tokenizers[1], root.join("custom/tok2.json"));
    }

    #[test]
    fn test_resolve_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        sd15_layout(dir.path());
        let mut config = ModelConfig::new(dir.path());
        config.is_xl = true;
        match ModelFiles::resolve(&config) {
            Err(Error::ModelFiles(msg)) => assert!(msg.contains("text_encoder_2")),
            other => panic!("expected missing text_encoder_2, got {other:?}"),
        }

        assert!(matches!(
            ModelFiles::resolve(&ModelConfig::new(dir.path().join("nope"))),
            Err(Error::ModelFiles(_))
        ));
    }

    #[test]
    fn test_unloaded_model_has_no_components() {
        let model =
            StableDiffusion::new(DeviceSpec::Cpu, ModelConfig::new("/models/x"), DType::F32)
                .unwrap();
        assert!(!model.is_loaded());
        assert!(matches!(model.components(), Err(Error::ModelNotLoaded)));
    }
}
