//! Image-to-image pipeline assembly and the SDXL img2img denoising loop.

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use log::debug;
use std::sync::Arc;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::image_utils::{image_to_tensor, tensor_to_image};
use crate::models::SdComponents;
use crate::samplers::{NoiseSource, SamplerKind};

/// Image sides must be multiples of this for the VAE/UNet down-sampling path.
const SIZE_MULTIPLE: u32 = 64;

/// One img2img call.
#[derive(Debug, Clone)]
pub struct Img2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub image: RgbImage,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub guidance_rescale: f64,
    /// Fraction of the schedule to re-noise, in [0, 1].
    pub strength: f64,
    pub seed: u64,
}

/// Anything that turns an image plus prompt into a new image.
pub trait Img2ImgPipeline {
    fn generate(&mut self, request: &Img2ImgRequest) -> Result<RgbImage>;
}

/// The model runtime a generator drives.
pub trait DiffusionBackend {
    /// Load every component. Succeeds for all supported architectures.
    fn load_model(&mut self) -> Result<()>;

    /// Build an SDXL img2img pipeline over the loaded components.
    fn build_xl_img2img(&mut self, sampler: SamplerKind) -> Result<Box<dyn Img2ImgPipeline>>;

    /// Drop all loaded components.
    fn release(&mut self);

    fn device(&self) -> &Device;
}

/// Build the img2img pipeline for `model`. Only SDXL has one; other
/// architectures fail here without touching the backend.
pub fn assemble_pipeline<B: DiffusionBackend + ?Sized>(
    model: &ModelConfig,
    backend: &mut B,
    sampler: SamplerKind,
) -> Result<Box<dyn Img2ImgPipeline>> {
    if !model.is_xl {
        return Err(Error::NotImplemented(
            "Only XL models are supported".to_string(),
        ));
    }
    debug!("Assembling SDXL img2img pipeline with sampler {}", sampler.name());
    backend.build_xl_img2img(sampler)
}

/// Index of the first denoising step for `strength`; equals `steps` when
/// nothing is to be denoised.
pub fn img2img_start_step(steps: usize, strength: f64) -> usize {
    let init_steps = ((steps as f64 * strength).floor() as usize).min(steps);
    steps - init_steps
}

/// Crop to the top-left region whose sides are multiples of 64.
pub fn crop_to_multiple(image: &RgbImage) -> Result<RgbImage> {
    let width = image.width() / SIZE_MULTIPLE * SIZE_MULTIPLE;
    let height = image.height() / SIZE_MULTIPLE * SIZE_MULTIPLE;
    if width == 0 || height == 0 {
        return Err(Error::invalid(
            "image",
            format!(
                "{}x{} is smaller than {SIZE_MULTIPLE}x{SIZE_MULTIPLE}",
                image.width(),
                image.height()
            ),
        ));
    }
    if (width, height) == image.dimensions() {
        return Ok(image.clone());
    }
    Ok(image::imageops::crop_imm(image, 0, 0, width, height).to_image())
}

/// Pull the guided noise prediction's per-sample std back towards the text
/// prediction's to counter over-exposure at high guidance scales.
pub fn rescale_noise_cfg(guided: &Tensor, text: &Tensor, guidance_rescale: f64) -> Result<Tensor> {
    let std = |t: &Tensor| -> Result<Tensor> {
        Ok(t.to_dtype(DType::F32)?.flatten_from(1)?.var_keepdim(1)?.sqrt()?)
    };
    let batch = guided.dim(0)?;
    let ratio = (std(text)? / std(guided)?)?
        .reshape((batch, 1, 1, 1))?
        .to_dtype(guided.dtype())?;
    let rescaled = guided.broadcast_mul(&ratio)?;
    Ok(((rescaled * guidance_rescale)? + (guided * (1.0 - guidance_rescale))?)?)
}

/// SDXL img2img over shared, loaded model components.
pub struct SdxlImg2ImgPipeline {
    model: Arc<SdComponents>,
    sampler: SamplerKind,
}

impl SdxlImg2ImgPipeline {
    pub fn new(model: Arc<SdComponents>, sampler: SamplerKind) -> Self {
        Self { model, sampler }
    }
}

impl Img2ImgPipeline for SdxlImg2ImgPipeline {
    fn generate(&mut self, request: &Img2ImgRequest) -> Result<RgbImage> {
        let model = &self.model;
        let steps = request.num_inference_steps;
        let t_start = img2img_start_step(steps, request.strength);
        if t_start == steps {
            debug!("Denoise strength {} leaves no steps to run", request.strength);
            return Ok(request.image.clone());
        }

        let mut noise = NoiseSource::new(request.seed);

        let use_guidance = request.guidance_scale > 1.0;
        let text_embeddings = model.text_encoders.encode_for_guidance(
            &request.prompt,
            &request.negative_prompt,
            use_guidance,
        )?;

        let image = crop_to_multiple(&request.image)?;
        let init_image = image_to_tensor(&image, &model.device)?.to_dtype(model.dtype)?;
        let posterior = model.latent_encoder.sample(&init_image, &mut noise)?;
        let init_latents = (posterior * model.vae_scale)?;

        let mut sampler = self.sampler.build(steps, model.prediction)?;
        let start_noise = noise.randn_like(&init_latents)?;
        let mut latents = sampler.add_noise(&init_latents, &start_noise, t_start)?;

        let timesteps = sampler.timesteps().to_vec();
        debug!(
            "Denoising {} of {steps} steps from timestep {}",
            steps - t_start,
            timesteps[t_start]
        );
        for (step_index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = sampler.scale_model_input(model_input, step_index)?;
            let noise_pred = model
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                let guided = (uncond + ((text - uncond)? * request.guidance_scale)?)?;
                if request.guidance_rescale > 0.0 {
                    rescale_noise_cfg(&guided, text, request.guidance_rescale)?
                } else {
                    guided
                }
            } else {
                noise_pred
            };

            latents = sampler.step(&noise_pred, step_index, &latents, &mut noise)?;
        }

        let decoded = model.vae.decode(&(latents / model.vae_scale)?)?;
        tensor_to_image(&decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct RecordingBackend {
        built: Vec<SamplerKind>,
        device: Device,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                built: Vec::new(),
                device: Device::Cpu,
            }
        }
    }

    struct EchoPipeline;

    impl Img2ImgPipeline for EchoPipeline {
        fn generate(&mut self, request: &Img2ImgRequest) -> Result<RgbImage> {
            Ok(request.image.clone())
        }
    }

    impl DiffusionBackend for RecordingBackend {
        fn load_model(&mut self) -> Result<()> {
            Ok(())
        }

        fn build_xl_img2img(&mut self, sampler: SamplerKind) -> Result<Box<dyn Img2ImgPipeline>> {
            self.built.push(sampler);
            Ok(Box::new(EchoPipeline))
        }

        fn release(&mut self) {}

        fn device(&self) -> &Device {
            &self.device
        }
    }

    #[test]
    fn test_start_step_follows_strength() {
        assert_eq!(img2img_start_step(20, 0.5), 10);
        assert_eq!(img2img_start_step(20, 1.0), 0);
        assert_eq!(img2img_start_step(20, 0.0), 20);
        assert_eq!(img2img_start_step(3, 0.5), 2);
        assert_eq!(img2img_start_step(30, 0.99), 1);
    }

    #[test]
    fn test_non_xl_fails_before_building() {
        let mut backend = RecordingBackend::new();
        for config in [ModelConfig::new("sd15"), {
            let mut v2 = ModelConfig::new("sd21");
            v2.is_v2 = true;
            v2
        }] {
            match assemble_pipeline(&config, &mut backend, SamplerKind::Ddpm) {
                Err(Error::NotImplemented(msg)) => assert_eq!(msg, "Only XL models are supported"),
                Err(other) => panic!("expected not implemented, got {other:?}"),
                Ok(_) => panic!("expected not implemented, got a pipeline"),
            }
        }
        assert!(backend.built.is_empty());
    }

    #[test]
    fn test_xl_builds_with_selected_sampler() -> Result<()> {
        let mut backend = RecordingBackend::new();
        let mut config = ModelConfig::new("sdxl");
        config.is_xl = true;
        let mut pipeline = assemble_pipeline(&config, &mut backend, SamplerKind::EulerAncestral)?;
        assert_eq!(backend.built, vec![SamplerKind::EulerAncestral]);

        let request = Img2ImgRequest {
            prompt: "a cat".to_string(),
            negative_prompt: String::new(),
            image: RgbImage::from_pixel(64, 64, Rgb([9, 8, 7])),
            num_inference_steps: 4,
            guidance_scale: 7.0,
            guidance_rescale: 0.0,
            strength: 0.5,
            seed: 1,
        };
        assert_eq!(pipeline.generate(&request)?, request.image);
        Ok(())
    }

    #[test]
    fn test_crop_to_multiple() -> Result<()> {
        let image = RgbImage::from_pixel(130, 200, Rgb([1, 2, 3]));
        assert_eq!(crop_to_multiple(&image)?.dimensions(), (128, 192));
        let exact = RgbImage::new(64, 128);
        assert_eq!(crop_to_multiple(&exact)?.dimensions(), (64, 128));
        assert!(crop_to_multiple(&RgbImage::new(63, 300)).is_err());
        Ok(())
    }

    #[test]
    fn test_full_rescale_matches_text_std() -> Result<()> {
        let device = Device::Cpu;
        let text = NoiseSource::new(3).randn_like(&Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?)?;
        let guided = (&text * 4.0)?;

        let std_of = |t: &Tensor| -> Result<Vec<f32>> {
            Ok(t.flatten_from(1)?.var_keepdim(1)?.sqrt()?.flatten_all()?.to_vec1()?)
        };

        let rescaled = rescale_noise_cfg(&guided, &text, 1.0)?;
        for (a, b) in std_of(&rescaled)?.iter().zip(std_of(&text)?) {
            assert!((a - b).abs() < 1e-4);
        }

        let untouched = rescale_noise_cfg(&guided, &text, 0.0)?;
        let diff = (untouched - &guided)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }
}
