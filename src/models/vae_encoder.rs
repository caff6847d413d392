//! VAE encoder with seeded posterior sampling.
//!
//! candle's `AutoEncoderKL::encode` samples the latent posterior from the
//! device generator, which cannot be seeded on the CPU. This encoder loads the
//! same `encoder.*` / `quant_conv.*` weights and draws the posterior noise from
//! a [`NoiseSource`] instead, so a seed fixes the initial latents everywhere.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig,
};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKLConfig;
use log::debug;
use std::path::Path;

use crate::error::{Error, Result};
use crate::samplers::NoiseSource;

const NORM_EPS: f64 = 1e-6;
const LOGVAR_MIN: f64 = -30.0;
const LOGVAR_MAX: f64 = 20.0;

/// Image to latent posterior moments (`2 * latent_channels` channels).
pub struct LatentEncoder {
    conv_in: nn::Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
    quant_conv: Option<nn::Conv2d>,
}

impl LatentEncoder {
    pub fn load(
        config: &AutoEncoderKLConfig,
        weights: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        debug!("Loading VAE encoder from: {}", weights.display());
        let tensors = candle_core::safetensors::load(weights, device)?;
        let vb = nn::VarBuilder::from_tensors(tensors, dtype, device);
        Self::new(vb, config)
    }

    pub fn new(vb: nn::VarBuilder, config: &AutoEncoderKLConfig) -> Result<Self> {
        let channels = &config.block_out_channels;
        let (first, last) = match (channels.first(), channels.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => {
                return Err(Error::ModelFiles(
                    "VAE config has no block_out_channels".to_string(),
                ))
            }
        };
        let padded = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let encoder = vb.pp("encoder");
        let conv_in = nn::conv2d(3, first, 3, padded, encoder.pp("conv_in"))?;

        let mut down_blocks = Vec::with_capacity(channels.len());
        for (index, &out_channels) in channels.iter().enumerate() {
            let in_channels = if index == 0 { first } else { channels[index - 1] };
            let block_config = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: NORM_EPS,
                resnet_groups: config.norm_num_groups,
                add_downsample: index + 1 < channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(
                encoder.pp("down_blocks").pp(index.to_string()),
                in_channels,
                out_channels,
                block_config,
            )?);
        }

        let mid_config = UNetMidBlock2DConfig {
            resnet_eps: NORM_EPS,
            output_scale_factor: 1.0,
            attn_num_head_channels: None,
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(encoder.pp("mid_block"), last, None, mid_config)?;
        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            last,
            NORM_EPS,
            encoder.pp("conv_norm_out"),
        )?;
        let moments = 2 * config.latent_channels;
        let conv_out = nn::conv2d(last, moments, 3, padded, encoder.pp("conv_out"))?;
        let quant_conv = if config.use_quant_conv {
            Some(nn::conv2d(moments, moments, 1, Default::default(), vb.pp("quant_conv"))?)
        } else {
            None
        };

        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    /// Mean and log-variance of the latent posterior, concatenated on dim 1.
    pub fn moments(&self, image: &Tensor) -> Result<Tensor> {
        let mut xs = image.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self
            .mid_block
            .forward(&xs, None)?
            .apply(&self.conv_norm_out)?;
        let xs = nn::ops::silu(&xs)?.apply(&self.conv_out)?;
        match &self.quant_conv {
            Some(quant_conv) => Ok(quant_conv.forward(&xs)?),
            None => Ok(xs),
        }
    }

    /// Unscaled latents drawn from the posterior of `image`.
    pub fn sample(&self, image: &Tensor, noise: &mut NoiseSource) -> Result<Tensor> {
        sample_posterior(&self.moments(image)?, noise)
    }
}

/// `mean + exp(logvar / 2) * eps` with `eps` from `noise`; logvar is clamped
/// to [-30, 20].
pub fn sample_posterior(moments: &Tensor, noise: &mut NoiseSource) -> Result<Tensor> {
    let channels = moments.dim(1)?;
    if channels == 0 || channels % 2 != 0 {
        return Err(candle_core::Error::Msg(format!(
            "posterior moments need an even channel count, got {:?}",
            moments.dims()
        ))
        .into());
    }
    let mean = moments.narrow(1, 0, channels / 2)?;
    let logvar = moments.narrow(1, channels / 2, channels / 2)?;
    let std = (logvar.clamp(LOGVAR_MIN, LOGVAR_MAX)? * 0.5)?.exp()?;
    let eps = noise.randn_like(&mean)?;
    Ok((mean + (std * eps)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: vec![32, 32],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 32,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }

    #[test]
    fn test_same_seed_same_latents_on_cpu() -> Result<()> {
        let device = Device::Cpu;
        let vb = nn::VarBuilder::zeros(DType::F32, &device);
        let encoder = LatentEncoder::new(vb, &tiny_config())?;
        let image = Tensor::ones((1, 3, 16, 16), DType::F32, &device)?;

        let first = encoder.sample(&image, &mut NoiseSource::new(7))?;
        let second = encoder.sample(&image, &mut NoiseSource::new(7))?;
        let other = encoder.sample(&image, &mut NoiseSource::new(8))?;
        assert_eq!(first.dims(), &[1, 4, 8, 8]);

        let diff = |a: &Tensor, b: &Tensor| -> Result<f32> {
            Ok((a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?)
        };
        assert_eq!(diff(&first, &second)?, 0.0);
        assert!(diff(&first, &other)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_sample_posterior_clamps_logvar() -> Result<()> {
        let device = Device::Cpu;
        let mean = Tensor::full(0.5f32, (1, 4, 2, 2), &device)?;
        let logvar = Tensor::full(-100f32, (1, 4, 2, 2), &device)?;
        let moments = Tensor::cat(&[&mean, &logvar], 1)?;

        let sample = sample_posterior(&moments, &mut NoiseSource::new(0))?;
        assert_eq!(sample.dims(), &[1, 4, 2, 2]);
        // std = exp(-15) after clamping, so the sample stays on the mean.
        let max_offset = (sample - 0.5)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max_offset < 1e-4);
        Ok(())
    }
}
