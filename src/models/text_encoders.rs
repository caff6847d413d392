//! CLIP prompt encoding for the Stable Diffusion family.
//!
//! SD 1.5 / 2.1 use a single CLIP text transformer. SDXL runs CLIP-L and
//! OpenCLIP-G side by side and concatenates their hidden states on the
//! feature axis ([1, 77, 768] + [1, 77, 1280] -> [1, 77, 2048]).

use candle_core::{DType, Device, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{self, clip};
use log::{debug, warn};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

/// One tokenizer + text transformer pair.
pub struct ClipEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    max_length: usize,
    pad_id: u32,
}

impl ClipEncoder {
    pub fn load(
        config: &clip::Config,
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        debug!("Loading CLIP text encoder from: {}", weights.display());
        let tokenizer = Tokenizer::from_file(tokenizer)?;
        let pad_token = config.pad_with.as_deref().unwrap_or(DEFAULT_PAD_TOKEN);
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .ok_or_else(|| Error::ModelFiles(format!("tokenizer has no `{pad_token}` token")))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, dtype)?;

        Ok(Self {
            tokenizer,
            model,
            max_length: config.max_position_embeddings,
            pad_id,
        })
    }

    /// Token ids padded or truncated to the encoder's context length.
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        Ok(fit_tokens(ids, self.max_length, self.pad_id))
    }

    /// Hidden states `[1, max_length, hidden]`.
    pub fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let tokens = self.tokenize(prompt)?;
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Pad with `pad_id` up to `max_length`, or truncate keeping the final
/// (end-of-text) token.
pub fn fit_tokens(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Vec<u32> {
    if ids.len() > max_length {
        warn!(
            "Prompt is {} tokens long, truncating to {max_length}",
            ids.len()
        );
        let last = ids[ids.len() - 1];
        ids.truncate(max_length);
        if let Some(end) = ids.last_mut() {
            *end = last;
        }
    }
    ids.resize(max_length, pad_id);
    ids
}

/// The text encoders of one model.
pub struct TextEncoders {
    encoders: Vec<ClipEncoder>,
    /// SDXL conditions an empty negative prompt on zeros rather than on the
    /// encoding of "".
    zero_empty_negative: bool,
    device: Device,
    dtype: DType,
}

impl TextEncoders {
    pub fn new(encoders: Vec<ClipEncoder>, is_xl: bool, device: Device, dtype: DType) -> Self {
        Self {
            encoders,
            zero_empty_negative: is_xl,
            device,
            dtype,
        }
    }

    /// Encode a prompt through every encoder and concatenate the hidden states.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let hidden = self
            .encoders
            .iter()
            .map(|encoder| encoder.encode(prompt, &self.device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&hidden, D::Minus1)?.to_dtype(self.dtype)?)
    }

    /// Conditioning for the UNet: `[uncond, cond]` stacked on the batch axis
    /// when classifier-free guidance is on, `cond` alone otherwise.
    pub fn encode_for_guidance(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let cond = self.encode(prompt)?;
        if !use_guidance {
            return Ok(cond);
        }
        let uncond = if self.zero_empty_negative && negative_prompt.trim().is_empty() {
            cond.zeros_like()?
        } else {
            self.encode(negative_prompt)?
        };
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }
}
