//! Pretrained model loading: weights discovery, text encoders, UNet and VAE.

pub mod stable_diffusion;
pub mod text_encoders;
pub mod vae_encoder;

pub use stable_diffusion::{ModelFiles, SdComponents, StableDiffusion};
pub use text_encoders::{ClipEncoder, TextEncoders};
pub use vae_encoder::LatentEncoder;
