//! # Models
//!
//! The networks around the sampler: the noise predictor and the
//! variational auto-encoder mapping images to latents and back.
pub mod unet_2d;
pub mod vae;

pub use unet_2d::{NoisePredictor, TorchScriptUNet};
pub use vae::{DiagonalGaussianDistribution, LatentCodec, TorchScriptAutoEncoder};
