//! # Pipelines
//!
//! Glue between the sampler and the networks around it.

pub mod guidance;
pub mod latent_diffusion;

pub use guidance::ClassifierFreeGuidance;
pub use latent_diffusion::LatentDiffusionPipeline;
