//! # Latent diffusion sampling
//!
//! Noise schedules and a DDIM sampler for latent diffusion models, using Torch
//! via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A square-root linear variance schedule with the forward noising process.
//! - A DDIM sampler running on an evenly spaced subset of the schedule steps.
//! - Pipelines plugging the sampler between a noise predictor and a
//!   variational auto-encoder, with classifier-free guidance.
//!
//! The networks themselves are external, they can be loaded from TorchScript
//! exports or provided as closures.

pub mod error;
pub mod models;
pub mod noise;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

pub use error::{Result, SamplerError};
