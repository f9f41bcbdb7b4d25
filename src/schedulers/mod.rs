//! # Noise schedules and samplers
//!
//! The noise schedule fixes how much signal is left at each of the training
//! steps, samplers walk a subset of these steps backward to turn noise into
//! latents. Running fewer steps trades quality for inference speed.

pub mod ddim;
pub mod noise_schedule;

pub use ddim::{timestep_subsequence, DDIMSampler, DDIMSamplerConfig};
pub use noise_schedule::NoiseSchedule;
