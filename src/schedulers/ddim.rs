//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) is a simple sampler
//! similar to Denoising Diffusion Probabilistic Models (DDPM). The DDPM
//! generative process is the reverse of a Markovian process, DDIM generalizes
//! this to non-Markovian guidance and can skip most of the training steps.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::noise_schedule::NoiseSchedule;
use crate::error::{Result, SamplerError};
use crate::models::NoisePredictor;
use crate::noise::NoiseSource;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::Path;
use tch::{kind, Device, Kind, Tensor};

/// The configuration for the DDIM sampler and its noise schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DDIMSamplerConfig {
    /// Number of diffusion steps used to train the model.
    pub t: usize,
    /// The value of beta at the beginning of training.
    pub beta_min: f64,
    /// The value of beta at the end of training.
    pub beta_max: f64,
    /// Number of steps used for sampling, all `t` steps when unset.
    pub tau_dim: Option<usize>,
    /// The amount of noise to be added at each step.
    pub eta: f64,
}

impl Default for DDIMSamplerConfig {
    fn default() -> Self {
        Self { t: 1000, beta_min: 1e-4, beta_max: 2e-2, tau_dim: None, eta: 0. }
    }
}

impl DDIMSamplerConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = crate::utils::file_open(path.as_ref())?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn build_schedule(&self) -> Result<NoiseSchedule> {
        NoiseSchedule::new(self.t, self.beta_min, self.beta_max)
    }
}

/// Returns `s` schedule indexes evenly spread over `[0, t - 1]`, rounded to
/// the nearest integer. The first one is always 0 and the last one `t - 1`.
pub fn timestep_subsequence(t: usize, s: usize) -> Result<Vec<usize>> {
    if s == 0 || s > t {
        return Err(SamplerError::InvalidSamplerParameters(format!(
            "the number of sampling steps {s} must be in 1..={t}"
        )));
    }
    if s == 1 {
        return Ok(vec![0]);
    }
    let last = (t - 1) as f64;
    let spacing = (s - 1) as f64;
    // Points are at least one apart since s <= t, so rounding cannot merge them.
    Ok((0..s).map(|i| (i as f64 * last / spacing).round() as usize).collect())
}

/// The DDIM sampler, a compressed view of a [`NoiseSchedule`].
///
/// Step `t` of the sampler, for `t` in `1..=S`, corresponds to schedule index
/// `tau[t - 1]`. Index 0 of `alphas` is the noise-free boundary.
#[derive(Clone)]
pub struct DDIMSampler<'a> {
    schedule: &'a NoiseSchedule,
    denoiser: Option<&'a dyn NoisePredictor>,
    tau: Vec<usize>,
    alphas: Vec<f64>,
    betas: Vec<f64>,
    eta: f64,
    options: (Kind, Device),
}

impl<'a> std::fmt::Debug for DDIMSampler<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DDIMSampler")
            .field("tau", &self.tau)
            .field("eta", &self.eta)
            .field("has_denoiser", &self.denoiser.is_some())
            .finish()
    }
}

impl<'a> DDIMSampler<'a> {
    /// Creates a sampler running `tau_dim` steps, or every step of the schedule
    /// when `None`. `eta` goes from 0 (deterministic) to 1 (ancestral).
    pub fn new(schedule: &'a NoiseSchedule, tau_dim: Option<usize>, eta: f64) -> Result<Self> {
        if !(0. ..=1.).contains(&eta) {
            return Err(SamplerError::InvalidSamplerParameters(format!(
                "eta must be in [0, 1], got {eta}"
            )));
        }
        let tau = timestep_subsequence(schedule.t(), tau_dim.unwrap_or(schedule.t()))?;
        let alpha_prods = schedule.alpha_prods();
        let alphas: Vec<f64> =
            std::iter::once(1.).chain(tau.iter().map(|&i| alpha_prods[i])).collect();
        let betas = alphas.iter().map(|alpha| 1. - alpha).collect();
        Ok(Self { schedule, denoiser: None, tau, alphas, betas, eta, options: kind::FLOAT_CPU })
    }

    pub fn from_config(schedule: &'a NoiseSchedule, config: &DDIMSamplerConfig) -> Result<Self> {
        Self::new(schedule, config.tau_dim, config.eta)
    }

    pub fn with_denoiser(mut self, denoiser: &'a dyn NoisePredictor) -> Self {
        self.denoiser = Some(denoiser);
        self
    }

    /// Kind and device of latents drawn when sampling from a shape.
    pub fn with_options(mut self, options: (Kind, Device)) -> Self {
        self.options = options;
        self
    }

    pub fn schedule(&self) -> &'a NoiseSchedule {
        self.schedule
    }

    pub fn denoiser(&self) -> Option<&'a dyn NoisePredictor> {
        self.denoiser
    }

    pub fn tau(&self) -> &[usize] {
        &self.tau
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    /// The number of sampling steps `S`.
    pub fn num_steps(&self) -> usize {
        self.tau.len()
    }

    /// Sampling steps in the order they are run, from `S` down to 1.
    pub fn steps(&self) -> impl Iterator<Item = usize> {
        (1..=self.num_steps()).rev()
    }

    /// The full schedule index that step `t` runs at.
    pub fn schedule_timestep(&self, t: usize) -> Result<usize> {
        self.check_step(t)?;
        Ok(self.tau[t - 1])
    }

    fn check_step(&self, t: usize) -> Result<()> {
        if t == 0 || t > self.num_steps() {
            return Err(SamplerError::StepOutOfRange { step: t, steps: self.num_steps() });
        }
        Ok(())
    }

    /// Standard deviation of the noise injected when going from `t` to `t - 1`.
    pub fn sigma(&self, t: usize) -> Result<f64> {
        self.check_step(t)?;
        if self.betas[t] == 0. {
            return Err(SamplerError::DegenerateScheduleStep { step: t });
        }
        let beta_ratio = self.betas[t - 1] / self.betas[t];
        let alpha_ratio = self.alphas[t] / self.alphas[t - 1];
        Ok(self.eta * (beta_ratio * (1. - alpha_ratio)).sqrt())
    }

    /// Moves the latent `xs` at step `t` to step `t - 1` given the predicted noise.
    pub fn denoise_step(
        &self,
        xs: &Tensor,
        t: usize,
        noise_pred: &Tensor,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> Result<Tensor> {
        let sigma = self.sigma(t)?;
        let (alpha_t, alpha_prev) = (self.alphas[t], self.alphas[t - 1]);
        let x0 = alpha_t.powf(-0.5) * (xs - self.betas[t].sqrt() * noise_pred);
        // Non-negative in exact arithmetic, rounding can push it slightly below.
        let direction = (1. - alpha_prev - sigma * sigma).max(0.).sqrt() * noise_pred;
        let prev = alpha_prev.sqrt() * x0 + direction;
        if sigma > 0. {
            Ok(prev + sigma * source.randn_like(xs))
        } else {
            Ok(prev)
        }
    }

    /// Runs the full reverse process, see [`Self::sample_with_callback`].
    pub fn sample(
        &self,
        initial: Option<&Tensor>,
        shape: Option<&[i64]>,
        context: Option<&Tensor>,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> Result<Tensor> {
        self.sample_with_callback(initial, shape, context, source, |_, _| ControlFlow::Continue(()))
    }

    /// Runs the reverse process from step `S` down to step 1, starting either
    /// from `initial` or from Gaussian noise of the given `shape`.
    ///
    /// `callback` is called with the step that was just run and the resulting
    /// latent, breaking out of it aborts the run with [`SamplerError::Cancelled`].
    pub fn sample_with_callback<F>(
        &self,
        initial: Option<&Tensor>,
        shape: Option<&[i64]>,
        context: Option<&Tensor>,
        source: &mut (impl NoiseSource + ?Sized),
        mut callback: F,
    ) -> Result<Tensor>
    where
        F: FnMut(usize, &Tensor) -> ControlFlow<()>,
    {
        let denoiser = self.denoiser.ok_or(SamplerError::MissingDenoiser)?;
        let mut latents = match (initial, shape) {
            (Some(initial), None) => initial.shallow_clone(),
            (None, Some(shape)) => source.randn(shape, self.options),
            _ => return Err(SamplerError::AmbiguousInitialization),
        };
        let batch = latents.size().first().copied().unwrap_or(1);
        tracing::info!(steps = self.num_steps(), eta = self.eta, shape = ?latents.size(), "sampling");
        for t in self.steps() {
            let timesteps = Tensor::full(&[batch], t as i64, (Kind::Int64, latents.device()));
            let noise_pred = denoiser.predict(&latents, &timesteps, context)?;
            latents = self.denoise_step(&latents, t, &noise_pred, source)?;
            tracing::debug!(step = t, timestep = self.tau[t - 1], "denoised");
            if callback(t, &latents).is_break() && t > 1 {
                return Err(SamplerError::Cancelled { step: t - 1 });
            }
        }
        Ok(latents)
    }
}
