//! # Variance schedule
//!
//! Betas grow linearly in square-root space between `beta_min` and `beta_max`,
//! all the quantities used by the forward and reverse processes are derived
//! from them once at construction.
use crate::error::{Result, SamplerError};
use crate::noise::NoiseSource;
use tch::{kind, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    t: usize,
    beta_min: f64,
    beta_max: f64,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alpha_prods: Vec<f64>,
    signal_stds: Vec<f64>,
    noise_stds: Vec<f64>,
}

impl NoiseSchedule {
    /// Builds a schedule with `t` discrete diffusion steps.
    pub fn new(t: usize, beta_min: f64, beta_max: f64) -> Result<Self> {
        // Also rejects NaN bounds.
        let valid_betas = 0. < beta_min && beta_min < beta_max && beta_max < 1.;
        if t == 0 || !valid_betas {
            return Err(SamplerError::InvalidScheduleParameters { t, beta_min, beta_max });
        }
        let betas = Tensor::linspace(beta_min.sqrt(), beta_max.sqrt(), t as i64, kind::DOUBLE_CPU)
            .square();
        let alphas: Tensor = 1.0 - &betas;
        let alpha_prods = alphas.cumprod(0, Kind::Double);
        let signal_stds = alpha_prods.sqrt();
        let noise_vars: Tensor = 1.0 - &alpha_prods;
        let noise_stds = noise_vars.sqrt();
        let to_vec = |xs: &Tensor| Vec::<f64>::try_from(xs).map_err(anyhow::Error::from);
        Ok(Self {
            t,
            beta_min,
            beta_max,
            betas: to_vec(&betas)?,
            alphas: to_vec(&alphas)?,
            alpha_prods: to_vec(&alpha_prods)?,
            signal_stds: to_vec(&signal_stds)?,
            noise_stds: to_vec(&noise_stds)?,
        })
    }

    /// The number of diffusion steps `T`.
    pub fn t(&self) -> usize {
        self.t
    }

    pub fn beta_min(&self) -> f64 {
        self.beta_min
    }

    pub fn beta_max(&self) -> f64 {
        self.beta_max
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Cumulative products of the alphas, strictly decreasing.
    pub fn alpha_prods(&self) -> &[f64] {
        &self.alpha_prods
    }

    pub fn signal_stds(&self) -> &[f64] {
        &self.signal_stds
    }

    pub fn noise_stds(&self) -> &[f64] {
        &self.noise_stds
    }

    /// Noises `original` to schedule index `timestep`, which must be below `T`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        if timestep >= self.t {
            return Err(SamplerError::StepOutOfRange { step: timestep, steps: self.t });
        }
        Ok(self.signal_stds[timestep] * original + self.noise_stds[timestep] * noise)
    }

    /// Noises each element of the batch to its own schedule index, `timesteps`
    /// is an int64 tensor with one entry per batch element.
    pub fn add_noise_batched(&self, original: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Tensor {
        let mut shape = vec![1i64; original.dim().max(1)];
        shape[0] = -1;
        let gather = |stds: &[f64]| {
            Tensor::from_slice(stds)
                .to_device(original.device())
                .index_select(0, timesteps)
                .to_kind(original.kind())
                .view(shape.as_slice())
        };
        gather(&self.signal_stds) * original + gather(&self.noise_stds) * noise
    }

    /// Noises each batch element to a uniformly drawn schedule index, returns
    /// the noised batch along with the indexes and the noise that was used.
    pub fn noise_random(
        &self,
        original: &Tensor,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> (Tensor, Tensor, Tensor) {
        let batch = original.size().first().copied().unwrap_or(1);
        let noise = source.randn_like(original);
        let timesteps = source.randint(self.t as i64, batch, original.device());
        let noised = self.add_noise_batched(original, &noise, &timesteps);
        (noised, timesteps, noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::SeededNoise;
    use tch::Device;

    #[test]
    fn invalid_parameters() {
        for (t, lo, hi) in [
            (0, 1e-4, 2e-2),
            (10, 0., 2e-2),
            (10, 2e-2, 1e-4),
            (10, 1e-2, 1e-2),
            (10, 1e-4, 1.),
            (10, f64::NAN, 2e-2),
        ] {
            let err = NoiseSchedule::new(t, lo, hi).unwrap_err();
            assert!(matches!(err, SamplerError::InvalidScheduleParameters { .. }), "{err}");
        }
    }

    #[test]
    fn schedule_invariants_hold_for_valid_parameters() {
        for (t, lo, hi) in [(2, 1e-4, 2e-2), (10, 0.5, 0.999), (37, 1e-6, 1e-5), (500, 0.1, 0.9)] {
            let schedule = NoiseSchedule::new(t, lo, hi).unwrap();
            assert_eq!(schedule.alpha_prods().len(), t);
            for w in schedule.alpha_prods().windows(2) {
                assert!(w[0] > w[1], "T={t} [{lo}, {hi}]");
            }
            for (s, n) in schedule.signal_stds().iter().zip(schedule.noise_stds()) {
                assert!((s * s + n * n - 1.).abs() < 1e-12, "T={t} [{lo}, {hi}]");
            }
        }
    }

    #[test]
    fn add_noise_rejects_timestep_past_schedule() {
        let schedule = NoiseSchedule::new(1000, 1e-4, 2e-2).unwrap();
        let xs = Tensor::ones(&[2, 3], (Kind::Double, Device::Cpu));
        let noise = xs.zeros_like();
        for timestep in [1000, 5000] {
            let err = schedule.add_noise(&xs, &noise, timestep).unwrap_err();
            assert!(matches!(err, SamplerError::StepOutOfRange { step, steps: 1000 } if step == timestep));
        }
        let last = schedule.add_noise(&xs, &noise, 999).unwrap();
        assert!((last.double_value(&[0, 0]) - schedule.signal_stds()[999]).abs() < 1e-12);
    }

    #[test]
    fn derived_arrays() {
        let schedule = NoiseSchedule::new(1000, 1e-4, 2e-2).unwrap();
        assert_eq!(schedule.betas().len(), 1000);
        assert!((schedule.betas()[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas()[999] - 2e-2).abs() < 1e-12);
        for i in [1usize, 250, 500, 998] {
            let expected =
                (1e-4f64.sqrt() + i as f64 / 999. * (2e-2f64.sqrt() - 1e-4f64.sqrt())).powi(2);
            assert!((schedule.betas()[i] - expected).abs() < 1e-12);
            assert!((schedule.alphas()[i] - (1. - expected)).abs() < 1e-12);
        }
        for w in schedule.betas().windows(2) {
            assert!(w[0] < w[1]);
        }
        for w in schedule.alpha_prods().windows(2) {
            assert!(w[0] > w[1]);
        }
        assert!((schedule.alpha_prods()[0] - (1. - 1e-4)).abs() < 1e-12);
        for (s, n) in schedule.signal_stds().iter().zip(schedule.noise_stds()) {
            assert!((s * s + n * n - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn single_step_schedule() {
        let schedule = NoiseSchedule::new(1, 0.1, 0.2).unwrap();
        assert_eq!(schedule.betas().len(), 1);
        assert!((schedule.betas()[0] - 0.1).abs() < 1e-12);
        assert!((schedule.alpha_prods()[0] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn batched_noise_matches_scalar_noise() {
        let schedule = NoiseSchedule::new(100, 1e-4, 2e-2).unwrap();
        let mut source = SeededNoise::new(3);
        let options = (Kind::Double, Device::Cpu);
        let original = source.randn(&[2, 3, 4, 4], options);
        let noise = source.randn(&[2, 3, 4, 4], options);
        let timesteps = Tensor::from_slice(&[7i64, 93]);
        let batched = schedule.add_noise_batched(&original, &noise, &timesteps);
        for (idx, t) in [7usize, 93].into_iter().enumerate() {
            let idx = idx as i64;
            let expected = schedule.add_noise(&original.get(idx), &noise.get(idx), t).unwrap();
            assert!(batched.get(idx).allclose(&expected, 1e-12, 1e-12, false));
        }
    }

    #[test]
    fn noise_random_returns_consistent_triplet() {
        let schedule = NoiseSchedule::new(50, 1e-4, 2e-2).unwrap();
        let mut source = SeededNoise::new(11);
        let original = Tensor::ones(&[4, 2, 3], (Kind::Double, Device::Cpu));
        let (noised, timesteps, noise) = schedule.noise_random(&original, &mut source);
        assert_eq!(noised.size(), vec![4, 2, 3]);
        assert_eq!(timesteps.size(), vec![4]);
        let expected = schedule.add_noise_batched(&original, &noise, &timesteps);
        assert!(noised.allclose(&expected, 1e-12, 1e-12, false));
    }

    #[test]
    fn noise_random_on_scalar() {
        let schedule = NoiseSchedule::new(50, 1e-4, 2e-2).unwrap();
        let original = Tensor::ones(&[], (Kind::Double, Device::Cpu));
        let (noised, timesteps, _) = schedule.noise_random(&original, &mut SeededNoise::new(2));
        assert_eq!(timesteps.size(), vec![1]);
        assert_eq!(noised.numel(), 1);
    }
}
