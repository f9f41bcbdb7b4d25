//! # Random sources
//!
//! The samplers only ever draw standard Gaussian noise (and uniform timesteps
//! when noising training batches). Abstracting the source lets callers pick
//! between libtorch's global generator and a locally seeded one.
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tch::{Device, Kind, Tensor};

pub trait NoiseSource {
    /// Draws standard Gaussian samples with the given shape and options.
    fn randn(&mut self, shape: &[i64], options: (Kind, Device)) -> Tensor;

    /// Draws `size` integers uniformly from `[0, high)` as an int64 tensor.
    fn randint(&mut self, high: i64, size: i64, device: Device) -> Tensor;

    fn randn_like(&mut self, xs: &Tensor) -> Tensor {
        self.randn(&xs.size(), (xs.kind(), xs.device()))
    }
}

/// Uses the process-wide libtorch generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TorchNoise;

impl TorchNoise {
    /// Seeds the global libtorch generator, this affects every other user of it.
    pub fn seeded(seed: i64) -> Self {
        tch::manual_seed(seed);
        Self
    }
}

impl NoiseSource for TorchNoise {
    fn randn(&mut self, shape: &[i64], options: (Kind, Device)) -> Tensor {
        Tensor::randn(shape, options)
    }

    fn randint(&mut self, high: i64, size: i64, device: Device) -> Tensor {
        Tensor::randint(high, &[size], (Kind::Int64, device))
    }
}

/// A generator owned by the caller, runs using the same seed draw the same
/// values regardless of what other threads are doing.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl NoiseSource for SeededNoise {
    fn randn(&mut self, shape: &[i64], (kind, device): (Kind, Device)) -> Tensor {
        let numel: i64 = shape.iter().product();
        let values: Vec<f64> =
            (0..numel).map(|_| StandardNormal.sample(&mut self.rng)).collect();
        Tensor::from_slice(&values).view(shape).to_kind(kind).to_device(device)
    }

    fn randint(&mut self, high: i64, size: i64, device: Device) -> Tensor {
        let values: Vec<i64> = (0..size).map(|_| self.rng.gen_range(0..high)).collect();
        Tensor::from_slice(&values).to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_noise_is_reproducible() {
        let options = (Kind::Double, Device::Cpu);
        let xs = SeededNoise::new(42).randn(&[2, 3, 4], options);
        let ys = SeededNoise::new(42).randn(&[2, 3, 4], options);
        let zs = SeededNoise::new(43).randn(&[2, 3, 4], options);
        assert_eq!(xs.size(), vec![2, 3, 4]);
        assert!(xs.equal(&ys));
        assert!(!xs.equal(&zs));
    }

    #[test]
    fn seeded_noise_randint_in_range() {
        let mut source = SeededNoise::new(0);
        let ts = Vec::<i64>::try_from(&source.randint(7, 64, Device::Cpu)).unwrap();
        assert_eq!(ts.len(), 64);
        assert!(ts.iter().all(|&t| (0..7).contains(&t)));
    }

    #[test]
    fn randn_like_matches_shape_and_kind() {
        let xs = Tensor::zeros(&[3, 5], (Kind::Float, Device::Cpu));
        let noise = SeededNoise::new(1).randn_like(&xs);
        assert_eq!(noise.size(), vec![3, 5]);
        assert_eq!(noise.kind(), Kind::Float);
    }
}
