use crate::models::{DiagonalGaussianDistribution, LatentCodec};
use crate::noise::NoiseSource;
use crate::schedulers::DDIMSampler;
use crate::SamplerError;
use tch::{Kind, Tensor};

/// Runs the diffusion process in the latent space of an autoencoder.
///
/// Latents seen by the sampler are the autoencoder latents multiplied by
/// `latent_scale`, which brings them close to unit variance.
pub struct LatentDiffusionPipeline<'a> {
    sampler: DDIMSampler<'a>,
    codec: &'a dyn LatentCodec,
    latent_scale: f64,
}

impl<'a> LatentDiffusionPipeline<'a> {
    pub fn new(sampler: DDIMSampler<'a>, codec: &'a dyn LatentCodec, latent_scale: f64) -> Self {
        Self { sampler, codec, latent_scale }
    }

    pub fn sampler(&self) -> &DDIMSampler<'a> {
        &self.sampler
    }

    pub fn latent_scale(&self) -> f64 {
        self.latent_scale
    }

    /// Samples scaled latents from the autoencoder posterior of `images`.
    pub fn encode(
        &self,
        images: &Tensor,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> anyhow::Result<Tensor> {
        let (mean, log_var) = self.codec.encode(images)?;
        let posterior = DiagonalGaussianDistribution::new(mean, log_var);
        Ok(posterior.sample(source) * self.latent_scale)
    }

    /// Samples latents, starting from `initial` or from noise of the given
    /// `shape`, and decodes them into images.
    pub fn generate(
        &self,
        initial: Option<&Tensor>,
        shape: Option<&[i64]>,
        context: Option<&Tensor>,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> anyhow::Result<Tensor> {
        let latents = self.sampler.sample(initial, shape, context, source)?;
        tracing::info!(std = latents.std(true).double_value(&[]), "decoding latents");
        self.codec.decode(&(latents / self.latent_scale))
    }

    /// Mean squared error of the noise predictions on `images`, noised with a
    /// single noise draw at each of the schedule indexes used by the sampler.
    pub fn loss_curve(
        &self,
        images: &Tensor,
        source: &mut (impl NoiseSource + ?Sized),
    ) -> anyhow::Result<Vec<f64>> {
        let denoiser = self.sampler.denoiser().ok_or(SamplerError::MissingDenoiser)?;
        let schedule = self.sampler.schedule();
        let latents = self.encode(images, source)?;
        let noise = source.randn_like(&latents);
        let batch = latents.size().first().copied().unwrap_or(1);
        let mut losses = Vec::with_capacity(self.sampler.num_steps());
        for &timestep in self.sampler.tau() {
            let noised = schedule.add_noise(&latents, &noise, timestep)?;
            let timesteps =
                Tensor::full(&[batch], timestep as i64, (Kind::Int64, latents.device()));
            let noise_pred = denoiser.predict(&noised, &timesteps, None)?;
            let loss = (noise_pred - &noise).square().mean(Kind::Double).double_value(&[]);
            tracing::debug!(timestep, loss, "noise prediction loss");
            losses.push(loss);
        }
        Ok(losses)
    }
}
