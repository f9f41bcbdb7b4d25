//! # Variational Auto-Encoder
//!
//! Images are compressed into latents through the posterior distribution
//! returned by the encoder, the decoder maps latents back to images.
use crate::noise::NoiseSource;
use anyhow::Context;
use std::path::Path;
use tch::{CModule, Device, Tensor};

pub trait LatentCodec {
    /// Returns the mean and log-variance of the latent posterior.
    fn encode(&self, images: &Tensor) -> anyhow::Result<(Tensor, Tensor)>;

    fn decode(&self, latents: &Tensor) -> anyhow::Result<Tensor>;
}

#[derive(Debug)]
pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    log_var: Tensor,
    std: Tensor,
}

impl DiagonalGaussianDistribution {
    pub fn new(mean: Tensor, log_var: Tensor) -> Self {
        let std = (&log_var * 0.5).exp();
        Self { mean, log_var, std }
    }

    /// Splits stacked `[mean, log_var]` parameters along the channel dimension.
    pub fn from_parameters(parameters: &Tensor) -> anyhow::Result<Self> {
        let channels = parameters.size().get(1).copied().unwrap_or(0);
        if channels == 0 || channels % 2 != 0 {
            anyhow::bail!("expected an even number of channels, got {:?}", parameters.size())
        }
        let mut parameters = parameters.chunk(2, 1).into_iter();
        match (parameters.next(), parameters.next()) {
            (Some(mean), Some(log_var)) => Ok(Self::new(mean, log_var)),
            _ => anyhow::bail!("unable to split posterior parameters"),
        }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn log_var(&self) -> &Tensor {
        &self.log_var
    }

    pub fn sample(&self, source: &mut (impl NoiseSource + ?Sized)) -> Tensor {
        let eps = source.randn_like(&self.mean);
        &self.mean + &self.std * eps
    }

    /// KL divergence to the standard normal, averaged over the batch.
    pub fn kl(&self) -> f64 {
        let batch = self.mean.size().first().copied().unwrap_or(1).max(1) as f64;
        let kl = (self.mean.square() + self.log_var.exp() - &self.log_var - 1.).sum(self.mean.kind());
        0.5 * kl.double_value(&[]) / batch
    }
}

/// An autoencoder whose encoder and decoder were exported separately to
/// TorchScript. The encoder returns stacked `[mean, log_var]` channels.
pub struct TorchScriptAutoEncoder {
    encoder: Option<CModule>,
    decoder: CModule,
    device: Device,
}

fn load_module(path: &Path, device: Device) -> anyhow::Result<CModule> {
    CModule::load_on_device(path, device)
        .with_context(|| format!("error loading module from {:?}", path.to_string_lossy()))
}

impl TorchScriptAutoEncoder {
    pub fn new<P: AsRef<Path>>(
        encoder: Option<P>,
        decoder: P,
        device: Device,
    ) -> anyhow::Result<Self> {
        let encoder = match encoder {
            Some(path) => Some(load_module(path.as_ref(), device)?),
            None => None,
        };
        let decoder = load_module(decoder.as_ref(), device)?;
        Ok(Self { encoder, decoder, device })
    }
}

impl LatentCodec for TorchScriptAutoEncoder {
    fn encode(&self, images: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let encoder = match &self.encoder {
            Some(encoder) => encoder,
            None => anyhow::bail!("no encoder was loaded"),
        };
        let images = images.to_device(self.device);
        let parameters = tch::no_grad(|| encoder.forward_ts(&[&images]))?;
        let posterior = DiagonalGaussianDistribution::from_parameters(&parameters)?;
        Ok((posterior.mean, posterior.log_var))
    }

    fn decode(&self, latents: &Tensor) -> anyhow::Result<Tensor> {
        let latents = latents.to_device(self.device);
        Ok(tch::no_grad(|| self.decoder.forward_ts(&[&latents]))?)
    }
}
