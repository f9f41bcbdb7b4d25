//! # Noise predictors
//!
//! The sampler only needs something that estimates the noise contained in a
//! noisy latent. Networks exported to TorchScript can be used directly, any
//! closure with the right signature works too.
use anyhow::Context;
use std::path::Path;
use tch::{CModule, Device, Tensor};

pub trait NoisePredictor {
    /// Returns the predicted noise, same shape as `latents`. `timesteps` holds
    /// one int64 entry per batch element. Must not use internal randomness.
    fn predict(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        context: Option<&Tensor>,
    ) -> anyhow::Result<Tensor>;
}

impl<F> NoisePredictor for F
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> anyhow::Result<Tensor>,
{
    fn predict(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        context: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        self(latents, timesteps, context)
    }
}

/// A UNet exported with `torch.jit.trace` or `torch.jit.script`, called as
/// `module(latents, timesteps)` or `module(latents, timesteps, context)`.
#[derive(Debug)]
pub struct TorchScriptUNet {
    module: CModule,
    device: Device,
}

impl TorchScriptUNet {
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let module = CModule::load_on_device(path, device)
            .with_context(|| format!("error loading unet from {:?}", path.to_string_lossy()))?;
        Ok(Self { module, device })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl NoisePredictor for TorchScriptUNet {
    fn predict(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        context: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        let latents = latents.to_device(self.device);
        let timesteps = timesteps.to_device(self.device);
        let output = tch::no_grad(|| match context {
            Some(context) => {
                let context = context.to_device(self.device);
                self.module.forward_ts(&[&latents, &timesteps, &context])
            }
            None => self.module.forward_ts(&[&latents, &timesteps]),
        })?;
        if output.size() != latents.size() {
            anyhow::bail!(
                "unet returned shape {:?} for latents of shape {:?}",
                output.size(),
                latents.size()
            )
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn closures_are_predictors() {
        let predictor = |xs: &Tensor, ts: &Tensor, _: Option<&Tensor>| -> anyhow::Result<Tensor> {
            Ok(xs * ts.double_value(&[0]))
        };
        let xs = Tensor::ones(&[2, 3], (Kind::Double, Device::Cpu));
        let ts = Tensor::from_slice(&[4i64, 4]);
        let noise = predictor.predict(&xs, &ts, None).unwrap();
        assert_eq!(noise.double_value(&[1, 2]), 4.);
    }

    #[test]
    fn missing_torchscript_file() {
        let err = TorchScriptUNet::load("does/not/exist.pt", Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.pt"));
    }
}
