//! Classifier-free guidance, layered on top of a noise predictor.
use crate::models::NoisePredictor;
use tch::Tensor;

/// Runs the conditional and unconditional predictions as a single batch and
/// extrapolates from the unconditional one:
/// `uncond + scale * (cond - uncond)`.
pub struct ClassifierFreeGuidance<'a> {
    predictor: &'a dyn NoisePredictor,
    uncond_context: Tensor,
    scale: f64,
}

impl<'a> ClassifierFreeGuidance<'a> {
    /// `uncond_context` must broadcast to the conditional context, typically
    /// the embedding of an empty prompt with a batch size of one. Contexts with
    /// a batch size of one are repeated over the latent batch.
    pub fn new(predictor: &'a dyn NoisePredictor, uncond_context: Tensor, scale: f64) -> Self {
        Self { predictor, uncond_context, scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl NoisePredictor for ClassifierFreeGuidance<'_> {
    fn predict(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        context: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        let context = match context {
            Some(context) => context,
            None => return self.predictor.predict(latents, timesteps, None),
        };
        let context = expand_batch(context, latents.size().first().copied().unwrap_or(1));
        let uncond_context = self.uncond_context.to_device(context.device()).expand_as(&context);
        let latents = Tensor::cat(&[latents, latents], 0);
        let timesteps = Tensor::cat(&[timesteps, timesteps], 0);
        let context = Tensor::cat(&[&uncond_context, &context], 0);
        let noise_pred = self.predictor.predict(&latents, &timesteps, Some(&context))?;
        let noise_pred = noise_pred.chunk(2, 0);
        let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
        Ok(noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * self.scale)
    }
}

// A context with a batch of one is shared by every latent.
fn expand_batch(context: &Tensor, batch: i64) -> Tensor {
    let mut size = context.size();
    if size.first() == Some(&1) && batch != 1 {
        size[0] = batch;
        context.expand(size.as_slice(), false)
    } else {
        context.shallow_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    // Predicts the context value, broadcast over the latent dimensions.
    fn echo_context(xs: &Tensor, _: &Tensor, ctx: Option<&Tensor>) -> anyhow::Result<Tensor> {
        match ctx {
            Some(ctx) => {
                if ctx.size()[0] != xs.size()[0] {
                    anyhow::bail!("context batch {:?} for latents {:?}", ctx.size(), xs.size())
                }
                Ok(xs.ones_like() * ctx)
            }
            None => Ok(xs.ones_like() * -1.),
        }
    }

    #[test]
    fn extrapolates_from_unconditional() {
        let options = (Kind::Double, Device::Cpu);
        let uncond = Tensor::zeros(&[1, 1], options);
        let guided = ClassifierFreeGuidance::new(&echo_context, uncond, 7.5);
        let xs = Tensor::zeros(&[2, 3], options);
        let ts = Tensor::from_slice(&[5i64, 5]);
        let cond = Tensor::ones(&[2, 1], options);
        let noise_pred = guided.predict(&xs, &ts, Some(&cond)).unwrap();
        assert_eq!(noise_pred.size(), vec![2, 3]);
        assert!(noise_pred.allclose(&Tensor::full(&[2, 3], 7.5, options), 1e-12, 1e-12, false));
    }

    #[test]
    fn unit_scale_is_conditional_prediction() {
        let options = (Kind::Double, Device::Cpu);
        let guided = ClassifierFreeGuidance::new(&echo_context, Tensor::full(&[1, 1], 3., options), 1.);
        let xs = Tensor::zeros(&[1, 4], options);
        let ts = Tensor::from_slice(&[1i64]);
        let cond = Tensor::full(&[1, 1], 0.25, options);
        let noise_pred = guided.predict(&xs, &ts, Some(&cond)).unwrap();
        assert!(noise_pred.allclose(&Tensor::full(&[1, 4], 0.25, options), 1e-12, 1e-12, false));
    }

    #[test]
    fn no_context_delegates() {
        let options = (Kind::Double, Device::Cpu);
        let guided = ClassifierFreeGuidance::new(&echo_context, Tensor::zeros(&[1, 1], options), 5.);
        let xs = Tensor::zeros(&[2, 2], options);
        let noise_pred = guided.predict(&xs, &Tensor::from_slice(&[1i64, 1]), None).unwrap();
        assert!(noise_pred.allclose(&Tensor::full(&[2, 2], -1., options), 1e-12, 1e-12, false));
    }

    #[test]
    fn single_prompt_is_shared_by_the_latent_batch() {
        let options = (Kind::Double, Device::Cpu);
        let uncond = Tensor::full(&[1, 1], 0.5, options);
        let guided = ClassifierFreeGuidance::new(&echo_context, uncond, 3.);
        let xs = Tensor::zeros(&[4, 3], options);
        let ts = Tensor::from_slice(&[2i64, 2, 2, 2]);
        let cond = Tensor::full(&[1, 1], 1.5, options);
        let noise_pred = guided.predict(&xs, &ts, Some(&cond)).unwrap();
        // 0.5 + 3 * (1.5 - 0.5)
        assert!(noise_pred.allclose(&Tensor::full(&[4, 3], 3.5, options), 1e-12, 1e-12, false));
    }
}
