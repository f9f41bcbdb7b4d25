//! Errors raised while building schedules and running the sampler.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SamplerError>;

#[derive(Error, Debug)]
pub enum SamplerError {
    /// The schedule requires `t >= 1` and `0 < beta_min < beta_max < 1`.
    #[error("invalid schedule parameters t={t} beta_min={beta_min} beta_max={beta_max}")]
    InvalidScheduleParameters { t: usize, beta_min: f64, beta_max: f64 },

    #[error("invalid sampler parameters: {0}")]
    InvalidSamplerParameters(String),

    #[error("exactly one of an initial latent or a latent shape must be provided")]
    AmbiguousInitialization,

    /// A compressed beta is zero where the transition divides by it.
    #[error("degenerate schedule at step {step}, beta is zero")]
    DegenerateScheduleStep { step: usize },

    #[error("step {step} is outside of 1..={steps}")]
    StepOutOfRange { step: usize, steps: usize },

    #[error("no noise predictor attached to the sampler")]
    MissingDenoiser,

    #[error("sampling cancelled before step {step}")]
    Cancelled { step: usize },

    /// Failures of the noise predictor or the autoencoder, unchanged.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
