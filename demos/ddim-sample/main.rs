// Latent diffusion sampling with DDIM.
//
// The noise predictor and the autoencoder decoder are TorchScript exports, e.g.
// from python:
//
//   unet = torch.jit.trace(unet, (latents, timesteps, context))
//   unet.save("data/unet.pt")
//   decoder = torch.jit.trace(vae.decoder, (latents,))
//   decoder.save("data/vae_decoder.pt")
//
// The unet is called with the sampling step in 1..=n_steps as its timestep.
// A context tensor saved with `torch.save` in a TorchScript-readable format can
// be passed with --context, --uncond-context enables classifier-free guidance.
//
//   cargo run --release --features clap,tracing-subscriber --example ddim-sample -- \
//     --unet data/unet.pt --vae-decoder data/vae_decoder.pt --n-steps 20
use anyhow::Context;
use clap::Parser;
use latent_diffusion::{
    models::{NoisePredictor, TorchScriptAutoEncoder, TorchScriptUNet},
    noise::TorchNoise,
    pipelines::{ClassifierFreeGuidance, LatentDiffusionPipeline},
    schedulers::{DDIMSampler, DDIMSamplerConfig},
    utils::{to_image_bytes, DeviceSetup},
};
use tch::{Kind, Tensor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The TorchScript noise predictor.
    #[arg(long, value_name = "FILE")]
    unet: String,

    /// The TorchScript autoencoder decoder, latents are only summarized when unset.
    #[arg(long, value_name = "FILE")]
    vae_decoder: Option<String>,

    /// A JSON file with the schedule and sampler configuration.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// The number of steps to run the diffusion for, overrides the configuration.
    #[arg(long)]
    n_steps: Option<usize>,

    /// The amount of noise injected at each step, overrides the configuration.
    #[arg(long)]
    eta: Option<f64>,

    /// The conditioning context, a tensor file readable with `Tensor::load`.
    #[arg(long, value_name = "FILE")]
    context: Option<String>,

    /// The unconditional context used for classifier-free guidance.
    #[arg(long, value_name = "FILE")]
    uncond_context: Option<String>,

    #[arg(long, default_value_t = 5.)]
    guidance_scale: f64,

    /// The latents are scaled by this factor in the diffusion space.
    #[arg(long, default_value_t = 1.)]
    latent_scale: f64,

    #[arg(long, default_value_t = 4)]
    num_samples: i64,

    #[arg(long, default_value_t = 4)]
    latent_channels: i64,

    /// The height of the latents, images are larger by the autoencoder factor.
    #[arg(long, default_value_t = 32)]
    height: i64,

    #[arg(long, default_value_t = 32)]
    width: i64,

    /// The random seed to be used for the generation.
    #[arg(long, default_value_t = 32)]
    seed: i64,

    /// When set, use the CPU for the listed devices, can be 'all', 'unet', 'vae'.
    #[arg(long)]
    cpu: Vec<String>,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "ddim_final.png")]
    final_image: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let devices = DeviceSetup::new(args.cpu.clone());
    let unet_device = devices.get("unet");

    let mut config = match &args.config {
        Some(path) => DDIMSamplerConfig::from_json_file(path)?,
        None => DDIMSamplerConfig::default(),
    };
    if let Some(n_steps) = args.n_steps {
        config.tau_dim = Some(n_steps)
    }
    if let Some(eta) = args.eta {
        config.eta = eta
    }
    tracing::info!(?config, "building the sampler");
    let schedule = config.build_schedule()?;

    let load = |path: &Option<String>| -> anyhow::Result<Option<Tensor>> {
        match path {
            Some(path) => {
                let tensor = Tensor::load(path).with_context(|| format!("loading {path}"))?;
                Ok(Some(tensor.to_device(unet_device)))
            }
            None => Ok(None),
        }
    };
    let context = load(&args.context)?;
    let uncond_context = load(&args.uncond_context)?;

    let unet = TorchScriptUNet::load(&args.unet, unet_device)?;
    let guided = uncond_context
        .map(|uncond| ClassifierFreeGuidance::new(&unet, uncond, args.guidance_scale));
    let denoiser: &dyn NoisePredictor = match &guided {
        Some(guided) if context.is_some() => guided,
        _ => &unet,
    };
    let sampler = DDIMSampler::from_config(&schedule, &config)?
        .with_denoiser(denoiser)
        .with_options((Kind::Float, unet_device));

    tracing::info!(seed = args.seed, "seeding the torch generator");
    let mut source = TorchNoise::seeded(args.seed);
    let shape = [args.num_samples, args.latent_channels, args.height, args.width];

    let no_grad_guard = tch::no_grad_guard();
    match &args.vae_decoder {
        Some(vae_decoder) => {
            let vae = TorchScriptAutoEncoder::new(None, vae_decoder, devices.get("vae"))?;
            let pipeline = LatentDiffusionPipeline::new(sampler, &vae, args.latent_scale);
            let images = pipeline.generate(None, Some(&shape[..]), context.as_ref(), &mut source)?;
            let images = to_image_bytes(&images);
            let final_image = &args.final_image;
            tracing::info!(?final_image, shape = ?images.size(), "saving images");
            let grid = Tensor::cat(&images.chunk(images.size()[0], 0)[..], 3).squeeze_dim(0);
            tch::vision::image::save(&grid, final_image)?;
        }
        None => {
            let latents = sampler.sample(None, Some(&shape[..]), context.as_ref(), &mut source)?;
            let latents = latents.to_kind(Kind::Double);
            tracing::info!(
                mean = latents.mean(Kind::Double).double_value(&[]),
                std = latents.std(true).double_value(&[]),
                shape = ?latents.size(),
                "sampled latents"
            );
        }
    }
    drop(no_grad_guard);
    Ok(())
}
