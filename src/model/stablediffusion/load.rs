use std::path::Path;

use burn::{config::Config, tensor::backend::Backend};
use tracing::info;

use super::{PriorConfig, StableDiffusion};
use crate::error::{Error, Result};
use crate::model::{
    autoencoder::Autoencoder,
    clip::TextEncoder,
    load::{load_usize, load_values},
    scheduler::{NoiseSchedule, SchedulerConfig},
    unet::NoisePredictor,
};
use crate::token::Tokenizer;

fn exists(path: &str, file: &str) -> bool {
    Path::new(path).join(file).is_file()
}

/// Reads `<path>/prior.cfg`, falling back to the defaults when it is absent.
pub fn load_config(path: &str) -> Result<PriorConfig> {
    if !exists(path, "prior.cfg") {
        return Ok(PriorConfig::new());
    }

    let config = PriorConfig::load(format!("{}/prior.cfg", path))?;
    config.validate()?;
    Ok(config)
}

/// Uses the `alphas_cumprod` dump in `path` when there is one, otherwise
/// builds the schedule from `config`.
pub fn load_noise_schedule(path: &str, config: &SchedulerConfig) -> Result<NoiseSchedule> {
    if !exists(path, "alphas_cumprod.npy") {
        return config.init_schedule();
    }

    let alphas_cumprod = load_values("alphas_cumprod", path)?;
    if exists(path, "n_steps.npy") {
        let n_steps = load_usize("n_steps", path)?;
        if n_steps != alphas_cumprod.len() {
            return Err(Error::Config(format!(
                "n_steps is {} but alphas_cumprod has {} entries",
                n_steps,
                alphas_cumprod.len()
            )));
        }
    }

    NoiseSchedule::from_alphas_cumprod(alphas_cumprod)
}

/// Assembles the prior from the config and schedule stored in `path` and the
/// caller's networks.
pub fn load_stable_diffusion<B, T, E, A, N>(
    path: &str,
    tokenizer: T,
    text_encoder: E,
    autoencoder: A,
    unet: N,
    device: &B::Device,
) -> Result<StableDiffusion<B, T, E, A, N>>
where
    B: Backend,
    T: Tokenizer,
    E: TextEncoder<B>,
    A: Autoencoder<B>,
    N: NoisePredictor<B>,
{
    info!(path, "loading diffusion prior");

    let config = load_config(path)?;
    let schedule = load_noise_schedule(path, &config.scheduler)?;

    StableDiffusion::with_noise_schedule(
        &config,
        schedule,
        tokenizer,
        text_encoder,
        autoencoder,
        unet,
        device.clone(),
    )
}
