use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Distribution, ElementConversion, Tensor,
};
use tracing::info;

use super::codec::LatentCodec;
use super::embedder::TextEmbeddings;
use super::sampler::{check_guidance_scale, GuidedSampler};
use crate::error::{Error, Result};
use crate::model::autoencoder::Autoencoder;
use crate::model::resample::resize_bilinear;
use crate::model::unet::NoisePredictor;

/// Result of one score-distillation step.
pub struct DistillOutput<B: AutodiffBackend> {
    /// Gradients of the injected residual with respect to every tracked
    /// tensor upstream of the pixels, ready for an optimizer step.
    pub gradients: B::Gradients,
    pub timestep: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreDistiller {
    min_step: usize,
    max_step: usize,
    resolution: usize,
}

impl ScoreDistiller {
    pub fn new(
        min_step_fraction: f64,
        max_step_fraction: f64,
        resolution: usize,
        num_train_timesteps: usize,
    ) -> Self {
        let to_step = |fraction: f64| {
            ((fraction * num_train_timesteps as f64).round() as usize)
                .min(num_train_timesteps.saturating_sub(1))
        };

        Self {
            min_step: to_step(min_step_fraction),
            max_step: to_step(max_step_fraction),
            resolution,
        }
    }

    /// The inclusive range random timesteps are drawn from.
    pub fn step_range(&self) -> (usize, usize) {
        (self.min_step, self.max_step)
    }

    /// Validates an explicit timestep or draws one uniformly from the step range.
    pub fn choose_timestep<B: Backend>(
        &self,
        timestep: Option<usize>,
        num_train_timesteps: usize,
        device: &B::Device,
    ) -> Result<usize> {
        match timestep {
            Some(t) if t >= num_train_timesteps => Err(Error::invalid_input(format!(
                "timestep {} is outside [0, {})",
                t, num_train_timesteps
            ))),
            Some(t) => Ok(t),
            None => {
                let draw: f64 = Tensor::<B, 1>::random(
                    [1],
                    Distribution::Uniform(self.min_step as f64, (self.max_step + 1) as f64),
                    device,
                )
                .into_scalar()
                .elem();

                Ok((draw.floor() as usize).clamp(self.min_step, self.max_step))
            }
        }
    }

    /// Pushes `pixels` towards what the prior finds plausible for `embeddings`.
    ///
    /// The denoiser is evaluated without a graph. Its guided residual is
    /// seeded as the upstream gradient of the encoded latents, so the returned
    /// gradients only cover the resize and the encoder.
    pub fn step<B, A, N>(
        &self,
        codec: &LatentCodec<B, A>,
        sampler: &GuidedSampler<B, N>,
        embeddings: &TextEmbeddings<B>,
        pixels: Tensor<B, 4>,
        guidance_scale: f64,
        timestep: Option<usize>,
    ) -> Result<DistillOutput<B>>
    where
        B: AutodiffBackend,
        A: Autoencoder<B>,
        N: NoisePredictor<B>,
    {
        let [n_batch, n_channel, _, _] = pixels.dims();
        if n_channel != 3 {
            return Err(Error::shape_mismatch(format!(
                "pixels must have 3 channels, got {}",
                n_channel
            )));
        }
        if n_batch != embeddings.num_prompts() {
            return Err(Error::shape_mismatch(format!(
                "pixel batch {} does not match {} prompts",
                n_batch,
                embeddings.num_prompts()
            )));
        }

        check_guidance_scale(guidance_scale)?;

        let schedule = sampler.schedule();
        let timestep =
            self.choose_timestep::<B>(timestep, schedule.num_train_timesteps(), &pixels.device())?;
        let alpha = schedule.alpha_cumprod(timestep)?;

        info!(timestep, guidance_scale, "score distillation step");

        let pixels = resize_bilinear(pixels, [self.resolution, self.resolution])?;
        let latents = codec.encode_images(pixels)?;

        let noise = Tensor::random(latents.shape(), Distribution::Normal(0.0, 1.0), &latents.device());
        let noisy = schedule.add_noise(latents.clone().detach(), noise.clone(), timestep)?;
        let pred_noise = sampler.guided_noise(embeddings, noisy, timestep, guidance_scale)?;

        let grad = ((pred_noise - noise) * (1.0 - alpha)).detach();
        let gradients = (latents * grad).sum().backward();

        Ok(DistillOutput { gradients, timestep })
    }
}
