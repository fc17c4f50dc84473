use std::marker::PhantomData;

use burn::tensor::{backend::Backend, Distribution, Tensor};
use tracing::{debug, info};

use super::embedder::TextEmbeddings;
use super::SamplingConfig;
use crate::error::{Error, Result};
use crate::model::scheduler::{NoiseSchedule, Scheduler, SchedulerConfig};
use crate::model::unet::NoisePredictor;

/// `uncond + (cond - uncond) * guidance_scale`.
pub fn classifier_free_guidance<B: Backend>(
    unconditional: Tensor<B, 4>,
    conditional: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    unconditional.clone() + (conditional - unconditional) * guidance_scale
}

/// Guidance scales must be finite and non-negative.
pub fn check_guidance_scale(guidance_scale: f64) -> Result<()> {
    if guidance_scale.is_finite() && guidance_scale >= 0.0 {
        Ok(())
    } else {
        Err(Error::invalid_input(format!(
            "guidance scale must be finite and non-negative, got {}",
            guidance_scale
        )))
    }
}

/// Runs the denoiser under classifier-free guidance, from noise to a clean latent.
pub struct GuidedSampler<B: Backend, N: NoisePredictor<B>> {
    unet: N,
    schedule: NoiseSchedule,
    scheduler: SchedulerConfig,
    latent_channels: usize,
    downsample_factor: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend, N: NoisePredictor<B>> GuidedSampler<B, N> {
    pub fn new(
        unet: N,
        schedule: NoiseSchedule,
        scheduler: SchedulerConfig,
        latent_channels: usize,
        downsample_factor: usize,
    ) -> Self {
        Self {
            unet,
            schedule,
            scheduler,
            latent_channels,
            downsample_factor,
            _backend: PhantomData,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Denoises `latent`, or fresh Gaussian noise of shape
    /// `[n_prompts, c, height / 8, width / 8]` when none is given.
    pub fn sample_latents(
        &self,
        embeddings: &TextEmbeddings<B>,
        config: &SamplingConfig,
        latent: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>> {
        let n_steps = config.num_inference_steps;
        let n_train_steps = self.schedule.num_train_timesteps();
        if n_steps > n_train_steps {
            return Err(Error::invalid_input(format!(
                "num_inference_steps must be in [0, {}], got {}",
                n_train_steps, n_steps
            )));
        }
        check_guidance_scale(config.guidance_scale)?;

        let n_prompts = embeddings.num_prompts();
        let latent = match latent {
            Some(latent) => {
                let [n_batch, n_channel, _, _] = latent.dims();
                if n_batch != n_prompts || n_channel != self.latent_channels {
                    return Err(Error::shape_mismatch(format!(
                        "initial latent {:?} does not fit {} prompts with {} latent channels",
                        latent.dims(),
                        n_prompts,
                        self.latent_channels
                    )));
                }
                latent
            }
            None => self.gen_noise(embeddings, n_prompts, config.height, config.width)?,
        };

        info!(
            n_prompts,
            n_steps,
            guidance_scale = config.guidance_scale,
            "sampling latents"
        );

        let mut scheduler = self.scheduler.build::<B>(&self.schedule, n_steps)?;
        self.denoise(embeddings, latent, config.guidance_scale, scheduler.as_mut())
    }

    /// Walks every timestep of `scheduler` in order, feeding each step's
    /// output into the next.
    pub fn denoise(
        &self,
        embeddings: &TextEmbeddings<B>,
        latent: Tensor<B, 4>,
        guidance_scale: f64,
        scheduler: &mut dyn Scheduler<B>,
    ) -> Result<Tensor<B, 4>> {
        let timesteps = scheduler.timesteps().to_vec();
        let n_steps = timesteps.len();

        let mut latent = latent;
        for (i, &t) in timesteps.iter().enumerate() {
            debug!(step = i + 1, n_steps, timestep = t, "denoising");

            let pred_noise = self.guided_noise(embeddings, latent.clone(), t, guidance_scale)?;
            latent = scheduler.step(pred_noise, t, latent)?;
        }

        Ok(latent)
    }

    /// Predicts the guided noise in `latent` at `timestep` with one denoiser
    /// pass over the doubled batch. No gradient flows through the result.
    pub fn guided_noise(
        &self,
        embeddings: &TextEmbeddings<B>,
        latent: Tensor<B, 4>,
        timestep: usize,
        guidance_scale: f64,
    ) -> Result<Tensor<B, 4>> {
        let [n_batch, n_channel, height, width] = latent.dims();
        if n_batch != embeddings.num_prompts() {
            return Err(Error::shape_mismatch(format!(
                "latent batch {} does not match {} prompts",
                n_batch,
                embeddings.num_prompts()
            )));
        }

        let latent = latent.detach();
        let pred_noise = self
            .unet
            .forward(
                Tensor::cat(vec![latent.clone(), latent], 0),
                timestep,
                embeddings.context(),
            )
            .detach();

        let expected = [2 * n_batch, n_channel, height, width];
        if pred_noise.dims() != expected {
            return Err(Error::shape_mismatch(format!(
                "denoiser returned {:?}, expected {:?}",
                pred_noise.dims(),
                expected
            )));
        }

        let unconditional = pred_noise.clone().slice([0..n_batch]);
        let conditional = pred_noise.slice([n_batch..2 * n_batch]);

        Ok(classifier_free_guidance(unconditional, conditional, guidance_scale))
    }

    fn gen_noise(
        &self,
        embeddings: &TextEmbeddings<B>,
        n_batch: usize,
        height: usize,
        width: usize,
    ) -> Result<Tensor<B, 4>> {
        let factor = self.downsample_factor;
        if height < factor || width < factor {
            return Err(Error::invalid_input(format!(
                "a {}x{} image is smaller than one latent pixel",
                height, width
            )));
        }

        let shape = [n_batch, self.latent_channels, height / factor, width / factor];
        let device = embeddings.context().device();

        Ok(Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device))
    }
}
