pub mod codec;
pub mod distill;
pub mod embedder;
pub mod load;
pub mod sampler;

use burn::{
    config::Config,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use tracing::info;

use super::autoencoder::Autoencoder;
use super::clip::TextEncoder;
use super::scheduler::{NoiseSchedule, SchedulerConfig};
use super::unet::NoisePredictor;
use crate::error::{self, Error};
use crate::token::Tokenizer;

use codec::LatentCodec;
use distill::{DistillOutput, ScoreDistiller};
use embedder::{Embedder, TextEmbeddings};
use sampler::GuidedSampler;

/// Fixed properties of the pretrained model and of score distillation.
#[derive(Config, Debug)]
pub struct PriorConfig {
    #[config(default = 0.18215)]
    pub latent_scale: f64,
    #[config(default = 8)]
    pub downsample_factor: usize,
    #[config(default = 4)]
    pub latent_channels: usize,
    #[config(default = 77)]
    pub max_sequence_length: usize,
    #[config(default = 768)]
    pub embedding_dim: usize,
    #[config(default = 0.02)]
    pub min_step_fraction: f64,
    #[config(default = 0.98)]
    pub max_step_fraction: f64,
    /// Side length distillation renders are resized to before encoding.
    #[config(default = 512)]
    pub distill_resolution: usize,
    #[config(default = "String::new()")]
    pub unconditional_text: String,
    #[config(default = "SchedulerConfig::new()")]
    pub scheduler: SchedulerConfig,
}

impl PriorConfig {
    pub fn validate(&self) -> error::Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if !(self.latent_scale.is_finite() && self.latent_scale > 0.0) {
            return fail(format!("latent_scale must be positive, got {}", self.latent_scale));
        }
        if self.downsample_factor == 0 || self.latent_channels == 0 || self.embedding_dim == 0 {
            return fail("downsample_factor, latent_channels and embedding_dim must be non-zero".into());
        }
        if self.max_sequence_length < 2 {
            return fail(format!(
                "max_sequence_length {} leaves no room for the special tokens",
                self.max_sequence_length
            ));
        }
        if !(0.0 <= self.min_step_fraction
            && self.min_step_fraction <= self.max_step_fraction
            && self.max_step_fraction <= 1.0)
        {
            return fail(format!(
                "step fractions must satisfy 0 <= {} <= {} <= 1",
                self.min_step_fraction, self.max_step_fraction
            ));
        }
        if self.distill_resolution < self.downsample_factor {
            return fail(format!(
                "distill_resolution {} is below the downsample factor {}",
                self.distill_resolution, self.downsample_factor
            ));
        }

        Ok(())
    }
}

/// Per-call options of a sampling run.
#[derive(Config, Debug)]
pub struct SamplingConfig {
    #[config(default = 512)]
    pub height: usize,
    #[config(default = 512)]
    pub width: usize,
    #[config(default = 50)]
    pub num_inference_steps: usize,
    #[config(default = 7.5)]
    pub guidance_scale: f64,
}

/// A frozen latent diffusion model used as an image prior.
pub struct StableDiffusion<B, T, E, A, N>
where
    B: Backend,
    T: Tokenizer,
    E: TextEncoder<B>,
    A: Autoencoder<B>,
    N: NoisePredictor<B>,
{
    config: PriorConfig,
    embedder: Embedder<B, T, E>,
    codec: LatentCodec<B, A>,
    sampler: GuidedSampler<B, N>,
    distiller: ScoreDistiller,
    device: B::Device,
}

impl<B, T, E, A, N> StableDiffusion<B, T, E, A, N>
where
    B: Backend,
    T: Tokenizer,
    E: TextEncoder<B>,
    A: Autoencoder<B>,
    N: NoisePredictor<B>,
{
    /// Builds the prior with the noise schedule described by `config.scheduler`.
    pub fn new(
        config: &PriorConfig,
        tokenizer: T,
        text_encoder: E,
        autoencoder: A,
        unet: N,
        device: B::Device,
    ) -> error::Result<Self> {
        let schedule = config.scheduler.init_schedule()?;
        Self::with_noise_schedule(config, schedule, tokenizer, text_encoder, autoencoder, unet, device)
    }

    /// Builds the prior around an explicit, e.g. checkpoint-provided, schedule.
    pub fn with_noise_schedule(
        config: &PriorConfig,
        schedule: NoiseSchedule,
        tokenizer: T,
        text_encoder: E,
        autoencoder: A,
        unet: N,
        device: B::Device,
    ) -> error::Result<Self> {
        config.validate()?;

        let num_train_timesteps = schedule.num_train_timesteps();
        info!(
            num_train_timesteps,
            scheduler = ?config.scheduler.kind,
            "initializing diffusion prior"
        );

        let embedder = Embedder::new(
            tokenizer,
            text_encoder,
            config.unconditional_text.clone(),
            config.max_sequence_length,
            config.embedding_dim,
            device.clone(),
        );
        let codec = LatentCodec::new(
            autoencoder,
            config.latent_scale,
            config.latent_channels,
            config.downsample_factor,
        );
        let sampler = GuidedSampler::new(
            unet,
            schedule,
            config.scheduler.clone(),
            config.latent_channels,
            config.downsample_factor,
        );
        let distiller = ScoreDistiller::new(
            config.min_step_fraction,
            config.max_step_fraction,
            config.distill_resolution,
            num_train_timesteps,
        );

        Ok(Self {
            config: config.clone(),
            embedder,
            codec,
            sampler,
            distiller,
            device,
        })
    }

    pub fn config(&self) -> &PriorConfig {
        &self.config
    }

    pub fn noise_schedule(&self) -> &NoiseSchedule {
        self.sampler.schedule()
    }

    pub fn tokenizer(&self) -> &T {
        self.embedder.tokenizer()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// `[2 * n_prompts, seq_len, dim]` conditioning, unconditional rows first.
    pub fn text_embeddings<S: AsRef<str>>(&self, prompts: &[S]) -> error::Result<TextEmbeddings<B>> {
        self.embedder.text_embeddings(prompts)
    }

    pub fn sample_latents(
        &self,
        embeddings: &TextEmbeddings<B>,
        config: &SamplingConfig,
        latent: Option<Tensor<B, 4>>,
    ) -> error::Result<Tensor<B, 4>> {
        self.sampler.sample_latents(embeddings, config, latent)
    }

    pub fn decode_latents(&self, latents: Tensor<B, 4>) -> error::Result<Tensor<B, 4>> {
        self.codec.decode_latents(latents)
    }

    pub fn encode_images(&self, images: Tensor<B, 4>) -> error::Result<Tensor<B, 4>> {
        self.codec.encode_images(images)
    }

    pub fn decode_latent(&self, latent: Tensor<B, 3>) -> error::Result<Tensor<B, 3>> {
        self.codec.decode_latent(latent)
    }

    pub fn encode_image(&self, image: Tensor<B, 3>) -> error::Result<Tensor<B, 3>> {
        self.codec.encode_image(image)
    }

    /// Samples and decodes, returning `[n_prompts, height, width, 3]` pixels in [0, 1].
    pub fn embeddings_to_images(
        &self,
        embeddings: &TextEmbeddings<B>,
        config: &SamplingConfig,
        latent: Option<Tensor<B, 4>>,
    ) -> error::Result<Tensor<B, 4>> {
        let latents = self.sample_latents(embeddings, config, latent)?;
        let images = self.decode_latents(latents)?;

        Ok(images.swap_dims(1, 2).swap_dims(2, 3))
    }

    pub fn prompts_to_images<S: AsRef<str>>(
        &self,
        prompts: &[S],
        config: &SamplingConfig,
    ) -> error::Result<Tensor<B, 4>> {
        let embeddings = self.text_embeddings(prompts)?;
        self.embeddings_to_images(&embeddings, config, None)
    }

    /// `[height, width, 3]` pixels in [0, 1].
    pub fn prompt_to_image(&self, prompt: &str, config: &SamplingConfig) -> error::Result<Tensor<B, 3>> {
        Ok(self.prompts_to_images(&[prompt], config)?.squeeze(0))
    }
}

impl<B, T, E, A, N> StableDiffusion<B, T, E, A, N>
where
    B: AutodiffBackend,
    T: Tokenizer,
    E: TextEncoder<B>,
    A: Autoencoder<B>,
    N: NoisePredictor<B>,
{
    /// One score-distillation step on `pixels` (`[n_prompts, 3, h, w]` in [0, 1]).
    ///
    /// A random timestep in the configured range is used unless one is given.
    pub fn distill_step(
        &self,
        embeddings: &TextEmbeddings<B>,
        pixels: Tensor<B, 4>,
        guidance_scale: f64,
        timestep: Option<usize>,
    ) -> error::Result<DistillOutput<B>> {
        self.distiller.step(
            &self.codec,
            &self.sampler,
            embeddings,
            pixels,
            guidance_scale,
            timestep,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scheduler::SchedulerKind;
    use crate::model::testing::{stable_diffusion, tokenizer, MockAutoencoder, MockTextEncoder, MockUnet, TestBackend};

    #[test]
    fn prompt_to_image_end_to_end() {
        let sd = stable_diffusion::<TestBackend>();
        let config = SamplingConfig::new().with_num_inference_steps(1);

        let image = sd.prompt_to_image("a red apple", &config).unwrap();
        assert_eq!(image.dims(), [512, 512, 3]);

        let min: f32 = image.clone().min().into_scalar();
        let max: f32 = image.max().into_scalar();
        assert!(min >= 0.0 && max <= 1.0);
    }

    #[test]
    fn prompts_to_images_keeps_prompt_count() {
        let sd = stable_diffusion::<TestBackend>();
        let config = SamplingConfig::new()
            .with_height(64)
            .with_width(32)
            .with_num_inference_steps(2);

        let images = sd.prompts_to_images(&["a red apple", "a green pear"], &config).unwrap();
        assert_eq!(images.dims(), [2, 64, 32, 3]);
    }

    #[test]
    fn pndm_prior_samples() {
        let config = PriorConfig::new()
            .with_scheduler(SchedulerConfig::new().with_kind(SchedulerKind::Pndm));
        let sd = StableDiffusion::<TestBackend, _, _, _, _>::new(
            &config,
            tokenizer(),
            MockTextEncoder { dim: config.embedding_dim },
            MockAutoencoder,
            MockUnet,
            Default::default(),
        )
        .unwrap();

        let sampling = SamplingConfig::new()
            .with_height(32)
            .with_width(32)
            .with_num_inference_steps(6);
        let embeddings = sd.text_embeddings(&["a red apple"]).unwrap();
        let latents = sd.sample_latents(&embeddings, &sampling, None).unwrap();

        assert_eq!(latents.dims(), [1, 4, 4, 4]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let configs = [
            PriorConfig::new().with_latent_scale(0.0),
            PriorConfig::new().with_downsample_factor(0),
            PriorConfig::new().with_min_step_fraction(0.99),
            PriorConfig::new().with_max_step_fraction(1.5),
            PriorConfig::new().with_max_sequence_length(1),
        ];

        for config in configs {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
        assert!(PriorConfig::new().validate().is_ok());
    }

    #[test]
    fn defaults_match_stable_diffusion_1() {
        let config = PriorConfig::new();

        assert_eq!(config.latent_scale, 0.18215);
        assert_eq!(config.downsample_factor, 8);
        assert_eq!(config.max_sequence_length, 77);
        assert_eq!(config.embedding_dim, 768);
        assert_eq!(config.scheduler.num_train_timesteps, 1000);
        assert_eq!(config.unconditional_text, "");
    }
}
