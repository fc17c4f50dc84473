//! Small deterministic stand-ins for the pretrained networks.

use std::{cell::RefCell, rc::Rc};

use burn::tensor::{backend::Backend, Data, Int, Shape, Tensor};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

use super::autoencoder::{Autoencoder, DiagonalGaussian};
use super::clip::TextEncoder;
use super::resample::{apply_separable, weight_matrix};
use super::stablediffusion::{codec::LatentCodec, embedder::Embedder, PriorConfig, StableDiffusion};
use super::unet::NoisePredictor;
use crate::token::clip::ClipTokenizer;

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const FACTOR: usize = 8;

/// Embeds each token id as `sin(id * k / 100)` over the feature index `k`.
#[derive(Debug, Clone)]
pub struct MockTextEncoder {
    pub dim: usize,
}

impl<B: Backend> TextEncoder<B> for MockTextEncoder {
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [n_batch, seq_len] = tokens.dims();
        let device = tokens.device();

        let frequencies: Vec<f32> = (0..self.dim).map(|k| k as f32 * 0.01).collect();
        let frequencies: Tensor<B, 3> = Tensor::from_data(
            Data::new(frequencies, Shape::new([1, 1, self.dim])).convert::<B::FloatElem>(),
            &device,
        );

        let ids = tokens.float().reshape([n_batch, seq_len, 1]).repeat(2, self.dim);
        (ids * frequencies).sin()
    }
}

/// Average-pools 8x8 blocks into three latent channels plus their mean, and
/// decodes by repeating each latent pixel over its block.
#[derive(Debug, Clone, Default)]
pub struct MockAutoencoder;

/// `[size, size / 8]` matrix copying each coarse pixel over its block.
pub fn block_upsample<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    let coarse = size / FACTOR;
    let weights = (0..size)
        .flat_map(|i| (0..coarse).map(move |j| if i / FACTOR == j { 1.0 } else { 0.0 }))
        .collect();

    weight_matrix(weights, size, coarse, device)
}

fn block_pool<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    block_upsample::<B>(size, device).transpose() / FACTOR as f64
}

impl<B: Backend> Autoencoder<B> for MockAutoencoder {
    fn encode(&self, images: Tensor<B, 4>) -> DiagonalGaussian<B> {
        let [_, _, height, width] = images.dims();
        let device = images.device();

        let pooled = apply_separable(
            images,
            block_pool(height, &device),
            block_pool(width, &device),
        );
        let mean = Tensor::cat(vec![pooled.clone(), pooled.mean_dim(1)], 1);
        let logvar = Tensor::zeros(mean.shape(), &device) - 30.0;

        DiagonalGaussian::new(mean, logvar)
    }

    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n_batch, _, height, width] = latents.dims();
        let device = latents.device();

        apply_separable(
            latents.slice([0..n_batch, 0..3]),
            block_upsample(height * FACTOR, &device),
            block_upsample(width * FACTOR, &device),
        )
    }
}

/// Predicts `latents / 2` plus a per-row offset taken from the conditioning
/// that grows with the timestep.
#[derive(Debug, Clone, Default)]
pub struct MockUnet;

impl<B: Backend> NoisePredictor<B> for MockUnet {
    fn forward(&self, latents: Tensor<B, 4>, timestep: usize, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [n_batch, _, _] = context.dims();
        let offset = context
            .mean_dim(2)
            .mean_dim(1)
            .reshape([n_batch, 1, 1, 1])
            * (1.0 + timestep as f64 / 1000.0);

        latents * 0.5 + offset
    }
}

/// [`MockUnet`] that keeps every `(latents, prediction)` pair it produces.
#[derive(Clone)]
pub struct RecordingUnet<B: Backend> {
    pub calls: Rc<RefCell<Vec<(Tensor<B, 4>, Tensor<B, 4>)>>>,
}

impl<B: Backend> RecordingUnet<B> {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<B: Backend> NoisePredictor<B> for RecordingUnet<B> {
    fn forward(&self, latents: Tensor<B, 4>, timestep: usize, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let pred_noise = MockUnet.forward(latents.clone(), timestep, context);
        self.calls.borrow_mut().push((latents, pred_noise.clone()));
        pred_noise
    }
}

pub fn tokenizer() -> ClipTokenizer {
    ClipTokenizer::from_merges("#version: 0.2\na p\nr e\nre d</w>").unwrap()
}

pub fn embedder<B: Backend>() -> Embedder<B, ClipTokenizer, MockTextEncoder> {
    let config = PriorConfig::new();
    Embedder::new(
        tokenizer(),
        MockTextEncoder { dim: config.embedding_dim },
        config.unconditional_text.clone(),
        config.max_sequence_length,
        config.embedding_dim,
        Default::default(),
    )
}

pub fn codec<B: Backend>() -> LatentCodec<B, MockAutoencoder> {
    let config = PriorConfig::new();
    LatentCodec::new(
        MockAutoencoder,
        config.latent_scale,
        config.latent_channels,
        config.downsample_factor,
    )
}

pub type MockStableDiffusion<B> =
    StableDiffusion<B, ClipTokenizer, MockTextEncoder, MockAutoencoder, MockUnet>;

pub fn stable_diffusion<B: Backend>() -> MockStableDiffusion<B> {
    let config = PriorConfig::new();
    StableDiffusion::new(
        &config,
        tokenizer(),
        MockTextEncoder { dim: config.embedding_dim },
        MockAutoencoder,
        MockUnet,
        Default::default(),
    )
    .unwrap()
}
