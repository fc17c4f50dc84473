use burn::tensor::{backend::Backend, Tensor};

/// A denoising network predicting the noise present in a latent at a timestep.
pub trait NoisePredictor<B: Backend> {
    /// `latents` is `[n_batch, c, h, w]` and `context` is `[n_batch, seq_len, dim]`.
    /// Returns a noise prediction with the same shape as `latents`.
    fn forward(&self, latents: Tensor<B, 4>, timestep: usize, context: Tensor<B, 3>) -> Tensor<B, 4>;
}
