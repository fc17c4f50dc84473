use burn::tensor::{backend::Backend, Int, Tensor};

/// A frozen text encoder producing per-token hidden states.
pub trait TextEncoder<B: Backend> {
    /// Maps `[n_batch, seq_len]` token ids to `[n_batch, seq_len, dim]` embeddings.
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3>;
}
