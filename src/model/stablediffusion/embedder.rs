use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Error, Result};
use crate::model::clip::TextEncoder;
use crate::token::{tokenize_batch, Tokenizer};

/// Paired text conditioning of shape `[2 * n_prompts, seq_len, dim]`: the
/// unconditional rows come first, then one conditional row per prompt in
/// prompt order.
#[derive(Debug, Clone)]
pub struct TextEmbeddings<B: Backend> {
    context: Tensor<B, 3>,
}

impl<B: Backend> TextEmbeddings<B> {
    pub fn new(context: Tensor<B, 3>) -> Result<Self> {
        let [n_rows, _, _] = context.dims();
        if n_rows == 0 || n_rows % 2 != 0 {
            return Err(Error::shape_mismatch(format!(
                "text embeddings need an even, non-zero row count, got {}",
                n_rows
            )));
        }

        Ok(Self { context })
    }

    pub fn num_prompts(&self) -> usize {
        self.context.dims()[0] / 2
    }

    pub fn dims(&self) -> [usize; 3] {
        self.context.dims()
    }

    pub fn context(&self) -> Tensor<B, 3> {
        self.context.clone()
    }

    pub fn unconditional(&self) -> Tensor<B, 3> {
        let n_prompts = self.num_prompts();
        self.context.clone().slice([0..n_prompts])
    }

    pub fn conditional(&self) -> Tensor<B, 3> {
        let n_prompts = self.num_prompts();
        self.context.clone().slice([n_prompts..2 * n_prompts])
    }

    pub fn into_tensor(self) -> Tensor<B, 3> {
        self.context
    }
}

pub struct Embedder<B: Backend, T: Tokenizer, E: TextEncoder<B>> {
    tokenizer: T,
    text_encoder: E,
    unconditional_text: String,
    max_sequence_length: usize,
    embedding_dim: usize,
    device: B::Device,
}

impl<B: Backend, T: Tokenizer, E: TextEncoder<B>> Embedder<B, T, E> {
    pub fn new(
        tokenizer: T,
        text_encoder: E,
        unconditional_text: String,
        max_sequence_length: usize,
        embedding_dim: usize,
        device: B::Device,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            unconditional_text,
            max_sequence_length,
            embedding_dim,
            device,
        }
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Encodes `prompts` together with one unconditional row per prompt.
    pub fn text_embeddings<S: AsRef<str>>(&self, prompts: &[S]) -> Result<TextEmbeddings<B>> {
        if prompts.is_empty() {
            return Err(Error::invalid_input("at least one prompt is required"));
        }
        let n_prompts = prompts.len();

        let context = self.context(prompts)?;
        let unconditional_context = self.unconditional_context()?.repeat(0, n_prompts);

        TextEmbeddings::new(Tensor::cat(vec![unconditional_context, context], 0))
    }

    /// Embedding of the blank prompt, `[1, seq_len, dim]`. Encoded once and
    /// repeated, so every unconditional row is bit-identical.
    pub fn unconditional_context(&self) -> Result<Tensor<B, 3>> {
        self.context(&[self.unconditional_text.as_str()])
    }

    fn context<S: AsRef<str>>(&self, texts: &[S]) -> Result<Tensor<B, 3>> {
        let tokens = tokenize_batch(texts, &self.tokenizer, self.max_sequence_length, &self.device)?;
        let context = self.text_encoder.forward(tokens).detach();

        let expected = [texts.len(), self.max_sequence_length, self.embedding_dim];
        if context.dims() != expected {
            return Err(Error::shape_mismatch(format!(
                "text encoder returned {:?}, expected {:?}",
                context.dims(),
                expected
            )));
        }

        Ok(context)
    }
}
