pub mod clip;

use burn::tensor::{backend::Backend, Data, Int, Shape, Tensor};

use crate::error::{Error, Result};

pub trait Tokenizer {
    fn encode(&self, text: &str, add_sot: bool, add_eot: bool) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;

    fn start_of_text_token(&self) -> u32;
    fn end_of_text_token(&self) -> u32;
    fn padding_token(&self) -> u32;
}

/// Tokenizes `text` to exactly `seq_len` ids.
///
/// Over-long prompts are truncated but keep their end-of-text token in the
/// last position; short prompts are padded with the tokenizer's padding token.
pub fn tokenize_text<T: Tokenizer>(text: &str, tokenizer: &T, seq_len: usize) -> Vec<i32> {
    let mut tokenized: Vec<_> = tokenizer
        .encode(text, true, true)
        .into_iter()
        .map(|v| v as i32)
        .collect();

    if tokenized.len() > seq_len {
        tokenized.truncate(seq_len);
        if let Some(last) = tokenized.last_mut() {
            *last = tokenizer.end_of_text_token() as i32;
        }
    }

    tokenized.resize(seq_len, tokenizer.padding_token() as i32);
    tokenized
}

/// Tokenizes a batch of texts into a `[n_texts, seq_len]` id tensor.
pub fn tokenize_batch<B: Backend, T: Tokenizer, S: AsRef<str>>(
    texts: &[S],
    tokenizer: &T,
    seq_len: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2, Int>> {
    if texts.is_empty() {
        return Err(Error::invalid_input("cannot tokenize an empty batch"));
    }
    if seq_len == 0 {
        return Err(Error::invalid_input("sequence length must be positive"));
    }

    let ids: Vec<i32> = texts
        .iter()
        .flat_map(|text| tokenize_text(text.as_ref(), tokenizer, seq_len))
        .collect();

    let data = Data::new(ids, Shape::new([texts.len(), seq_len]));
    Ok(Tensor::from_data(data.convert::<B::IntElem>(), device))
}
