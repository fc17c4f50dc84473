//! Byte-level BPE tokenizer for the CLIP text encoder.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;

use super::Tokenizer;
use crate::error::{Error, Result};

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";
const END_OF_WORD: &str = "</w>";

/// Merges that fill CLIP's 49408-token vocabulary alongside the 512 byte
/// symbols and the two specials.
const MAX_MERGES: usize = 49152 - 256 - 2;

const PATTERN: &str = r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

#[derive(Debug, Clone)]
pub struct ClipTokenizer {
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    pattern: Regex,
    whitespace: Regex,
    sot_token: u32,
    eot_token: u32,
}

impl ClipTokenizer {
    /// Loads a merges file (`bpe_simple_vocab_16e6.txt` or `merges.txt`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let merges = fs::read_to_string(path)?;
        Self::from_merges(&merges)
    }

    /// Builds the tokenizer from the text of a merges file. The vocabulary is
    /// derived from the merges: byte symbols, byte symbols with an end-of-word
    /// marker, one entry per merge, then the two special tokens. Merges past
    /// the first 48894 are ignored.
    pub fn from_merges(merges: &str) -> Result<Self> {
        let merges = merges
            .lines()
            .filter(|line| !line.starts_with("#version"))
            .filter(|line| !line.trim().is_empty())
            .take(MAX_MERGES)
            .map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(first), Some(second), None) => Ok((first.to_string(), second.to_string())),
                    _ => Err(Error::Tokenizer(format!("malformed merge line '{}'", line))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let byte_encoder = bytes_to_unicode();
        let byte_decoder = byte_encoder.iter().map(|(&b, &c)| (c, b)).collect();

        let mut vocab: Vec<String> = byte_symbols().map(|c| c.to_string()).collect();
        vocab.extend(byte_symbols().map(|c| format!("{}{}", c, END_OF_WORD)));
        vocab.extend(merges.iter().map(|(first, second)| format!("{}{}", first, second)));
        vocab.push(START_OF_TEXT.to_string());
        vocab.push(END_OF_TEXT.to_string());

        let encoder: HashMap<String, u32> = vocab
            .into_iter()
            .enumerate()
            .map(|(id, token)| (token, id as u32))
            .collect();
        let decoder = encoder.iter().map(|(token, &id)| (id, token.clone())).collect();

        let bpe_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        let sot_token = encoder[START_OF_TEXT];
        let eot_token = encoder[END_OF_TEXT];

        let pattern = Regex::new(PATTERN).map_err(|e| Error::Tokenizer(e.to_string()))?;
        let whitespace = Regex::new(r"\s+").map_err(|e| Error::Tokenizer(e.to_string()))?;

        Ok(Self {
            encoder,
            decoder,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
            pattern,
            whitespace,
            sot_token,
            eot_token,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let chars: Vec<char> = token.chars().collect();
        let mut word: Vec<String> = match chars.split_last() {
            Some((last, rest)) => rest
                .iter()
                .map(|c| c.to_string())
                .chain(std::iter::once(format!("{}{}", last, END_OF_WORD)))
                .collect(),
            None => return Vec::new(),
        };

        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|pair| {
                    self.bpe_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);

            let (_, first, second) = match best {
                Some(best) => best,
                None => break,
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }

        word
    }

    fn clean(&self, text: &str) -> String {
        self.whitespace
            .replace_all(text.trim(), " ")
            .to_lowercase()
    }
}

impl Tokenizer for ClipTokenizer {
    fn encode(&self, text: &str, add_sot: bool, add_eot: bool) -> Vec<u32> {
        let text = self.clean(text);

        let mut tokens = Vec::new();
        if add_sot {
            tokens.push(self.sot_token);
        }

        for piece in self.pattern.find_iter(&text) {
            let piece = piece.as_str();
            if let Some(&special) = self.encoder.get(piece).filter(|_| piece.starts_with("<|")) {
                tokens.push(special);
                continue;
            }

            let encoded: String = piece.bytes().map(|b| self.byte_encoder[&b]).collect();
            tokens.extend(
                self.bpe(&encoded)
                    .iter()
                    .filter_map(|symbol| self.encoder.get(symbol).copied()),
            );
        }

        if add_eot {
            tokens.push(self.eot_token);
        }

        tokens
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter(|&&id| id != self.sot_token && id != self.eot_token)
            .filter_map(|id| self.decoder.get(id))
            .map(|s| s.as_str())
            .collect();

        let bytes: Vec<u8> = text
            .chars()
            .filter_map(|c| self.byte_decoder.get(&c).copied())
            .collect();

        String::from_utf8_lossy(&bytes)
            .replace(END_OF_WORD, " ")
            .trim_end()
            .to_string()
    }

    fn start_of_text_token(&self) -> u32 {
        self.sot_token
    }

    fn end_of_text_token(&self) -> u32 {
        self.eot_token
    }

    fn padding_token(&self) -> u32 {
        self.eot_token
    }
}

/// Byte values in vocabulary order: printable bytes first, then the rest.
fn byte_order() -> Vec<u8> {
    let mut bytes: Vec<u8> = (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF).collect();
    let rest: Vec<u8> = (0..=255u8).filter(|b| !bytes.contains(b)).collect();
    bytes.extend(rest);
    bytes
}

fn byte_symbols() -> impl Iterator<Item = char> {
    let encoder = bytes_to_unicode();
    byte_order().into_iter().map(move |b| encoder[&b])
}

/// Maps every byte to a printable unicode character so BPE never sees
/// whitespace or control characters.
fn bytes_to_unicode() -> HashMap<u8, char> {
    let mut shifted = 0u32;
    byte_order()
        .into_iter()
        .map(|b| {
            let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
            let c = if printable {
                char::from(b)
            } else {
                shifted += 1;
                char::from_u32(255 + shifted).unwrap_or(char::REPLACEMENT_CHARACTER)
            };
            (b, c)
        })
        .collect()
}
