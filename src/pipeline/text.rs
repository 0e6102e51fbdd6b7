//! Prompt encoding with the CLIP tokenizer and text encoder.

use std::path::Path;

use ndarray::{Array2, Array3, Ix3};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

use super::onnx::{extract_array, missing_output};

/// Prompt embedding, (1, 77, hidden).
pub type Embedding = Array3<f32>;

/// Fixed token length of the CLIP text encoder.
pub const MAX_TOKENS: usize = 77;

const END_OF_TEXT: &str = "<|endoftext|>";

/// Turns prompts into fixed-shape embeddings that condition the `UNet`.
pub trait PromptEncoder {
    /// Embed a prompt. The same prompt always yields the same embedding.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    fn embed(&mut self, prompt: &str) -> Result<Embedding>;
}

/// CLIP text encoder running as an ONNX session.
pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    session: Session,
    pad_id: u32,
}

impl ClipTextEncoder {
    /// Build an encoder from a `tokenizer.json` file and a loaded session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if the tokenizer cannot be read or lacks
    /// the end-of-text token.
    pub fn from_file<P: AsRef<Path>>(tokenizer_path: P, session: Session) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref()).map_err(|e| Error::Tokenizer {
            reason: format!("{}: {e}", tokenizer_path.as_ref().display()),
        })?;
        Self::new(tokenizer, session)
    }

    /// Build an encoder from a tokenizer and a loaded session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if the vocabulary lacks the end-of-text token.
    pub fn new(tokenizer: Tokenizer, session: Session) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| Error::Tokenizer {
                reason: format!("vocabulary has no {END_OF_TEXT} token"),
            })?;

        Ok(Self {
            tokenizer,
            session,
            pad_id,
        })
    }

    /// Tokenize a prompt to exactly [`MAX_TOKENS`] ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if encoding fails.
    pub fn tokenize(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer {
                reason: e.to_string(),
            })?;

        Ok(pad_tokens(encoding.get_ids(), MAX_TOKENS, self.pad_id))
    }
}

impl PromptEncoder for ClipTextEncoder {
    #[allow(clippy::cast_possible_wrap)]
    fn embed(&mut self, prompt: &str) -> Result<Embedding> {
        let ids: Vec<i32> = self.tokenize(prompt)?.into_iter().map(|id| id as i32).collect();

        let input_ids = Array2::from_shape_vec((1, MAX_TOKENS), ids).map_err(|_| Error::ShapeMismatch {
            expected: format!("(1, {MAX_TOKENS}) token ids"),
            actual: "reshape failed".to_string(),
        })?;
        let input_value =
            Tensor::from_array(input_ids).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        // First output is last_hidden_state
        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("last_hidden_state"))?;

        extract_array::<Ix3>(&output)
    }
}

/// Pad with `end_id` or truncate to exactly `max_len` ids.
///
/// Truncation keeps the sequence terminated by `end_id`.
#[must_use]
pub fn pad_tokens(ids: &[u32], max_len: usize, end_id: u32) -> Vec<u32> {
    if max_len == 0 {
        return Vec::new();
    }

    let mut tokens: Vec<u32> = ids.iter().copied().take(max_len).collect();
    if ids.len() > max_len {
        tokens[max_len - 1] = end_id;
    }
    tokens.resize(max_len, end_id);
    tokens
}
