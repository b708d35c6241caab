//! CLIP text encoder wrapper.
//!
//! Handles tokenization and text encoding for prompts. Token sequences are
//! padded and truncated to the model's fixed context length.

use std::path::Path;

use ort::session::Session;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::config::EngineConfig;
use crate::error::{DiffusionError, ModelKind, Result};
use crate::models::{TextEmbedding, TextEncoder};

use super::{from_output, load_session};

/// CLIP end-of-text token, also used for padding.
const END_OF_TEXT: &str = "<|endoftext|>";
const END_OF_TEXT_ID: u32 = 49407;

/// CLIP text encoder combining a tokenizer and an ONNX session.
pub struct OnnxTextEncoder {
    tokenizer: Tokenizer,
    session: Session,
    kind: ModelKind,
}

impl std::fmt::Debug for OnnxTextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxTextEncoder")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl OnnxTextEncoder {
    /// Loads a tokenizer and text encoder graph.
    ///
    /// # Arguments
    ///
    /// * `tokenizer_path` - HuggingFace `tokenizer.json`
    /// * `model_path` - Exported encoder graph
    /// * `max_tokens` - Context length the encoder was exported with
    pub fn load(
        tokenizer_path: &Path,
        model_path: &Path,
        max_tokens: usize,
        kind: ModelKind,
        engine: &EngineConfig,
    ) -> Result<Self> {
        let mut tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to load tokenizer: {}", e))
        })?;

        let pad_id = tokenizer.token_to_id(END_OF_TEXT).unwrap_or(END_OF_TEXT_ID);
        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(max_tokens),
                pad_id,
                pad_token: END_OF_TEXT.to_string(),
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..Default::default()
            }))
            .map_err(|e| {
                DiffusionError::model_load_failed(format!("Failed to configure tokenizer: {}", e))
            })?;

        let session = load_session(model_path, engine)?;

        Ok(Self {
            tokenizer,
            session,
            kind,
        })
    }
}

impl TextEncoder for OnnxTextEncoder {
    fn encode(&mut self, text: &str) -> Result<TextEmbedding> {
        let kind = self.kind;
        let tokens: Vec<i32> = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| {
                DiffusionError::feature_encoding_failed(kind, format!("Tokenization failed: {}", e))
            })?
            .get_ids()
            .iter()
            .map(|&id| id as i32)
            .collect();

        let tokens_len = tokens.len();
        let input_ids = ort::value::Tensor::from_array(([1, tokens_len], tokens))
            .map_err(|e| DiffusionError::feature_encoding_failed(kind, e.to_string()))?;

        let mut outputs = self
            .session
            .run(ort::inputs!["input_ids" => input_ids])
            .map_err(|e| DiffusionError::model_execution_failed(kind, e.to_string()))?;

        let hidden = outputs.remove("last_hidden_state").ok_or_else(|| {
            DiffusionError::model_execution_failed(kind, "last_hidden_state not found in output")
        })?;
        let hidden_states = from_output(&hidden, kind)?;

        let pooled = match outputs
            .remove("text_embeds")
            .or_else(|| outputs.remove("pooler_output"))
        {
            Some(value) => Some(from_output(&value, kind)?),
            None => None,
        };

        Ok(TextEmbedding {
            hidden_states,
            pooled,
        })
    }
}
