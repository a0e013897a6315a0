//! Contextual token embeddings for BERTScore.
//!
//! [`BertEncoder`] loads a BERT checkpoint directory (the layout published
//! on the Hugging Face hub) and returns one last-layer hidden state per
//! non-special token:
//!
//! ```text
//! <model_dir>/
//!   config.json
//!   tokenizer.json
//!   model.safetensors
//! ```
//!
//! The candle backend sits behind the `embeddings` cargo feature. Without it
//! [`BertEncoder::load`] returns [`EmbeddingError::Disabled`].

use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(feature = "embeddings")]
use candle_core::{DType, Device, Tensor};
#[cfg(feature = "embeddings")]
use candle_nn::VarBuilder;
#[cfg(feature = "embeddings")]
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
#[cfg(feature = "embeddings")]
use tokenizers::{Tokenizer, TruncationParams};

/// Token budget used when `config.json` has no `max_position_embeddings`
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Errors from loading or running an encoder
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid model config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Tokenizer error in {path}: {message}")]
    Tokenizer { path: PathBuf, message: String },

    #[error("Model error: {0}")]
    Model(String),

    #[cfg(feature = "embeddings")]
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Built without the `embeddings` feature")]
    Disabled,
}

/// Turns a text into one vector per token, in token order
pub trait TokenEncoder: Send + Sync {
    /// Model label for logs
    fn name(&self) -> &str;

    /// Embed every non-special token of `text`
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or the forward pass fails.
    fn encode(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Read `max_position_embeddings` from a BERT `config.json`
///
/// # Errors
///
/// Returns an error if the file is not JSON.
pub fn max_positions(config_json: &str) -> Result<usize, EmbeddingError> {
    let value: serde_json::Value = serde_json::from_str(config_json)?;
    Ok(value
        .get("max_position_embeddings")
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_TOKENS))
}

/// BERT encoder on CPU
#[cfg(feature = "embeddings")]
pub struct BertEncoder {
    name: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

/// BERT encoder placeholder for builds without candle
#[cfg(not(feature = "embeddings"))]
#[derive(Debug)]
pub struct BertEncoder {
    name: String,
}

#[cfg(feature = "embeddings")]
fn model_label(model_dir: &Path) -> String {
    model_dir
        .file_name()
        .map_or_else(|| model_dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(feature = "embeddings")]
impl std::fmt::Debug for BertEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BertEncoder")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "embeddings")]
impl BertEncoder {
    /// Load `config.json`, `tokenizer.json` and `model.safetensors`
    ///
    /// # Errors
    ///
    /// Returns an error if any file is missing or does not describe a BERT
    /// model.
    pub fn load(model_dir: &Path) -> Result<Self, EmbeddingError> {
        let device = Device::Cpu;

        let config_json = std::fs::read_to_string(model_dir.join("config.json"))?;
        let bert_config: BertConfig = serde_json::from_str(&config_json)?;
        let max_length = max_positions(&config_json)?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer_error = |e: tokenizers::Error| EmbeddingError::Tokenizer {
            path: tokenizer_path.clone(),
            message: e.to_string(),
        };
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(tokenizer_error)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..TruncationParams::default()
            }))
            .map_err(tokenizer_error)?;

        let weights = candle_core::safetensors::load(model_dir.join("model.safetensors"), &device)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = BertModel::load(vb, &bert_config)
            .map_err(|e| EmbeddingError::Model(format!("failed to build BERT: {e}")))?;

        tracing::info!(model = %model_dir.display(), max_length, "loaded BERTScore encoder");
        Ok(Self {
            name: model_label(model_dir),
            model,
            tokenizer,
            device,
        })
    }
}

#[cfg(not(feature = "embeddings"))]
impl BertEncoder {
    /// Always fails: candle is not compiled in
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Disabled`].
    pub fn load(_model_dir: &Path) -> Result<Self, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

#[cfg(feature = "embeddings")]
impl TokenEncoder for BertEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::Model(format!("tokenization failed: {e}")))?;
        if encoding.get_ids().is_empty() {
            return Ok(Vec::new());
        }

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, None)?
            .squeeze(0)?
            .to_vec2::<f32>()?;

        Ok(hidden
            .into_iter()
            .zip(encoding.get_special_tokens_mask())
            .filter(|(_, special)| **special == 0)
            .map(|(row, _)| row)
            .collect())
    }
}

#[cfg(not(feature = "embeddings"))]
impl TokenEncoder for BertEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, _text: &str) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}
