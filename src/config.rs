// Location: src/config.rs

use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Model hyperparameters, read once from `config.json` at load time and
/// immutable afterwards. Field names follow the on-disk convention so the
/// file deserializes directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Vocabulary size
    pub vocab_size: usize,

    /// Model hidden size
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key/value heads; 0 (absent in the file) means the same as
    /// the attention head count
    #[serde(default)]
    pub num_key_value_heads: usize,

    /// Intermediate size for feed forward layers
    pub intermediate_size: usize,

    /// Maximum context length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// RMS normalization epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Whether the output head shares the embedding matrix
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

impl Hyperparams {
    /// Read and validate hyperparameters from a `config.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::load(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut hparams: Hyperparams = serde_json::from_str(&text).map_err(|e| {
            EngineError::load(format!("invalid {}: {}", path.display(), e))
        })?;
        if hparams.num_key_value_heads == 0 {
            hparams.num_key_value_heads = hparams.num_attention_heads;
        }
        hparams.validate()?;
        Ok(hparams)
    }

    /// Dimension of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Reject configurations the forward pass cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.hidden_size == 0
            || self.num_hidden_layers == 0
            || self.num_attention_heads == 0
            || self.intermediate_size == 0
            || self.max_position_embeddings == 0
        {
            return Err(EngineError::load("configuration has a zero-sized dimension"));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(EngineError::load(format!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(EngineError::load(format!(
                "{} attention heads are not divisible by {} key/value heads",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        Ok(())
    }
}

/// Sampling parameters for a single generation request. All fields are
/// optional on the wire; the defaults here apply when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for sampling; 0 or below means greedy arg-max
    pub temperature: f64,

    /// Keep only the k highest-probability candidates; 0 disables
    pub top_k: usize,

    /// Nucleus sampling threshold; values outside (0, 1) disable the filter
    pub top_p: f64,

    /// Drop candidates below this fraction of the top probability
    pub min_p: f64,

    /// Repetition penalty factor
    pub repeat_penalty: f32,

    /// How many recent generated tokens the penalty looks back over
    pub repeat_last_n: usize,

    /// Maximum number of tokens to generate
    pub max_tokens: usize,

    /// Stop sequences; generation ends when the output reaches one
    pub stop: Vec<String>,

    /// Seed for the sampling RNG; absent means OS entropy
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.2,
            repeat_last_n: 128,
            max_tokens: 600,
            stop: Vec::new(),
            seed: None,
        }
    }
}
