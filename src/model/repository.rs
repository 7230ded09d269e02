// Location: src/model/repository.rs

//! Weight repository: shard discovery, loading, and reassembly.
//!
//! Shard files are processed in lexicographic order so repeated loads are
//! reproducible. Tensors that arrive split across shards are concatenated
//! along an axis chosen by their parameter role; merging is a functional
//! update that replaces the old binding with a new tensor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::config::Hyperparams;
use crate::error::{EngineError, Result};

/// Manifest written next to sharded safetensors files.
const SHARD_MANIFEST: &str = "model.safetensors.index.json";

/// Parameter role inferred from a tensor key, used for the shard-merge axis
/// and the contamination guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyRole {
    /// Query/key/value projections; shards stack along the output axis.
    AttnQkv,
    /// Attention output projection; shards stack along the input axis.
    AttnOut,
    /// Feed-forward gate/up projections; shards stack along the output axis.
    FfnGateUp,
    /// Feed-forward down projection; shards stack along the input axis.
    FfnDown,
    /// Embedding or output head; shards stack along the vocabulary axis.
    Embedding,
    /// Anything else; duplicates are replaced, not concatenated.
    Other,
}

fn key_role(key: &str) -> KeyRole {
    if key.contains("q_proj") || key.contains("k_proj") || key.contains("v_proj") {
        KeyRole::AttnQkv
    } else if key.contains("o_proj") || key.contains("attn_output") {
        KeyRole::AttnOut
    } else if key.contains("gate_proj") || key.contains("up_proj") {
        KeyRole::FfnGateUp
    } else if key.contains("down_proj") {
        KeyRole::FfnDown
    } else if key.contains("embed_tokens")
        || key.contains("tok_embeddings")
        || key.contains("token_embd")
        || key.contains("lm_head")
        || key == "output.weight"
    {
        KeyRole::Embedding
    } else {
        KeyRole::Other
    }
}

/// The concatenation axis for a split tensor of this role, if it has one.
fn split_axis(role: KeyRole) -> Option<usize> {
    match role {
        KeyRole::AttnQkv | KeyRole::FfnGateUp | KeyRole::Embedding => Some(0),
        KeyRole::AttnOut | KeyRole::FfnDown => Some(1),
        KeyRole::Other => None,
    }
}

/// Weight file layouts the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeightFormat {
    Safetensors,
    Gguf,
}

/// Flat key-to-tensor store assembled from one or more shard files.
pub struct WeightRepository {
    tensors: HashMap<String, Tensor>,
    device: Device,
}

impl WeightRepository {
    /// Discover and load every weight file in a model directory.
    ///
    /// A per-shard failure is logged and that shard skipped; the repository
    /// counts as loaded when at least one shard contributed tensors. An
    /// integrity violation aborts the load outright.
    pub fn load(dir: &Path, hparams: &Hyperparams, device: &Device) -> Result<Self> {
        if !dir.is_dir() {
            return Err(EngineError::load(format!(
                "model directory not found: {}",
                dir.display()
            )));
        }

        let (files, format) = discover_weight_files(dir)?;
        let mut repository = Self { tensors: HashMap::new(), device: device.clone() };

        for path in &files {
            let outcome = match format {
                WeightFormat::Safetensors => repository.load_safetensors_shard(path, hparams),
                WeightFormat::Gguf => repository.load_gguf_file(path, hparams),
            };
            match outcome {
                Ok(count) => info!(tensors = count, "loaded shard {}", path.display()),
                // Contract violations abort; anything else skips the shard
                Err(e @ EngineError::Integrity { .. }) => return Err(e),
                Err(e) => warn!("skipping shard {}: {}", path.display(), e),
            }
        }

        if repository.tensors.is_empty() {
            return Err(EngineError::load(format!(
                "no tensors loaded from {} weight file(s) in {}",
                files.len(),
                dir.display()
            )));
        }
        Ok(repository)
    }

    fn load_safetensors_shard(&mut self, path: &Path, hparams: &Hyperparams) -> Result<usize> {
        let loaded = candle_core::safetensors::load(path, &self.device)?;
        let mut keys: Vec<String> = loaded.keys().cloned().collect();
        keys.sort();
        let count = keys.len();
        for key in keys {
            let tensor = loaded[&key].to_dtype(DType::F32)?;
            self.insert(key, tensor, hparams)?;
        }
        Ok(count)
    }

    fn load_gguf_file(&mut self, path: &Path, hparams: &Hyperparams) -> Result<usize> {
        let mut file = fs::File::open(path)?;
        let content = gguf_file::Content::read(&mut file)?;
        let mut names: Vec<String> = content.tensor_infos.keys().cloned().collect();
        names.sort();
        let count = names.len();
        for name in names {
            let quantized = content.tensor(&mut file, &name, &self.device)?;
            let tensor = quantized.dequantize(&self.device)?.to_dtype(DType::F32)?;
            self.insert(name, tensor, hparams)?;
        }
        Ok(count)
    }

    /// Insert a tensor, concatenating with an existing one of the same key
    /// along the axis its role dictates.
    fn insert(&mut self, key: String, tensor: Tensor, hparams: &Hyperparams) -> Result<()> {
        self.guard_attention_shape(&key, &tensor, hparams)?;

        let Some(existing) = self.tensors.remove(&key) else {
            self.tensors.insert(key, tensor);
            return Ok(());
        };

        match split_axis(key_role(&key)) {
            Some(axis) if axis < existing.rank() => {
                let merged = Tensor::cat(&[&existing, &tensor], axis)?;
                debug!(
                    "merged split tensor {} along axis {} into {:?}",
                    key,
                    axis,
                    merged.dims()
                );
                self.tensors.insert(key, merged);
            }
            _ => {
                warn!("duplicate tensor {} has no split role, keeping the newest", key);
                self.tensors.insert(key, tensor);
            }
        }
        Ok(())
    }

    /// Reject a tensor arriving under an attention-projection key whose
    /// shape matches the feed-forward width instead of the hidden size.
    /// This is a correctness invariant, not a heuristic: a violation means
    /// a feed-forward tensor is about to bind to an attention role.
    fn guard_attention_shape(
        &self,
        key: &str,
        tensor: &Tensor,
        hparams: &Hyperparams,
    ) -> Result<()> {
        if !matches!(key_role(key), KeyRole::AttnQkv | KeyRole::AttnOut) {
            return Ok(());
        }
        if hparams.intermediate_size == hparams.hidden_size {
            return Ok(());
        }
        let dims = tensor.dims();
        if dims.contains(&hparams.intermediate_size) && !dims.contains(&hparams.hidden_size) {
            return Err(EngineError::integrity(format!(
                "tensor {} with shape {:?} matches the feed-forward width {} \
                 instead of the hidden size {}",
                key, dims, hparams.intermediate_size, hparams.hidden_size
            )));
        }
        Ok(())
    }

    /// Look up a tensor by exact key.
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// All keys in the store.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Number of tensors in the store.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The device tensors were loaded onto.
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[cfg(test)]
    pub(crate) fn from_tensors(tensors: HashMap<String, Tensor>, device: Device) -> Self {
        Self { tensors, device }
    }
}

/// Find the weight files to load: a manifest plus shards, a set of
/// same-suffix files without a manifest, or a single foreign-format file.
fn discover_weight_files(dir: &Path) -> Result<(Vec<PathBuf>, WeightFormat)> {
    let mut safetensors = Vec::new();
    let mut gguf = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => safetensors.push(path),
            Some("gguf") => gguf.push(path),
            _ => {}
        }
    }
    safetensors.sort();
    gguf.sort();

    if !safetensors.is_empty() {
        if dir.join(SHARD_MANIFEST).exists() {
            debug!(shards = safetensors.len(), "shard manifest present");
        }
        return Ok((safetensors, WeightFormat::Safetensors));
    }
    if let Some(first) = gguf.into_iter().next() {
        return Ok((vec![first], WeightFormat::Gguf));
    }
    Err(EngineError::load(format!(
        "no weight files found in {}",
        dir.display()
    )))
}
