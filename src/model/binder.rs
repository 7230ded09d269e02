// Location: src/model/binder.rs

//! Layer binding: resolve the flat tensor store into strongly-typed
//! per-layer records, checked against the declared hyperparameters.
//!
//! Resolution for each role tries the exact canonical key, then a small
//! alias table for common naming variants, then a transformer-prefix
//! stripping fallback. Every resolved tensor is shape-checked before it is
//! bound; a mismatch is an integrity failure, never a silent skip.

use candle_core::Tensor;
use tracing::debug;

use crate::config::Hyperparams;
use crate::error::{EngineError, Result};

use super::repository::WeightRepository;

/// The tensor roles required for each transformer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    /// Query projection
    AttnQ,
    /// Key projection
    AttnK,
    /// Value projection
    AttnV,
    /// Attention output projection
    AttnOut,
    /// Feed-forward gate projection
    FfnGate,
    /// Feed-forward up projection
    FfnUp,
    /// Feed-forward down projection
    FfnDown,
    /// Pre-attention normalization weight
    AttnNorm,
    /// Pre-feed-forward normalization weight
    FfnNorm,
}

impl TensorRole {
    fn canonical(&self, layer: usize) -> String {
        let suffix = match self {
            TensorRole::AttnQ => "self_attn.q_proj",
            TensorRole::AttnK => "self_attn.k_proj",
            TensorRole::AttnV => "self_attn.v_proj",
            TensorRole::AttnOut => "self_attn.o_proj",
            TensorRole::FfnGate => "mlp.gate_proj",
            TensorRole::FfnUp => "mlp.up_proj",
            TensorRole::FfnDown => "mlp.down_proj",
            TensorRole::AttnNorm => "input_layernorm",
            TensorRole::FfnNorm => "post_attention_layernorm",
        };
        format!("model.layers.{}.{}.weight", layer, suffix)
    }

    /// Common naming variants seen in converted checkpoints.
    fn aliases(&self, layer: usize) -> Vec<String> {
        let suffixes: &[&str] = match self {
            TensorRole::AttnQ => &["attention.q_proj", "attention.wq"],
            TensorRole::AttnK => &["attention.k_proj", "attention.wk"],
            TensorRole::AttnV => &["attention.v_proj", "attention.wv"],
            TensorRole::AttnOut => &["attention.o_proj", "attention.wo"],
            TensorRole::FfnGate => &["feed_forward.gate_proj", "feed_forward.w1"],
            TensorRole::FfnUp => &["feed_forward.up_proj", "feed_forward.w3"],
            TensorRole::FfnDown => &["feed_forward.down_proj", "feed_forward.w2"],
            TensorRole::AttnNorm => &["attention_norm"],
            TensorRole::FfnNorm => &["ffn_norm"],
        };
        suffixes
            .iter()
            .flat_map(|s| {
                [
                    format!("model.layers.{}.{}.weight", layer, s),
                    format!("layers.{}.{}.weight", layer, s),
                ]
            })
            .collect()
    }

    /// Declared shape for this role, derived from the hyperparameters.
    fn expected_shape(&self, hparams: &Hyperparams) -> Vec<usize> {
        let hidden = hparams.hidden_size;
        let kv_width = hparams.num_key_value_heads * hparams.head_dim();
        match self {
            TensorRole::AttnQ | TensorRole::AttnOut => vec![hidden, hidden],
            TensorRole::AttnK | TensorRole::AttnV => vec![kv_width, hidden],
            TensorRole::FfnGate | TensorRole::FfnUp => {
                vec![hparams.intermediate_size, hidden]
            }
            TensorRole::FfnDown => vec![hidden, hparams.intermediate_size],
            TensorRole::AttnNorm | TensorRole::FfnNorm => vec![hidden],
        }
    }
}

/// One transformer layer's tensors. Built once during binding; read-only
/// for the lifetime of the loaded model.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Pre-attention RMS normalization weight
    pub attn_norm: Tensor,
    /// Query projection
    pub q_proj: Tensor,
    /// Key projection
    pub k_proj: Tensor,
    /// Value projection
    pub v_proj: Tensor,
    /// Attention output projection
    pub o_proj: Tensor,
    /// Pre-feed-forward RMS normalization weight
    pub ffn_norm: Tensor,
    /// Feed-forward gate projection
    pub gate_proj: Tensor,
    /// Feed-forward up projection
    pub up_proj: Tensor,
    /// Feed-forward down projection
    pub down_proj: Tensor,
}

/// All tensors the forward pass consumes.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// Token embedding matrix, `[vocab, hidden]`
    pub embed_tokens: Tensor,
    /// Per-layer tensors, in layer order
    pub layers: Vec<LayerWeights>,
    /// Final RMS normalization weight
    pub final_norm: Tensor,
    /// Output projection, `[vocab, hidden]`
    pub lm_head: Tensor,
}

/// Resolve the repository into bound, validated model weights.
pub fn bind(repository: &WeightRepository, hparams: &Hyperparams) -> Result<ModelWeights> {
    let embed_tokens = resolve_global(
        repository,
        &[
            "model.embed_tokens.weight",
            "embed_tokens.weight",
            "tok_embeddings.weight",
            "token_embd.weight",
        ],
    )
    .ok_or_else(|| EngineError::integrity("embedding tensor not found under any alias"))?;
    check_shape(
        &embed_tokens,
        &[hparams.vocab_size, hparams.hidden_size],
        "embed_tokens",
    )?;

    let final_norm = resolve_global(
        repository,
        &["model.norm.weight", "norm.weight", "output_norm.weight"],
    )
    .ok_or_else(|| EngineError::integrity("final norm tensor not found under any alias"))?;
    check_shape(&final_norm, &[hparams.hidden_size], "final_norm")?;

    let lm_head = if hparams.tie_word_embeddings {
        embed_tokens.clone()
    } else {
        match resolve_global(
            repository,
            &["lm_head.weight", "model.lm_head.weight", "output.weight"],
        ) {
            Some(tensor) => tensor,
            None => {
                // Checkpoints without a separate head tie it to the embeddings
                debug!("no output head tensor found, tying to embeddings");
                embed_tokens.clone()
            }
        }
    };
    check_shape(&lm_head, &[hparams.vocab_size, hparams.hidden_size], "lm_head")?;

    let mut layers = Vec::with_capacity(hparams.num_hidden_layers);
    for layer_idx in 0..hparams.num_hidden_layers {
        layers.push(bind_layer(repository, hparams, layer_idx)?);
    }

    Ok(ModelWeights { embed_tokens, layers, final_norm, lm_head })
}

fn bind_layer(
    repository: &WeightRepository,
    hparams: &Hyperparams,
    layer_idx: usize,
) -> Result<LayerWeights> {
    let required = |role: TensorRole| -> Result<Tensor> {
        let tensor = resolve_role(repository, role, layer_idx).ok_or_else(|| {
            EngineError::integrity(format!(
                "layer {}: {} not found under {} or any alias",
                layer_idx,
                role_name(role),
                role.canonical(layer_idx)
            ))
        })?;
        check_shape(
            &tensor,
            &role.expected_shape(hparams),
            &format!("layer {} {}", layer_idx, role_name(role)),
        )?;
        Ok(tensor)
    };

    Ok(LayerWeights {
        attn_norm: required(TensorRole::AttnNorm)?,
        q_proj: required(TensorRole::AttnQ)?,
        k_proj: required(TensorRole::AttnK)?,
        v_proj: required(TensorRole::AttnV)?,
        o_proj: required(TensorRole::AttnOut)?,
        ffn_norm: required(TensorRole::FfnNorm)?,
        gate_proj: required(TensorRole::FfnGate)?,
        up_proj: required(TensorRole::FfnUp)?,
        down_proj: required(TensorRole::FfnDown)?,
    })
}

fn role_name(role: TensorRole) -> &'static str {
    match role {
        TensorRole::AttnQ => "q_proj",
        TensorRole::AttnK => "k_proj",
        TensorRole::AttnV => "v_proj",
        TensorRole::AttnOut => "o_proj",
        TensorRole::FfnGate => "gate_proj",
        TensorRole::FfnUp => "up_proj",
        TensorRole::FfnDown => "down_proj",
        TensorRole::AttnNorm => "input_layernorm",
        TensorRole::FfnNorm => "post_attention_layernorm",
    }
}

fn resolve_role(
    repository: &WeightRepository,
    role: TensorRole,
    layer_idx: usize,
) -> Option<Tensor> {
    let canonical = role.canonical(layer_idx);
    if let Some(tensor) = repository.get(&canonical) {
        return Some(tensor.clone());
    }
    for alias in role.aliases(layer_idx) {
        if let Some(tensor) = repository.get(&alias) {
            debug!("resolved {} via alias {}", canonical, alias);
            return Some(tensor.clone());
        }
    }
    // Prefix-stripping fallback: the canonical name minus its transformer
    // prefix, bare or under some other prefix.
    let stripped = canonical.strip_prefix("model.")?;
    if let Some(tensor) = repository.get(stripped) {
        debug!("resolved {} via stripped key {}", canonical, stripped);
        return Some(tensor.clone());
    }
    let suffix = format!(".{}", stripped);
    repository
        .keys()
        .find(|key| key.ends_with(&suffix))
        .and_then(|key| repository.get(key))
        .cloned()
}

fn resolve_global(repository: &WeightRepository, candidates: &[&str]) -> Option<Tensor> {
    candidates
        .iter()
        .find_map(|key| repository.get(key))
        .cloned()
}

fn check_shape(tensor: &Tensor, expected: &[usize], what: &str) -> Result<()> {
    if tensor.dims() != expected {
        return Err(EngineError::integrity(format!(
            "{}: shape {:?} does not match declared shape {:?}",
            what,
            tensor.dims(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;

    fn hparams() -> Hyperparams {
        Hyperparams {
            vocab_size: 8,
            hidden_size: 4,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            intermediate_size: 6,
            max_position_embeddings: 16,
            rms_norm_eps: 1e-5,
            tie_word_embeddings: false,
        }
    }

    fn tensor(shape: &[usize]) -> Tensor {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count).map(|i| i as f32 * 0.01).collect();
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    fn full_store(prefix: &str, attn_name: &str, mlp_name: &str) -> HashMap<String, Tensor> {
        let mut store = HashMap::new();
        store.insert(format!("{}embed_tokens.weight", prefix), tensor(&[8, 4]));
        store.insert(format!("{}norm.weight", prefix), tensor(&[4]));
        store.insert("lm_head.weight".to_string(), tensor(&[8, 4]));
        for (role, shape) in [
            ("q_proj", vec![4usize, 4]),
            ("k_proj", vec![2, 4]),
            ("v_proj", vec![2, 4]),
            ("o_proj", vec![4, 4]),
        ] {
            store.insert(
                format!("{}layers.0.{}.{}.weight", prefix, attn_name, role),
                tensor(&shape),
            );
        }
        for (role, shape) in [
            ("gate_proj", vec![6usize, 4]),
            ("up_proj", vec![6, 4]),
            ("down_proj", vec![4, 6]),
        ] {
            store.insert(
                format!("{}layers.0.{}.{}.weight", prefix, mlp_name, role),
                tensor(&shape),
            );
        }
        store.insert(format!("{}layers.0.input_layernorm.weight", prefix), tensor(&[4]));
        store.insert(
            format!("{}layers.0.post_attention_layernorm.weight", prefix),
            tensor(&[4]),
        );
        store
    }

    fn repository(store: HashMap<String, Tensor>) -> WeightRepository {
        WeightRepository::from_tensors(store, Device::Cpu)
    }

    #[test]
    fn test_bind_canonical_names() {
        let repo = repository(full_store("model.", "self_attn", "mlp"));
        let weights = bind(&repo, &hparams()).unwrap();
        assert_eq!(weights.layers.len(), 1);
        assert_eq!(weights.layers[0].k_proj.dims(), &[2, 4]);
        assert_eq!(weights.lm_head.dims(), &[8, 4]);
    }

    #[test]
    fn test_bind_alias_names() {
        let repo = repository(full_store("model.", "attention", "feed_forward"));
        assert!(bind(&repo, &hparams()).is_ok());
    }

    #[test]
    fn test_bind_prefix_stripped_names() {
        let repo = repository(full_store("", "self_attn", "mlp"));
        assert!(bind(&repo, &hparams()).is_ok());
    }

    #[test]
    fn test_missing_tensor_names_the_role() {
        let mut store = full_store("model.", "self_attn", "mlp");
        store.remove("model.layers.0.self_attn.k_proj.weight");
        let result = bind(&repository(store), &hparams());
        match result {
            Err(EngineError::Integrity { message }) => assert!(message.contains("k_proj")),
            other => panic!("expected integrity error, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut store = full_store("model.", "self_attn", "mlp");
        // Hidden-size axis off by a factor of two
        store.insert(
            "model.layers.0.self_attn.q_proj.weight".to_string(),
            tensor(&[4, 8]),
        );
        let result = bind(&repository(store), &hparams());
        assert!(matches!(result, Err(EngineError::Integrity { .. })));
    }

    #[test]
    fn test_missing_head_ties_to_embeddings() {
        let mut store = full_store("model.", "self_attn", "mlp");
        store.remove("lm_head.weight");
        let weights = bind(&repository(store), &hparams()).unwrap();
        assert_eq!(weights.lm_head.dims(), weights.embed_tokens.dims());
    }

    #[test]
    fn test_tied_embeddings_flag() {
        let store = full_store("model.", "self_attn", "mlp");
        let mut hparams = hparams();
        hparams.tie_word_embeddings = true;
        let weights = bind(&repository(store), &hparams).unwrap();
        assert_eq!(weights.lm_head.dims(), &[8, 4]);
    }
}
