// Location: src/model/forward.rs

//! Forward pass: token context in, next-token logits out.
//!
//! The whole context is reprocessed on every call; there is no key/value
//! cache, so each generated token costs work linear in the context length.

use candle_core::{Device, Tensor, D};
use candle_nn::ops;

use crate::config::Hyperparams;
use crate::error::{EngineError, Result};

use super::binder::{LayerWeights, ModelWeights};

/// Masked-out attention scores are forced this negative so their
/// post-softmax weight is ~0.
const MASK_VALUE: f32 = -1e9;

/// Runs the transformer over a token context. Weights are immutable and
/// shared read-only for the lifetime of the loaded model.
pub struct ForwardEngine {
    weights: ModelWeights,
    hparams: Hyperparams,
    device: Device,
}

impl ForwardEngine {
    /// Wrap bound weights for inference.
    pub fn new(weights: ModelWeights, hparams: Hyperparams, device: Device) -> Self {
        Self { weights, hparams, device }
    }

    /// Logits over the vocabulary for the final position of `tokens`.
    pub fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(EngineError::generation("forward pass on an empty context"));
        }
        let seq_len = tokens.len();
        let ids = Tensor::new(tokens, &self.device)?;
        let mut hidden = self.weights.embed_tokens.index_select(&ids, 0)?;
        let mask = self.causal_mask(seq_len)?;

        for layer in &self.weights.layers {
            hidden = self.block(&hidden, layer, &mask)?;
        }

        let hidden = rms_norm(&hidden, &self.weights.final_norm, self.hparams.rms_norm_eps)?;
        let last = hidden.narrow(0, seq_len - 1, 1)?;
        let logits = last.matmul(&self.weights.lm_head.t()?)?;
        Ok(logits.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// The declared maximum context length.
    pub fn max_context(&self) -> usize {
        self.hparams.max_position_embeddings
    }

    fn block(&self, input: &Tensor, layer: &LayerWeights, mask: &Tensor) -> Result<Tensor> {
        let eps = self.hparams.rms_norm_eps;
        let normed = rms_norm(input, &layer.attn_norm, eps)?;
        let attn_out = self.attention(&normed, layer, mask)?;
        let hidden = (input + &attn_out)?;

        let normed = rms_norm(&hidden, &layer.ffn_norm, eps)?;
        let ffn_out = feed_forward(&normed, layer)?;
        Ok((&hidden + &ffn_out)?)
    }

    fn attention(&self, input: &Tensor, layer: &LayerWeights, mask: &Tensor) -> Result<Tensor> {
        let hparams = &self.hparams;
        let (seq_len, _) = input.dims2()?;
        let head_dim = hparams.head_dim();
        let num_heads = hparams.num_attention_heads;
        let num_kv_heads = hparams.num_key_value_heads;

        let q = input.matmul(&layer.q_proj.t()?)?;
        let k = input.matmul(&layer.k_proj.t()?)?;
        let v = input.matmul(&layer.v_proj.t()?)?;

        // [heads, seq, head_dim]
        let q = q.reshape((seq_len, num_heads, head_dim))?.transpose(0, 1)?.contiguous()?;
        let k = k.reshape((seq_len, num_kv_heads, head_dim))?.transpose(0, 1)?.contiguous()?;
        let v = v.reshape((seq_len, num_kv_heads, head_dim))?.transpose(0, 1)?.contiguous()?;

        let group_size = num_heads / num_kv_heads;
        let k = repeat_kv(k, group_size)?;
        let v = repeat_kv(v, group_size)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(1, 2)?.contiguous()?)? * scale)?;
        // Position i may only attend to positions <= i
        let scores = scores.broadcast_add(mask)?;
        let attn = ops::softmax_last_dim(&scores)?;

        let context = attn.matmul(&v)?;
        let context = context
            .transpose(0, 1)?
            .reshape((seq_len, num_heads * head_dim))?;
        Ok(context.matmul(&layer.o_proj.t()?)?)
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mut values = vec![0f32; seq_len * seq_len];
        for row in 0..seq_len {
            for col in (row + 1)..seq_len {
                values[row * seq_len + col] = MASK_VALUE;
            }
        }
        Ok(Tensor::from_vec(values, (seq_len, seq_len), &self.device)?)
    }
}

/// Gated feed-forward transform: silu(gate) * up, projected back down.
fn feed_forward(input: &Tensor, layer: &LayerWeights) -> Result<Tensor> {
    let gate = ops::silu(&input.matmul(&layer.gate_proj.t()?)?)?;
    let up = input.matmul(&layer.up_proj.t()?)?;
    Ok((gate * up)?.matmul(&layer.down_proj.t()?)?)
}

/// Root-mean-square normalization: divide by sqrt(mean of squares + eps),
/// scale by the learned per-channel weight. No mean-centering, no bias.
fn rms_norm(input: &Tensor, weight: &Tensor, eps: f64) -> Result<Tensor> {
    let mean_square = input.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = input.broadcast_div(&(mean_square + eps)?.sqrt()?)?;
    Ok(normed.broadcast_mul(weight)?)
}

/// Expand grouped key/value heads so each query head has a matching one.
fn repeat_kv(tensor: Tensor, group_size: usize) -> Result<Tensor> {
    if group_size == 1 {
        return Ok(tensor);
    }
    let (num_kv_heads, seq_len, head_dim) = tensor.dims3()?;
    Ok(tensor
        .unsqueeze(1)?
        .expand((num_kv_heads, group_size, seq_len, head_dim))?
        .contiguous()?
        .reshape((num_kv_heads * group_size, seq_len, head_dim))?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::binder::{LayerWeights, ModelWeights};

    pub(crate) fn tiny_hyperparams() -> Hyperparams {
        Hyperparams {
            vocab_size: 8,
            hidden_size: 4,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            intermediate_size: 6,
            max_position_embeddings: 16,
            rms_norm_eps: 1e-5,
            tie_word_embeddings: false,
        }
    }

    /// Small deterministic values that keep softmax well-conditioned.
    pub(crate) fn patterned(shape: &[usize], offset: usize) -> Tensor {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count)
            .map(|i| (((i + offset) % 13) as f32 - 6.0) * 0.05)
            .collect();
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    pub(crate) fn tiny_engine() -> ForwardEngine {
        let hparams = tiny_hyperparams();
        let hidden = hparams.hidden_size;
        let kv_width = hparams.num_key_value_heads * hparams.head_dim();
        let layers = (0..hparams.num_hidden_layers)
            .map(|layer_idx| LayerWeights {
                attn_norm: patterned(&[hidden], layer_idx),
                q_proj: patterned(&[hidden, hidden], layer_idx + 1),
                k_proj: patterned(&[kv_width, hidden], layer_idx + 2),
                v_proj: patterned(&[kv_width, hidden], layer_idx + 3),
                o_proj: patterned(&[hidden, hidden], layer_idx + 4),
                ffn_norm: patterned(&[hidden], layer_idx + 5),
                gate_proj: patterned(&[hparams.intermediate_size, hidden], layer_idx + 6),
                up_proj: patterned(&[hparams.intermediate_size, hidden], layer_idx + 7),
                down_proj: patterned(&[hidden, hparams.intermediate_size], layer_idx + 8),
            })
            .collect();
        let weights = ModelWeights {
            embed_tokens: patterned(&[hparams.vocab_size, hidden], 11),
            layers,
            final_norm: patterned(&[hidden], 12),
            lm_head: patterned(&[hparams.vocab_size, hidden], 13),
        };
        ForwardEngine::new(weights, hparams, Device::Cpu)
    }
}
