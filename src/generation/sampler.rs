// Location: src/generation/sampler.rs

//! Candidate filtering and sampling: raw logits in, one token id out.
//!
//! Filter order is fixed: repetition penalty, then temperature scaling and
//! softmax, then min-p, top-k, and top-p, then a weighted draw over the
//! surviving (unnormalized) mass. Temperature at or below zero short-circuits
//! to a deterministic arg-max.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingParams;
use crate::error::{EngineError, Result};

/// Samples next tokens according to a fixed set of parameters. One sampler
/// lives for the duration of one generation.
pub struct Sampler {
    rng: StdRng,
    params: SamplingParams,
}

impl Sampler {
    /// Create a sampler. A present `seed` makes the draw sequence
    /// reproducible; otherwise the RNG seeds from OS entropy.
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, params }
    }

    /// Pick the next token id from raw logits. `generated` is the full list
    /// of tokens produced so far; only the trailing penalty window is read.
    pub fn sample(&mut self, logits: &mut [f32], generated: &[u32]) -> Result<u32> {
        apply_repeat_penalty(
            logits,
            generated,
            self.params.repeat_penalty,
            self.params.repeat_last_n,
        );

        if self.params.temperature <= 0.0 {
            return Ok(argmax(logits));
        }

        let mut probs = softmax_scaled(logits, self.params.temperature);
        min_p_filter(&mut probs, self.params.min_p);
        top_k_filter(&mut probs, self.params.top_k);
        top_p_filter(&mut probs, self.params.top_p);

        let distribution = WeightedIndex::new(probs.iter().copied())
            .map_err(|e| EngineError::generation(format!("token draw failed: {}", e)))?;
        Ok(distribution.sample(&mut self.rng) as u32)
    }
}

/// Divide positive logits by the penalty and multiply negative ones by it,
/// for every distinct id in the last `last_n` generated tokens.
pub(crate) fn apply_repeat_penalty(
    logits: &mut [f32],
    generated: &[u32],
    penalty: f32,
    last_n: usize,
) {
    if penalty == 1.0 || last_n == 0 || generated.is_empty() {
        return;
    }
    let start = generated.len().saturating_sub(last_n);
    let window: HashSet<u32> = generated[start..].iter().copied().collect();
    for id in window {
        let idx = id as usize;
        if idx >= logits.len() {
            continue;
        }
        if logits[idx] > 0.0 {
            logits[idx] /= penalty;
        } else {
            logits[idx] *= penalty;
        }
    }
}

/// Index of the highest logit; ties resolve to the lowest index so greedy
/// decoding is deterministic.
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (idx, &value) in logits.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best = idx;
        }
    }
    best as u32
}

/// Scale by 1/temperature and apply a numerically stable softmax.
fn softmax_scaled(logits: &[f32], temperature: f64) -> Vec<f32> {
    let inv_temp = (1.0 / temperature) as f32;
    let scaled: Vec<f32> = logits.iter().map(|&l| l * inv_temp).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Drop candidates whose probability is below `min_p` times the maximum.
fn min_p_filter(probs: &mut [f32], min_p: f64) {
    if min_p <= 0.0 {
        return;
    }
    let max = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = max * min_p as f32;
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Keep only the k highest-probability surviving candidates.
fn top_k_filter(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut indices: Vec<usize> = (0..probs.len()).collect();
    indices.select_nth_unstable_by(k, |&a, &b| {
        probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal)
    });
    for &idx in &indices[k..] {
        probs[idx] = 0.0;
    }
}

/// Keep the smallest descending-probability prefix whose cumulative
/// probability reaches `top_p`; zero out the rest.
fn top_p_filter(probs: &mut [f32], top_p: f64) {
    if top_p <= 0.0 || top_p >= 1.0 {
        return;
    }
    let mut survivors: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
    survivors.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0f64;
    let mut keep = survivors.len();
    for (count, &idx) in survivors.iter().enumerate() {
        cumulative += probs[idx] as f64;
        if cumulative >= top_p {
            keep = count + 1;
            break;
        }
    }
    for &idx in &survivors[keep..] {
        probs[idx] = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_count(probs: &[f32]) -> usize {
        probs.iter().filter(|&&p| p > 0.0).count()
    }

    #[test]
    fn test_repeat_penalty_scenario() {
        // Window of 2 over [5, 5, 7] covers ids {5, 7}
        let mut logits = vec![0.0f32; 10];
        logits[5] = 2.0;
        logits[7] = -1.0;
        apply_repeat_penalty(&mut logits, &[5, 5, 7], 1.2, 2);
        assert!((logits[5] - 2.0 / 1.2).abs() < 1e-6);
        // Negative logits are multiplied instead
        assert!((logits[7] - (-1.2)).abs() < 1e-6);
    }

    #[test]
    fn test_penalty_applies_once_per_distinct_id() {
        let mut logits = vec![2.0f32, 0.0];
        apply_repeat_penalty(&mut logits, &[0, 0, 0], 2.0, 3);
        assert!((logits[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_greedy_determinism() {
        let params = SamplingParams { temperature: 0.0, ..Default::default() };
        let mut sampler = Sampler::new(params.clone());
        let mut logits = vec![0.1f32, 3.0, 0.2, 2.9];
        let first = sampler.sample(&mut logits.clone(), &[]).unwrap();
        let mut sampler = Sampler::new(params);
        let second = sampler.sample(&mut logits, &[]).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            seed: Some(42),
            ..Default::default()
        };
        let logits = vec![1.0f32, 1.1, 0.9, 1.05];
        let draw = |params: SamplingParams| {
            let mut sampler = Sampler::new(params);
            (0..8)
                .map(|_| sampler.sample(&mut logits.clone(), &[]).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(params.clone()), draw(params));
    }

    #[test]
    fn test_min_p_filter() {
        let mut probs = vec![0.5f32, 0.3, 0.01, 0.19];
        min_p_filter(&mut probs, 0.1);
        // Threshold is 0.05; only the 0.01 entry drops
        assert_eq!(live_count(&probs), 3);
        assert_eq!(probs[2], 0.0);
    }

    #[test]
    fn test_top_k_filter() {
        let mut probs = vec![0.1f32, 0.4, 0.2, 0.3];
        top_k_filter(&mut probs, 2);
        assert_eq!(live_count(&probs), 2);
        assert!(probs[1] > 0.0 && probs[3] > 0.0);
    }

    #[test]
    fn test_top_p_keeps_smallest_sufficient_prefix() {
        let mut probs = vec![0.5f32, 0.3, 0.2];
        top_p_filter(&mut probs, 0.5);
        // The top candidate alone reaches the threshold
        assert_eq!(live_count(&probs), 1);
        assert!(probs[0] > 0.0);

        let mut probs = vec![0.4f32, 0.35, 0.25];
        top_p_filter(&mut probs, 0.5);
        assert_eq!(live_count(&probs), 2);
    }

    #[test]
    fn test_filter_nesting() {
        // top-k then top-p never retains more than top-k alone
        let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let probs = softmax_scaled(&logits, 1.0);

        let mut k_only = probs.clone();
        top_k_filter(&mut k_only, 8);

        let mut k_then_p = probs;
        top_k_filter(&mut k_then_p, 8);
        top_p_filter(&mut k_then_p, 0.9);

        assert!(live_count(&k_then_p) <= live_count(&k_only));
    }

    #[test]
    fn test_sample_respects_filters() {
        // With top_k = 1 the draw can only ever hit the arg-max
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            min_p: 0.0,
            seed: Some(7),
            ..Default::default()
        };
        let mut sampler = Sampler::new(params);
        for _ in 0..16 {
            let mut logits = vec![0.5f32, 2.5, 0.1, 1.0];
            assert_eq!(sampler.sample(&mut logits, &[]).unwrap(), 1);
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax_scaled(&[1.0, 2.0, 3.0], 0.7);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }
}
