// Location: src/generation/decoder.rs

//! The decoding loop: repeated forward passes, sampling, context-window
//! eviction, stop conditions, and streaming emission.

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::SamplingParams;
use crate::error::{EngineError, Result};
use crate::model::{ForwardEngine, Tokenizer};
use crate::types::GenerationEvent;

use super::sampler::Sampler;

/// Drives one generation attempt. The caller reports the outcome as exactly
/// one terminal event; this loop only emits tokens.
pub(crate) struct Decoder<'a> {
    engine: &'a ForwardEngine,
    tokenizer: &'a Tokenizer,
    params: SamplingParams,
    max_context: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(
        engine: &'a ForwardEngine,
        tokenizer: &'a Tokenizer,
        params: SamplingParams,
    ) -> Self {
        let max_context = engine.max_context();
        Self { engine, tokenizer, params, max_context }
    }

    /// Run the loop to completion, emitting `Token` events as they decode.
    /// Returns the number of generated tokens.
    pub(crate) fn run(
        &mut self,
        prompt: &str,
        events: &UnboundedSender<GenerationEvent>,
    ) -> Result<usize> {
        let mut context = self.tokenizer.encode(prompt);
        if context.is_empty() {
            return Err(EngineError::generation("prompt tokenized to zero tokens"));
        }
        evict_to_window(&mut context, self.max_context);
        debug!(prompt_tokens = context.len(), "starting generation");

        let mut sampler = Sampler::new(self.params.clone());
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = String::new();
        let eos_id = self.tokenizer.eos_id();

        for _ in 0..self.params.max_tokens {
            let mut logits = self
                .engine
                .forward(&context)
                .map_err(|e| EngineError::generation(format!("forward pass failed: {}", e)))?;

            let token_id = sampler.sample(&mut logits, &generated)?;
            context.push(token_id);
            generated.push(token_id);
            evict_to_window(&mut context, self.max_context);

            if Some(token_id) == eos_id {
                break;
            }

            let text = self.tokenizer.decode(&[token_id]);
            let (fragment, hit_stop) = clip_at_stop(&self.params.stop, &emitted, &text);
            if !fragment.is_empty() {
                emitted.push_str(&fragment);
                let event = GenerationEvent::Token { id: token_id, text: fragment };
                if events.send(event).is_err() {
                    // Receiver dropped; nothing left to deliver to
                    break;
                }
            }
            if hit_stop {
                break;
            }
        }

        Ok(generated.len())
    }
}

/// Evict tokens from the oldest end until the context fits its window.
pub(crate) fn evict_to_window(context: &mut Vec<u32>, max_context: usize) {
    if context.len() > max_context {
        let excess = context.len() - max_context;
        context.drain(0..excess);
    }
}

/// Append `fragment` to the accumulated output, clipping at the earliest
/// stop-sequence match. Returns the emittable part and whether a stop hit.
/// Matching runs over the accumulated text so sequences spanning fragment
/// boundaries are still caught.
pub(crate) fn clip_at_stop(
    stops: &[String],
    accumulated: &str,
    fragment: &str,
) -> (String, bool) {
    if stops.is_empty() || fragment.is_empty() {
        return (fragment.to_string(), false);
    }
    let combined = format!("{}{}", accumulated, fragment);
    let earliest = stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| combined.find(s.as_str()))
        .min();
    match earliest {
        Some(pos) => {
            let clipped = combined[..pos]
                .get(accumulated.len()..)
                .unwrap_or("")
                .to_string();
            (clipped, true)
        }
        None => (fragment.to_string(), false),
    }
}
