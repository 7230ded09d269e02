// Location: src/session.rs

//! The session: an explicitly owned handle to one loaded model.
//!
//! The session serializes access to the model behind a single mutex, held
//! for the duration of a load and for the duration of each generation. Only
//! one generation runs at a time; a second request observes the concurrency
//! error on its stream instead of being queued.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Hyperparams, SamplingParams};
use crate::error::{EngineError, Result};
use crate::generation::Decoder;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::model::{bind, ForwardEngine, Tokenizer, WeightRepository};
use crate::types::{GenerationEvent, GenerationStream};

/// Everything owned for the lifetime of one loaded model.
struct LoadedModel {
    engine: ForwardEngine,
    tokenizer: Option<Tokenizer>,
}

/// A loaded model plus the machinery to stream generations from it.
pub struct Session {
    model: Arc<Mutex<Option<LoadedModel>>>,
    running: Arc<AtomicBool>,
    metrics: Arc<MetricsCollector>,
}

impl Session {
    /// Create an empty session. Nothing is loaded until [`Session::load`].
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Load a model directory: hyperparameters, weights, and (when present)
    /// the tokenizer. Replaces any previously loaded model on success.
    pub fn load(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let started = Instant::now();
        let mut slot = self.model.lock();

        if !dir.is_dir() {
            return Err(EngineError::load(format!(
                "model directory not found: {}",
                dir.display()
            )));
        }
        let hparams = Hyperparams::from_file(&dir.join("config.json"))?;
        let device = crate::device();

        let repository = WeightRepository::load(dir, &hparams, &device)?;
        info!(tensors = repository.len(), "weight repository assembled");
        let weights = bind(&repository, &hparams)?;

        // A weights-only directory still loads; generation will report the
        // missing tokenizer instead.
        let tokenizer = match Tokenizer::from_dir(dir) {
            Ok(tokenizer) => tokenizer,
            Err(e) => {
                warn!("tokenizer unavailable: {}", e);
                None
            }
        };

        let engine = ForwardEngine::new(weights, hparams, device);
        *slot = Some(LoadedModel { engine, tokenizer });
        info!(elapsed = ?started.elapsed(), "model loaded from {}", dir.display());
        Ok(())
    }

    /// Start a generation and return immediately with its event stream.
    ///
    /// The stream yields zero or more `Token` events followed by exactly one
    /// of `Error` or `Complete`. If a generation is already running the
    /// stream yields the concurrency error at once and no worker starts.
    pub fn generate_stream(&self, prompt: &str, params: SamplingParams) -> GenerationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.metrics.record_started();

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.metrics.record_failed();
            let _ = tx.send(GenerationEvent::Error(EngineError::Concurrency));
            return GenerationStream::new(rx);
        }

        let model = Arc::clone(&self.model);
        let running = Arc::clone(&self.running);
        let metrics = Arc::clone(&self.metrics);
        let prompt = prompt.to_string();

        // One worker thread per generation call; steps inside it are
        // strictly sequential.
        thread::spawn(move || {
            let started = Instant::now();
            let guard = model.lock();
            let outcome = match guard.as_ref() {
                None => Err(EngineError::load("no model loaded")),
                Some(loaded) => match &loaded.tokenizer {
                    None => Err(EngineError::tokenizer(
                        "model has no tokenizer; generation unavailable",
                    )),
                    Some(tokenizer) => {
                        Decoder::new(&loaded.engine, tokenizer, params).run(&prompt, &tx)
                    }
                },
            };
            // Release the slot before the terminal event so a consumer
            // reacting to it can start the next generation immediately.
            running.store(false, Ordering::SeqCst);
            match outcome {
                Ok(generated) => {
                    metrics.record_completed(generated, started.elapsed());
                    let _ = tx.send(GenerationEvent::Complete { generated });
                }
                Err(e) => {
                    metrics.record_failed();
                    let _ = tx.send(GenerationEvent::Error(e));
                }
            }
        });

        GenerationStream::new(rx)
    }

    /// Convert text to token ids with the loaded tokenizer.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let guard = self.model.lock();
        Ok(self.tokenizer_of(&guard)?.encode(text))
    }

    /// Convert token ids back to text with the loaded tokenizer.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let guard = self.model.lock();
        Ok(self.tokenizer_of(&guard)?.decode(ids))
    }

    fn tokenizer_of<'a>(
        &self,
        guard: &'a parking_lot::MutexGuard<'_, Option<LoadedModel>>,
    ) -> Result<&'a Tokenizer> {
        let loaded = guard
            .as_ref()
            .ok_or_else(|| EngineError::load("no model loaded"))?;
        loaded
            .tokenizer
            .as_ref()
            .ok_or_else(|| EngineError::tokenizer("model has no tokenizer"))
    }

    /// Whether a model is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().is_some()
    }

    /// Whether a generation is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current generation metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;

    /// Write a complete synthetic model directory: config, one safetensors
    /// shard with canonical names, and a tokenizer.
    fn write_model_dir() -> tempfile::TempDir {
        use candle_core::{Device, Tensor};

        let dir = tempfile::tempdir().unwrap();
        let config = json!({
            "vocab_size": 8,
            "hidden_size": 4,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "intermediate_size": 6,
            "max_position_embeddings": 16,
            "rms_norm_eps": 1e-5
        });
        fs::write(dir.path().join("config.json"), config.to_string()).unwrap();

        let tensor = |shape: &[usize], offset: usize| {
            let count: usize = shape.iter().product();
            let values: Vec<f32> = (0..count)
                .map(|i| (((i + offset) % 11) as f32 - 5.0) * 0.05)
                .collect();
            Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
        };

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert("model.embed_tokens.weight".into(), tensor(&[8, 4], 1));
        tensors.insert("model.norm.weight".into(), tensor(&[4], 2));
        tensors.insert("lm_head.weight".into(), tensor(&[8, 4], 3));
        for (name, shape, offset) in [
            ("self_attn.q_proj", vec![4usize, 4], 4),
            ("self_attn.k_proj", vec![4, 4], 5),
            ("self_attn.v_proj", vec![4, 4], 6),
            ("self_attn.o_proj", vec![4, 4], 7),
            ("mlp.gate_proj", vec![6, 4], 8),
            ("mlp.up_proj", vec![6, 4], 9),
            ("mlp.down_proj", vec![4, 6], 10),
        ] {
            tensors.insert(
                format!("model.layers.0.{}.weight", name),
                tensor(&shape, offset),
            );
        }
        tensors.insert("model.layers.0.input_layernorm.weight".into(), tensor(&[4], 11));
        tensors.insert(
            "model.layers.0.post_attention_layernorm.weight".into(),
            tensor(&[4], 12),
        );
        candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

        let tokenizer = json!({
            "model": {
                "vocab": {"a": 0, "b": 1, "c": 2, "d": 3, "e": 4},
                "merges": []
            },
            "added_tokens": [
                {"id": 5, "content": "<s>", "special": true},
                {"id": 6, "content": "</s>", "special": true},
                {"id": 7, "content": "<unk>", "special": true}
            ]
        });
        fs::write(dir.path().join("tokenizer.json"), tokenizer.to_string()).unwrap();
        let tokenizer_config = json!({
            "bos_token": "<s>",
            "eos_token": "</s>",
            "unk_token": "<unk>",
            "add_bos_token": true,
            "add_eos_token": false
        });
        fs::write(
            dir.path().join("tokenizer_config.json"),
            tokenizer_config.to_string(),
        )
        .unwrap();

        dir
    }

    #[test]
    fn test_load_missing_directory() {
        let session = Session::new();
        let result = session.load("/nonexistent/model");
        assert!(matches!(result, Err(EngineError::Load { .. })));
        assert!(!session.is_loaded());
    }

    #[test]
    fn test_load_directory_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new();
        assert!(matches!(session.load(dir.path()), Err(EngineError::Load { .. })));
    }

    #[test]
    fn test_load_and_tokenize() -> anyhow::Result<()> {
        let dir = write_model_dir();
        let session = Session::new();
        session.load(dir.path())?;
        assert!(session.is_loaded());

        // BOS is prepended per tokenizer_config
        let ids = session.encode("ab")?;
        assert_eq!(ids, vec![5, 0, 1]);
        assert_eq!(session.decode(&ids)?, "ab");
        Ok(())
    }

    #[test]
    fn test_encode_without_model() {
        let session = Session::new();
        assert!(matches!(session.encode("hi"), Err(EngineError::Load { .. })));
    }

    #[tokio::test]
    async fn test_generate_without_model_reports_on_stream() {
        let session = Session::new();
        let mut stream = session.generate_stream("hi", SamplingParams::default());
        match stream.recv().await {
            Some(GenerationEvent::Error(EngineError::Load { .. })) => {}
            other => panic!("expected load error, got {:?}", other),
        }
        // The failed attempt releases the running flag
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_concurrency_error_when_already_running() {
        let session = Session::new();
        session.running.store(true, Ordering::SeqCst);

        let mut stream = session.generate_stream("hi", SamplingParams::default());
        match stream.recv().await {
            Some(GenerationEvent::Error(EngineError::Concurrency)) => {}
            other => panic!("expected concurrency error, got {:?}", other),
        }
        // The rejected request must not clear the in-flight flag
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_streaming_generation_end_to_end() {
        let dir = write_model_dir();
        let session = Session::new();
        session.load(dir.path()).unwrap();

        let params = SamplingParams { temperature: 0.0, max_tokens: 4, ..Default::default() };
        let mut stream = session.generate_stream("abc", params);

        let mut tokens = 0usize;
        let mut completed = None;
        while let Some(event) = stream.recv().await {
            match event {
                GenerationEvent::Token { text, .. } => {
                    assert!(!text.is_empty());
                    tokens += 1;
                }
                GenerationEvent::Complete { generated } => {
                    completed = Some(generated);
                    break;
                }
                GenerationEvent::Error(e) => panic!("generation failed: {}", e),
            }
        }
        let generated = completed.expect("no completion event");
        assert!(generated <= 4);
        assert!(tokens <= generated);
        assert!(!session.is_running());

        let metrics = session.metrics();
        assert_eq!(metrics.generations_completed, 1);
    }

    #[tokio::test]
    async fn test_zero_budget_completes_immediately() {
        let dir = write_model_dir();
        let session = Session::new();
        session.load(dir.path()).unwrap();

        let params = SamplingParams { temperature: 0.0, max_tokens: 0, ..Default::default() };
        let mut stream = session.generate_stream("abc", params);
        match stream.recv().await {
            Some(GenerationEvent::Complete { generated: 0 }) => {}
            other => panic!("expected immediate completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_greedy_streams_are_identical() -> anyhow::Result<()> {
        let dir = write_model_dir();
        let session = Session::new();
        session.load(dir.path())?;

        let run = |session: &Session| {
            let params =
                SamplingParams { temperature: 0.0, max_tokens: 3, ..Default::default() };
            session.generate_stream("ab", params)
        };

        let first = run(&session).collect_text().await?;
        let second = run(&session).collect_text().await?;
        assert_eq!(first, second);
        Ok(())
    }
}
