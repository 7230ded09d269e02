//! Generation counters and throughput tracking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lock-free counters for generation activity, shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    generations_started: AtomicUsize,
    generations_completed: AtomicUsize,
    generations_failed: AtomicUsize,
    tokens_generated: AtomicUsize,
    // f64 bits of the most recent tokens-per-second measurement
    last_tokens_per_second: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self) {
        self.generations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, tokens: usize, elapsed: Duration) {
        self.generations_completed.fetch_add(1, Ordering::Relaxed);
        self.tokens_generated.fetch_add(tokens, Ordering::Relaxed);
        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            let tps = tokens as f64 / seconds;
            self.last_tokens_per_second.store(tps.to_bits(), Ordering::Relaxed);
        }
    }

    pub(crate) fn record_failed(&self) {
        self.generations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            generations_started: self.generations_started.load(Ordering::Relaxed),
            generations_completed: self.generations_completed.load(Ordering::Relaxed),
            generations_failed: self.generations_failed.load(Ordering::Relaxed),
            tokens_generated: self.tokens_generated.load(Ordering::Relaxed),
            last_tokens_per_second: f64::from_bits(
                self.last_tokens_per_second.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Snapshot of generation metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Generations requested, including rejected concurrent ones
    pub generations_started: usize,
    /// Generations that fired completion
    pub generations_completed: usize,
    /// Generations that fired an error
    pub generations_failed: usize,
    /// Total tokens generated across completed runs
    pub tokens_generated: usize,
    /// Throughput of the most recent completed run
    pub last_tokens_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_started();
        metrics.record_started();
        metrics.record_completed(50, Duration::from_secs(2));
        metrics.record_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generations_started, 2);
        assert_eq!(snapshot.generations_completed, 1);
        assert_eq!(snapshot.generations_failed, 1);
        assert_eq!(snapshot.tokens_generated, 50);
        assert!((snapshot.last_tokens_per_second - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_keeps_previous_throughput() {
        let metrics = MetricsCollector::new();
        metrics.record_completed(10, Duration::from_secs(1));
        metrics.record_completed(10, Duration::ZERO);
        assert!((metrics.snapshot().last_tokens_per_second - 10.0).abs() < 1e-9);
    }
}
