//! Local inference runtime for transformer language models.
//!
//! This crate loads hyperparameters, weight shards, and a byte-level BPE
//! tokenizer from a model directory, then streams generated text one token
//! at a time through an event stream.

#![warn(missing_docs)]

use std::fmt;

use candle_core::Device;

// Public modules
pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod types;

// Internal modules
mod generation;
mod model;
mod utils;

/// Crate version, taken from the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::{Hyperparams, SamplingParams};
pub use error::{EngineError, Result};
pub use generation::Sampler;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use model::{SpecialTokens, Tokenizer};
pub use session::Session;
pub use types::{GenerationEvent, GenerationStream};
pub use utils::logging::{setup_logging, LogConfig};

/// Pick the compute device for a model load: an accelerator when the
/// matching feature is enabled and a device is present, CPU otherwise.
pub(crate) fn device() -> Device {
    #[cfg(feature = "cuda")]
    if let Ok(device) = Device::new_cuda(0) {
        return device;
    }
    #[cfg(feature = "metal")]
    if let Ok(device) = Device::new_metal(0) {
        return device;
    }
    Device::Cpu
}

/// Feature detection for supported backends
pub struct Features {
    /// Whether a CUDA device is usable
    pub cuda: bool,
    /// Whether a Metal device is usable
    pub metal: bool,
}

impl Features {
    /// Detect available backends at runtime
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        let cuda = Device::new_cuda(0).is_ok();
        #[cfg(not(feature = "cuda"))]
        let cuda = false;

        #[cfg(feature = "metal")]
        let metal = Device::new_metal(0).is_ok();
        #[cfg(not(feature = "metal"))]
        let metal = false;

        Self { cuda, metal }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        writeln!(f, "Metal support: {}", if self.metal { "yes" } else { "no" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_detection() {
        let features = Features::detect();
        println!("Detected features:\n{}", features);
    }

    #[test]
    fn test_version_number() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_device() {
        // Without accelerator features the default device is the CPU
        if !cfg!(any(feature = "cuda", feature = "metal")) {
            assert!(device().is_cpu());
        }
    }
}
