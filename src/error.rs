//! Error taxonomy for the runtime.
//!
//! Load-time failures are reported synchronously through [`Result`];
//! generation-time failures travel once through the event stream and
//! suppress the completion event.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// All error conditions surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing model directory, missing configuration, or no usable weight
    /// files after trying every shard.
    #[error("load error: {message}")]
    Load {
        /// Human-readable description of what failed to load.
        message: String,
    },

    /// A tensor's shape contradicts its declared role, or binding could not
    /// resolve a mandatory tensor through any alias.
    #[error("integrity error: {message}")]
    Integrity {
        /// Which tensor or contract was violated.
        message: String,
    },

    /// The vocabulary is empty or absent, or the tokenizer files are
    /// malformed.
    #[error("tokenizer error: {message}")]
    Tokenizer {
        /// Description of the tokenizer problem.
        message: String,
    },

    /// A generation was requested while another one is running. The request
    /// is rejected, never queued.
    #[error("a generation is already running")]
    Concurrency,

    /// The prompt tokenized to nothing, or a forward-pass step failed.
    #[error("generation error: {message}")]
    Generation {
        /// Description of the generation failure.
        message: String,
    },

    /// An error bubbled up from the tensor back end.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),

    /// An I/O error while reading model files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn load(message: impl Into<String>) -> Self {
        Self::Load { message: message.into() }
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity { message: message.into() }
    }

    pub(crate) fn tokenizer(message: impl Into<String>) -> Self {
        Self::Tokenizer { message: message.into() }
    }

    pub(crate) fn generation(message: impl Into<String>) -> Self {
        Self::Generation { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::load("missing config.json");
        assert_eq!(error.to_string(), "load error: missing config.json");

        let error = EngineError::Concurrency;
        assert_eq!(error.to_string(), "a generation is already running");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: EngineError = io.into();
        assert!(matches!(error, EngineError::Io(_)));
    }
}
