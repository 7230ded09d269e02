//! Model loading and inference: weight repository, layer binder, forward
//! pass, and tokenizer.

pub(crate) mod binder;
pub(crate) mod forward;
pub(crate) mod repository;
pub(crate) mod tokenizer;

// Re-export core types used throughout the crate
pub use binder::{bind, LayerWeights, ModelWeights, TensorRole};
pub use forward::ForwardEngine;
pub use repository::WeightRepository;
pub use tokenizer::{SpecialTokens, Tokenizer};
