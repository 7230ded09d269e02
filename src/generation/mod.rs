//! The decoding loop and the candidate-filtering/sampling pipeline.

pub(crate) mod decoder;
pub(crate) mod sampler;

pub(crate) use decoder::Decoder;
pub use sampler::Sampler;
