//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A quantizer declared a requirement that nobody can satisfy
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A bias quantizer depends on an accumulator scale that was never cached
    #[error(
        "No quant bias cache found, enable cache_inference_bias and run an inference pass first"
    )]
    NoCachedBias,

    #[error("Invalid subtensor slice: {0}")]
    InvalidSlice(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
