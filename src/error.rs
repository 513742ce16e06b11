//! Error types for Comprimir

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Capture failed for sample {sample}: {reason}")]
    Capture { sample: usize, reason: String },

    #[error("Calibration failed at block {block}, module {module}: {reason}")]
    Calibration {
        block: usize,
        module: String,
        reason: String,
    },

    #[error("Degenerate statistics: {0}")]
    DegenerateStats(String),

    #[error("Deploy failed: {0}")]
    Deploy(String),

    #[error("Cache cardinality broken: expected {expected} entries, got {got}")]
    CacheCardinality { expected: usize, got: usize },

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
