//! Error types for MinHash deduplication.

use sluice_core::SluiceError;
use sluice_pipeline::PipelineError;
use thiserror::Error;

/// Result type for dedup operations.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors raised by the dedup stages.
#[derive(Error, Debug)]
pub enum DedupError {
    /// Rejected `MinhashConfig`.
    #[error("Invalid MinHash configuration: {0}")]
    InvalidConfig(String),

    /// A signature file written under another configuration.
    #[error("Signature file {file} is incompatible with the current configuration: {reason}")]
    IncompatibleSignatures { file: String, reason: String },

    /// Truncated or foreign intermediate file.
    #[error("Corrupt {kind} file {file}: {reason}")]
    Corrupt {
        kind: &'static str,
        file: String,
        reason: String,
    },

    /// The stage was started with the wrong number of tasks.
    #[error("Stage '{stage}' expects {expected} tasks, got {actual}")]
    TaskCount {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage or compression error.
    #[error(transparent)]
    Core(#[from] SluiceError),

    /// A stage executor failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary record encoding error.
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl From<DedupError> for PipelineError {
    fn from(err: DedupError) -> Self {
        match err {
            DedupError::Core(core) => PipelineError::Core(core),
            DedupError::Pipeline(inner) => inner,
            other => PipelineError::step(other),
        }
    }
}
