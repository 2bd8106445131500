//! Error types for pipeline execution.

use std::fmt;

use serde::{Deserialize, Serialize};
use sluice_core::SluiceError;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// One failed task of an executor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Task index.
    pub rank: usize,
    /// Rendered error chain.
    pub error: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {:05}: {}", self.rank, self.error)
    }
}

/// Errors that can occur while building or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid executor or step configuration, including stale checkpoints.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An upstream executor did not reach full completion.
    #[error("Dependency '{stage}' not satisfied: {reason}")]
    DependencyFailure { stage: String, reason: String },

    /// One or more tasks failed; successful tasks kept their markers.
    #[error("{} of stage '{stage}' failed: {}", plural_tasks(.failures.len()), summarize(.failures))]
    TasksFailed {
        stage: String,
        failures: Vec<TaskFailure>,
    },

    /// The run was cancelled by the operator.
    #[error("Execution cancelled")]
    Cancelled,

    /// Core (storage, compression) error.
    #[error(transparent)]
    Core(#[from] SluiceError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parquet decoding error.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow error.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Malformed input record.
    #[error("Parse error in {source_name} at row {row}: {message}")]
    Parse {
        source_name: String,
        row: usize,
        message: String,
    },

    /// Domain error raised by a step.
    #[error("{0}")]
    Step(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl PipelineError {
    /// Wrap any error raised inside a step.
    pub fn step<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Step(Box::new(err))
    }

    /// True for errors that must stop the executor before any task runs.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::DependencyFailure { .. }
        )
    }
}

fn plural_tasks(n: usize) -> String {
    if n == 1 {
        "1 task".to_string()
    } else {
        format!("{n} tasks")
    }
}

fn summarize(failures: &[TaskFailure]) -> String {
    const SHOWN: usize = 5;
    let mut parts: Vec<String> = failures.iter().take(SHOWN).map(ToString::to_string).collect();
    if failures.len() > SHOWN {
        parts.push(format!("... and {} more", failures.len() - SHOWN));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_failed_message_lists_ranks() {
        let err = PipelineError::TasksFailed {
            stage: "signatures".into(),
            failures: vec![
                TaskFailure {
                    rank: 2,
                    error: "disk full".into(),
                },
                TaskFailure {
                    rank: 7,
                    error: "bad json".into(),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("2 tasks of stage 'signatures' failed"));
        assert!(msg.contains("task 00002: disk full"));
        assert!(msg.contains("task 00007: bad json"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Configuration("x".into()).is_fatal());
        assert!(PipelineError::DependencyFailure {
            stage: "a".into(),
            reason: "b".into()
        }
        .is_fatal());
        assert!(!PipelineError::Cancelled.is_fatal());
    }
}
