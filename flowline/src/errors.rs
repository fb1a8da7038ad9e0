//! Error types for the flowline engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for flowline operations.
#[derive(Debug, Error)]
pub enum FlowlineError {
    /// A task was offered to a stage that has shut down.
    #[error("{0}")]
    ClosedStage(#[from] ClosedStageError),

    /// A task was offered to a pipeline that has shut down.
    #[error("{0}")]
    ClosedPipeline(#[from] ClosedPipelineError),

    /// A sequence-number invariant was violated during reassembly.
    #[error("{0}")]
    SequenceIntegrity(#[from] SequenceIntegrityError),

    /// A pipeline failed validation at build time.
    #[error("{0}")]
    Build(#[from] PipelineBuildError),

    /// A transformation failed on one task.
    #[error("{0}")]
    Transform(#[from] TransformError),
}

/// Error raised when `put` is called on a stage after shutdown.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage}' is shut down and no longer accepts tasks")]
pub struct ClosedStageError {
    /// The stage that rejected the task.
    pub stage: String,
}

impl ClosedStageError {
    /// Creates a new closed-stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
        }
    }
}

/// Error raised when `put` is called on a pipeline after shutdown.
#[derive(Debug, Clone, Error)]
#[error("pipeline is shut down and no longer accepts tasks")]
pub struct ClosedPipelineError;

impl From<ClosedStageError> for ClosedPipelineError {
    fn from(_: ClosedStageError) -> Self {
        Self
    }
}

/// Fatal reassembly error: a duplicate, regressed, or missing sequence
/// number reached the ordered output side.
///
/// This indicates a bug in sequence-number assignment; the stage halts
/// rather than emit results in the wrong order.
#[derive(Debug, Clone, Error)]
#[error("sequence integrity violated in stage '{stage}': {kind} (next expected {expected}, got {found})")]
pub struct SequenceIntegrityError {
    /// The stage where the violation was detected.
    pub stage: String,
    /// What went wrong.
    pub kind: SequenceViolation,
    /// The sequence number the reassembler expected next.
    pub expected: u64,
    /// The sequence number it saw instead.
    pub found: u64,
}

/// The kind of sequence-number violation detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceViolation {
    /// A completion arrived for a number that was already emitted or is
    /// already buffered.
    Duplicate,
    /// The stop marker arrived while buffered completions still wait for a
    /// number that never showed up.
    Missing,
}

impl std::fmt::Display for SequenceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate sequence number"),
            Self::Missing => write!(f, "missing sequence number"),
        }
    }
}

/// Error raised when a pipeline fails validation at build time.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineBuildError {
    /// The error message.
    pub message: String,
}

impl PipelineBuildError {
    /// Creates a new build error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error returned by a transformation for a single task.
///
/// Transform errors are recovered locally: the worker retries per the
/// stage's retry policy and finally drops the task, reporting the fault
/// out of band. The pipeline keeps running.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("transform failed: {message}")]
pub struct TransformError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether retrying the same task may succeed.
    pub retryable: bool,
}

impl TransformError {
    /// Creates a retryable transform error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates an error that must not be retried.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_stage_display() {
        let err = ClosedStageError::new("resize");
        assert_eq!(
            err.to_string(),
            "stage 'resize' is shut down and no longer accepts tasks"
        );
    }

    #[test]
    fn test_sequence_integrity_display() {
        let err = SequenceIntegrityError {
            stage: "detect".to_string(),
            kind: SequenceViolation::Duplicate,
            expected: 4,
            found: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("detect"));
        assert!(msg.contains("duplicate sequence number"));
        assert!(msg.contains("expected 4"));
    }

    #[test]
    fn test_transform_error_retryable() {
        assert!(TransformError::new("timeout").retryable);
        assert!(!TransformError::fatal("bad input").retryable);
    }

    #[test]
    fn test_error_conversion() {
        let err: FlowlineError = ClosedStageError::new("s").into();
        assert!(matches!(err, FlowlineError::ClosedStage(_)));

        let err: ClosedPipelineError = ClosedStageError::new("s").into();
        assert_eq!(
            err.to_string(),
            "pipeline is shut down and no longer accepts tasks"
        );
    }
}
