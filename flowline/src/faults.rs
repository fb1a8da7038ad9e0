//! Out-of-band fault reporting for dropped tasks.
//!
//! When a transform exhausts its retries the task is dropped from the
//! stream; the drop is reported through the stage's [`FaultSink`] so callers
//! can observe failure rates instead of results silently vanishing.

use crate::errors::TransformError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of one dropped task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFault {
    /// Name of the stage that dropped the task.
    pub stage: String,
    /// Number of attempts made before giving up.
    pub attempts: usize,
    /// The final error.
    pub error: TransformError,
    /// When the task was dropped.
    pub timestamp: DateTime<Utc>,
}

impl TaskFault {
    /// Creates a new fault record stamped with the current time.
    #[must_use]
    pub fn new(stage: impl Into<String>, attempts: usize, error: TransformError) -> Self {
        Self {
            stage: stage.into(),
            attempts,
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for sinks that receive fault reports.
///
/// Reporting must never fail or block the worker; implementations swallow
/// their own errors.
pub trait FaultSink: Send + Sync {
    /// Receives one fault report.
    fn report(&self, fault: TaskFault);
}

/// A fault sink that logs through the tracing framework.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFaultSink;

impl FaultSink for LoggingFaultSink {
    fn report(&self, fault: TaskFault) {
        tracing::warn!(
            stage = %fault.stage,
            attempts = fault.attempts,
            error = %fault.error,
            "task dropped after failed transform"
        );
    }
}

/// A fault sink that discards all reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpFaultSink;

impl FaultSink for NoOpFaultSink {
    fn report(&self, _fault: TaskFault) {
        // Intentionally empty - discards all reports
    }
}

/// A collecting fault sink for testing and drop-rate observation.
#[derive(Debug, Default)]
pub struct CollectingFaultSink {
    faults: parking_lot::RwLock<Vec<TaskFault>>,
}

impl CollectingFaultSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected faults.
    #[must_use]
    pub fn faults(&self) -> Vec<TaskFault> {
        self.faults.read().clone()
    }

    /// Returns the number of collected faults.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.read().len()
    }

    /// Returns true if no faults have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.read().is_empty()
    }

    /// Clears all collected faults.
    pub fn clear(&self) {
        self.faults.write().clear();
    }

    /// Returns faults reported by the given stage.
    #[must_use]
    pub fn faults_for(&self, stage: &str) -> Vec<TaskFault> {
        self.faults
            .read()
            .iter()
            .filter(|f| f.stage == stage)
            .cloned()
            .collect()
    }
}

impl FaultSink for CollectingFaultSink {
    fn report(&self, fault: TaskFault) {
        self.faults.write().push(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_sink() {
        let sink = LoggingFaultSink;
        sink.report(TaskFault::new("s", 1, TransformError::new("x")));
        // Should not panic
    }

    #[test]
    fn test_noop_sink() {
        let sink = NoOpFaultSink;
        sink.report(TaskFault::new("s", 1, TransformError::new("x")));
        // Should not panic
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingFaultSink::new();
        assert!(sink.is_empty());

        sink.report(TaskFault::new("a", 1, TransformError::new("one")));
        sink.report(TaskFault::new("b", 3, TransformError::new("two")));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.faults()[0].stage, "a");
        assert_eq!(sink.faults()[1].attempts, 3);
    }

    #[test]
    fn test_collecting_sink_filter_and_clear() {
        let sink = CollectingFaultSink::new();
        sink.report(TaskFault::new("a", 1, TransformError::new("one")));
        sink.report(TaskFault::new("a", 1, TransformError::new("two")));
        sink.report(TaskFault::new("b", 1, TransformError::new("three")));

        assert_eq!(sink.faults_for("a").len(), 2);

        sink.clear();
        assert!(sink.is_empty());
    }
}
