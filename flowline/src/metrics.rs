//! Per-stage counters for throughput and backlog observation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking the flow of tasks through one stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
    /// Tasks admitted to the stage.
    admitted: AtomicU64,
    /// Output tasks emitted downstream.
    emitted: AtomicU64,
    /// Tasks dropped after a failed transform.
    dropped: AtomicU64,
    /// Tasks admitted but not yet completed (the backlog).
    in_flight: AtomicU64,
}

impl StageMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an admitted task.
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one emitted output task.
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped task.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records completion of an admitted task, whatever its outcome.
    pub fn record_completed(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the number of admitted tasks.
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Returns the number of emitted output tasks.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped tasks.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of admitted-but-not-completed tasks.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage of admitted tasks.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let admitted = self.admitted.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        if admitted == 0 {
            0.0
        } else {
            (dropped as f64 / admitted as f64) * 100.0
        }
    }

    /// Converts the counters to a JSON snapshot.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "admitted": self.admitted(),
            "emitted": self.emitted(),
            "dropped": self.dropped(),
            "in_flight": self.in_flight(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default() {
        let metrics = StageMetrics::new();
        assert_eq!(metrics.admitted(), 0);
        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.drop_rate(), 0.0);
    }

    #[test]
    fn test_metrics_flow() {
        let metrics = StageMetrics::new();

        metrics.record_admitted();
        metrics.record_admitted();
        assert_eq!(metrics.in_flight(), 2);

        metrics.record_emitted();
        metrics.record_completed();
        assert_eq!(metrics.in_flight(), 1);
        assert_eq!(metrics.emitted(), 1);

        metrics.record_dropped();
        metrics.record_completed();
        assert_eq!(metrics.in_flight(), 0);
        assert!((metrics.drop_rate() - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = StageMetrics::new();
        metrics.record_admitted();
        metrics.record_emitted();

        let snap = metrics.snapshot();
        assert_eq!(snap["admitted"], 1);
        assert_eq!(snap["emitted"], 1);
        assert_eq!(snap["in_flight"], 1);
    }
}
