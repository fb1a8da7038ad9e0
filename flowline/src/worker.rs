//! Worker loops shared by ordered and unordered stages.
//!
//! Workers in a stage pull from one shared input channel; receive is
//! serialized behind an async mutex while processing runs in parallel. The
//! stop marker circulates inside the stage until every worker has observed
//! it: each observer decrements the countdown and re-enqueues the marker,
//! and the worker that decrements it to zero forwards a single stop
//! downstream instead.

use crate::envelope::{Envelope, Sequenced};
use crate::faults::{FaultSink, TaskFault};
use crate::metrics::StageMetrics;
use crate::retry::RetryPolicy;
use crate::stage::Outlet;
use crate::transform::Transform;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};

/// Input channel shared by all workers of a stage.
pub(crate) type SharedReceiver<M> = Arc<Mutex<UnboundedReceiver<M>>>;

/// Everything a worker needs besides its channels.
pub(crate) struct WorkerContext<T> {
    pub(crate) stage: String,
    pub(crate) transform: Arc<dyn Transform<T>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) faults: Arc<dyn FaultSink>,
    pub(crate) metrics: Arc<StageMetrics>,
    pub(crate) countdown: Arc<AtomicUsize>,
}

/// A finished unit of work reported to the ordered reassembly task.
pub(crate) enum Completion<T> {
    /// The output batch for one sequence number. Empty if the task was
    /// dropped; reassembly must still advance past it.
    Batch { seq: u64, tasks: Vec<T> },
    /// All workers have observed the stop marker.
    Stop,
}

impl<T> WorkerContext<T>
where
    T: Send + Clone + 'static,
{
    /// Applies the transform with bounded retry.
    ///
    /// Returns `None` when the task was dropped; the drop has already been
    /// counted and reported by then.
    pub(crate) async fn apply_with_retry(&self, task: T) -> Option<Vec<T>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transform.transform(task.clone()).await {
                Ok(batch) => return Some(batch),
                Err(error) => {
                    if error.retryable && self.retry.allows_retry(attempt) {
                        tracing::debug!(
                            stage = %self.stage,
                            attempt,
                            error = %error,
                            "transform failed, retrying"
                        );
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    } else {
                        self.metrics.record_dropped();
                        self.faults.report(TaskFault::new(&self.stage, attempt, error));
                        return None;
                    }
                }
            }
        }
    }

    /// Decrements the countdown; true for the worker that reaches zero.
    fn last_worker_out(&self) -> bool {
        self.countdown.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Worker loop for an ordered stage.
///
/// Completed batches are handed to the reassembly task keyed by sequence
/// number; the worker never emits downstream itself.
pub(crate) async fn run_ordered<T>(
    ctx: Arc<WorkerContext<T>>,
    input: SharedReceiver<Envelope<Sequenced<T>>>,
    reinject: UnboundedSender<Envelope<Sequenced<T>>>,
    completions: UnboundedSender<Completion<T>>,
) where
    T: Send + Clone + 'static,
{
    loop {
        let message = { input.lock().await.recv().await };
        match message {
            Some(Envelope::Task(Sequenced { seq, payload })) => {
                let tasks = ctx.apply_with_retry(payload).await.unwrap_or_default();
                if completions.send(Completion::Batch { seq, tasks }).is_err() {
                    // Reassembly halted; nothing left to do.
                    break;
                }
            }
            Some(Envelope::Stop) | None => {
                if ctx.last_worker_out() {
                    let _ = completions.send(Completion::Stop);
                } else {
                    let _ = reinject.send(Envelope::Stop);
                }
                break;
            }
        }
    }
}

/// Worker loop for an unordered stage.
///
/// Outputs go straight downstream in completion order; the backlog permit
/// for the task is returned once its outputs (or its drop) are accounted.
pub(crate) async fn run_unordered<T>(
    ctx: Arc<WorkerContext<T>>,
    input: SharedReceiver<Envelope<T>>,
    reinject: UnboundedSender<Envelope<T>>,
    outlet: Arc<dyn Outlet<T>>,
    backlog: Option<Arc<Semaphore>>,
) where
    T: Send + Clone + 'static,
{
    loop {
        let message = { input.lock().await.recv().await };
        match message {
            Some(Envelope::Task(task)) => {
                if let Some(tasks) = ctx.apply_with_retry(task).await {
                    for out in tasks {
                        outlet.deliver(out).await;
                        ctx.metrics.record_emitted();
                    }
                }
                ctx.metrics.record_completed();
                if let Some(sem) = &backlog {
                    sem.add_permits(1);
                }
            }
            Some(Envelope::Stop) | None => {
                if ctx.last_worker_out() {
                    outlet.finish();
                } else {
                    let _ = reinject.send(Envelope::Stop);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransformError;
    use crate::faults::CollectingFaultSink;
    use crate::transform::FnTransform;

    fn context(
        faults: Arc<CollectingFaultSink>,
        retry: RetryPolicy,
        fail_on: impl Fn(u32) -> bool + Send + Sync + 'static,
    ) -> WorkerContext<u32> {
        WorkerContext {
            stage: "test".to_string(),
            transform: Arc::new(FnTransform::new(move |x: u32| {
                if fail_on(x) {
                    Err(TransformError::new("rejected"))
                } else {
                    Ok(vec![x])
                }
            })),
            retry,
            faults,
            metrics: Arc::new(StageMetrics::new()),
            countdown: Arc::new(AtomicUsize::new(1)),
        }
    }

    #[tokio::test]
    async fn test_apply_ok() {
        let faults = Arc::new(CollectingFaultSink::new());
        let ctx = context(faults.clone(), RetryPolicy::default(), |_| false);

        assert_eq!(ctx.apply_with_retry(5).await, Some(vec![5]));
        assert!(faults.is_empty());
    }

    #[tokio::test]
    async fn test_apply_drops_after_exhausted_retries() {
        let faults = Arc::new(CollectingFaultSink::new());
        let retry = RetryPolicy::new().with_max_attempts(2).with_base_delay_ms(0);
        let ctx = context(faults.clone(), retry, |_| true);

        assert_eq!(ctx.apply_with_retry(5).await, None);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults.faults()[0].attempts, 2);
        assert_eq!(ctx.metrics.dropped(), 1);
    }

    #[tokio::test]
    async fn test_apply_does_not_retry_fatal_errors() {
        let faults = Arc::new(CollectingFaultSink::new());
        let retry = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(0);
        let ctx = WorkerContext::<u32> {
            stage: "test".to_string(),
            transform: Arc::new(FnTransform::new(|_: u32| {
                Err(TransformError::fatal("bad input"))
            })),
            retry,
            faults: faults.clone(),
            metrics: Arc::new(StageMetrics::new()),
            countdown: Arc::new(AtomicUsize::new(1)),
        };

        assert_eq!(ctx.apply_with_retry(5).await, None);
        assert_eq!(faults.faults()[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_apply_recovers_on_retry() {
        let faults = Arc::new(CollectingFaultSink::new());
        let failures = Arc::new(AtomicUsize::new(1));
        let failures_clone = failures.clone();
        let retry = RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(0);
        let ctx = WorkerContext::<u32> {
            stage: "test".to_string(),
            transform: Arc::new(FnTransform::new(move |x: u32| {
                if failures_clone
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(TransformError::new("transient"))
                } else {
                    Ok(vec![x])
                }
            })),
            retry,
            faults: faults.clone(),
            metrics: Arc::new(StageMetrics::new()),
            countdown: Arc::new(AtomicUsize::new(1)),
        };

        assert_eq!(ctx.apply_with_retry(7).await, Some(vec![7]));
        assert!(faults.is_empty());
        assert_eq!(ctx.metrics.dropped(), 0);
    }
}
