//! Stage lifecycle, admission, and delivery seams.
//!
//! A stage owns a pool of workers sharing one input channel. Tasks enter
//! through an [`Injector`] (admission: closed check, sequence assignment or
//! backlog wait) and leave through an [`Outlet`] (the next stage's injector,
//! or the pipeline's terminal channel).

mod ordered;
mod unordered;

pub use ordered::OrderedStage;
pub use unordered::UnorderedStage;

use crate::envelope::{Envelope, Sequenced};
use crate::errors::ClosedStageError;
use crate::faults::FaultSink;
use crate::metrics::StageMetrics;
use crate::retry::RetryPolicy;
use crate::transform::Transform;
use crate::worker::WorkerContext;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Configuration for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, used in errors, log events and fault reports.
    pub name: String,
    /// Number of concurrent workers in the pool.
    pub workers: usize,
    /// Maximum admitted-but-not-emitted tasks before `put` waits.
    ///
    /// Only unordered stages honor this; `None` or zero means unbounded
    /// admission.
    pub backlog_limit: Option<usize>,
    /// Retry policy applied to failed transforms.
    pub retry: RetryPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: "stage".to_string(),
            workers: 1,
            backlog_limit: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl StageConfig {
    /// Creates a config with the given stage name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the backlog limit.
    #[must_use]
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = Some(limit);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// Constructed, workers not yet spawned.
    Created,
    /// Workers active, accepting tasks.
    Running,
    /// Stop marker injected, workers finishing in-flight tasks.
    Draining,
    /// Stop forwarded downstream, workers joined.
    Terminated,
}

/// Trait for pipeline stages.
///
/// A stage is agnostic of its position: the builder wires each stage's
/// outlet to the next stage's injector at build time.
#[async_trait]
pub trait Stage<T: Send + Clone + 'static>: Send + Sync {
    /// Returns the stage name.
    fn name(&self) -> &str;

    /// Returns the current lifecycle state.
    fn state(&self) -> StageState;

    /// Returns the stage's flow counters.
    fn metrics(&self) -> Arc<StageMetrics>;

    /// Returns a clonable admission handle for this stage.
    fn injector(&self) -> Injector<T>;

    /// Spawns the worker pool, delivering outputs through `outlet`.
    fn start(&mut self, outlet: Arc<dyn Outlet<T>>);

    /// Offers a task to the stage.
    ///
    /// Waits while an unordered stage's backlog is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`ClosedStageError`] after shutdown.
    async fn put(&self, task: T) -> Result<(), ClosedStageError> {
        self.injector().put(task).await
    }

    /// Injects the stop marker and waits for the stage to terminate.
    ///
    /// Idempotent: later calls return without injecting again.
    async fn shutdown(&self);

    /// Waits for termination driven by an upstream stop marker, without
    /// injecting one.
    async fn join(&self);
}

/// Clonable admission handle for one stage.
///
/// All `put` paths go through the injector: the closed check, sequence
/// assignment (ordered stages) and the backlog wait (unordered stages)
/// happen here, for direct callers and upstream stages alike.
pub struct Injector<T> {
    inner: Arc<InjectorInner<T>>,
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct InjectorInner<T> {
    stage: String,
    closed: AtomicBool,
    state: Arc<RwLock<StageState>>,
    metrics: Arc<StageMetrics>,
    kind: InjectorKind<T>,
}

enum InjectorKind<T> {
    Ordered {
        next_seq: AtomicU64,
        tx: UnboundedSender<Envelope<Sequenced<T>>>,
    },
    Unordered {
        backlog: Option<Arc<Semaphore>>,
        tx: UnboundedSender<Envelope<T>>,
    },
}

impl<T> Injector<T>
where
    T: Send + 'static,
{
    pub(crate) fn ordered(
        stage: String,
        state: Arc<RwLock<StageState>>,
        metrics: Arc<StageMetrics>,
        tx: UnboundedSender<Envelope<Sequenced<T>>>,
    ) -> Self {
        Self {
            inner: Arc::new(InjectorInner {
                stage,
                closed: AtomicBool::new(false),
                state,
                metrics,
                kind: InjectorKind::Ordered {
                    next_seq: AtomicU64::new(0),
                    tx,
                },
            }),
        }
    }

    pub(crate) fn unordered(
        stage: String,
        state: Arc<RwLock<StageState>>,
        metrics: Arc<StageMetrics>,
        backlog: Option<Arc<Semaphore>>,
        tx: UnboundedSender<Envelope<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(InjectorInner {
                stage,
                closed: AtomicBool::new(false),
                state,
                metrics,
                kind: InjectorKind::Unordered { backlog, tx },
            }),
        }
    }

    /// Admits a task to the stage.
    ///
    /// # Errors
    ///
    /// Returns [`ClosedStageError`] after shutdown, including when the
    /// shutdown happened while this call was waiting on the backlog.
    pub async fn put(&self, task: T) -> Result<(), ClosedStageError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ClosedStageError::new(&inner.stage));
        }
        match &inner.kind {
            InjectorKind::Ordered { next_seq, tx } => {
                let seq = next_seq.fetch_add(1, Ordering::SeqCst);
                tx.send(Envelope::Task(Sequenced::new(seq, task)))
                    .map_err(|_| ClosedStageError::new(&inner.stage))?;
            }
            InjectorKind::Unordered { backlog, tx } => {
                if let Some(sem) = backlog {
                    let Ok(permit) = sem.acquire().await else {
                        return Err(ClosedStageError::new(&inner.stage));
                    };
                    permit.forget();
                    // The stage may have closed while we waited; a task
                    // enqueued now would land behind the stop marker and
                    // never be processed.
                    if inner.closed.load(Ordering::SeqCst) {
                        sem.add_permits(1);
                        return Err(ClosedStageError::new(&inner.stage));
                    }
                }
                tx.send(Envelope::Task(task))
                    .map_err(|_| ClosedStageError::new(&inner.stage))?;
            }
        }
        inner.metrics.record_admitted();
        Ok(())
    }

    /// Returns true if the stage no longer accepts tasks.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Injects the stop marker, exactly once.
    ///
    /// Returns false if the stage was already closed.
    pub(crate) fn inject_stop(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.inner.state.write() = StageState::Draining;
        match &self.inner.kind {
            InjectorKind::Ordered { tx, .. } => {
                let _ = tx.send(Envelope::Stop);
            }
            InjectorKind::Unordered { tx, .. } => {
                let _ = tx.send(Envelope::Stop);
            }
        }
        true
    }
}

/// Trait for the delivery side of a stage.
///
/// Implemented by [`StageOutlet`] (feeding the next stage's injector) and
/// by the pipeline's terminal channel.
#[async_trait]
pub trait Outlet<T>: Send + Sync {
    /// Delivers one output task downstream.
    ///
    /// May wait on the downstream backlog; this is how backpressure
    /// propagates upstream through the pipeline.
    async fn deliver(&self, task: T);

    /// Forwards the stop marker downstream.
    fn finish(&self);
}

/// An outlet that feeds the next stage's admission handle.
pub struct StageOutlet<T> {
    injector: Injector<T>,
}

impl<T> StageOutlet<T> {
    /// Creates an outlet wired to the given injector.
    #[must_use]
    pub fn new(injector: Injector<T>) -> Self {
        Self { injector }
    }
}

#[async_trait]
impl<T> Outlet<T> for StageOutlet<T>
where
    T: Send + 'static,
{
    async fn deliver(&self, task: T) {
        if let Err(error) = self.injector.put(task).await {
            tracing::warn!(error = %error, "output dropped at closed downstream stage");
        }
    }

    fn finish(&self) {
        self.injector.inject_stop();
    }
}

/// State and resources shared by both stage flavors.
pub(crate) struct StageCore<T> {
    pub(crate) config: StageConfig,
    pub(crate) transform: Arc<dyn Transform<T>>,
    pub(crate) faults: Arc<dyn FaultSink>,
    pub(crate) metrics: Arc<StageMetrics>,
    pub(crate) state: Arc<RwLock<StageState>>,
    pub(crate) handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<T> StageCore<T>
where
    T: Send + Clone + 'static,
{
    pub(crate) fn new(
        transform: Arc<dyn Transform<T>>,
        config: StageConfig,
        faults: Arc<dyn FaultSink>,
    ) -> Self {
        Self {
            config,
            transform,
            faults,
            metrics: Arc::new(StageMetrics::new()),
            state: Arc::new(RwLock::new(StageState::Created)),
            handles: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Marks the stage Running. False if start was already called.
    pub(crate) fn begin(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.state.write() = StageState::Running;
        true
    }

    pub(crate) fn worker_context(&self, countdown: Arc<AtomicUsize>) -> Arc<WorkerContext<T>> {
        Arc::new(WorkerContext {
            stage: self.config.name.clone(),
            transform: Arc::clone(&self.transform),
            retry: self.config.retry.clone(),
            faults: Arc::clone(&self.faults),
            metrics: Arc::clone(&self.metrics),
            countdown,
        })
    }

    /// Joins all worker tasks and marks the stage Terminated.
    pub(crate) async fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(join_error) = handle.await {
                tracing::warn!(
                    stage = %self.config.name,
                    error = %join_error,
                    "worker task join error"
                );
            }
        }
        *self.state.write() = StageState::Terminated;
        tracing::debug!(stage = %self.config.name, "stage terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn ordered_injector(
        tx: UnboundedSender<Envelope<Sequenced<u32>>>,
    ) -> Injector<u32> {
        Injector::ordered(
            "test".to_string(),
            Arc::new(RwLock::new(StageState::Running)),
            Arc::new(StageMetrics::new()),
            tx,
        )
    }

    #[test]
    fn test_stage_config_builders() {
        let config = StageConfig::new("resize")
            .with_workers(4)
            .with_backlog_limit(8);

        assert_eq!(config.name, "resize");
        assert_eq!(config.workers, 4);
        assert_eq!(config.backlog_limit, Some(8));
    }

    #[test]
    fn test_stage_config_clamps_workers() {
        let config = StageConfig::default().with_workers(0);
        assert_eq!(config.workers, 1);
    }

    #[tokio::test]
    async fn test_injector_assigns_gapless_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let injector = ordered_injector(tx);

        for value in 0..5u32 {
            injector.put(value).await.unwrap();
        }

        for expected in 0..5u64 {
            match rx.recv().await.unwrap() {
                Envelope::Task(sequenced) => assert_eq!(sequenced.seq, expected),
                Envelope::Stop => panic!("unexpected stop"),
            }
        }
    }

    #[tokio::test]
    async fn test_injector_sequence_unique_under_concurrency() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let injector = ordered_injector(tx);

        let mut puts = Vec::new();
        for _ in 0..4 {
            let handle = injector.clone();
            puts.push(tokio::spawn(async move {
                for value in 0..25u32 {
                    handle.put(value).await.unwrap();
                }
            }));
        }
        for put in puts {
            put.await.unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..100 {
            match rx.recv().await.unwrap() {
                Envelope::Task(sequenced) => {
                    assert!(seen.insert(sequenced.seq), "duplicate seq {}", sequenced.seq);
                }
                Envelope::Stop => panic!("unexpected stop"),
            }
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.contains(&0));
        assert!(seen.contains(&99));
    }

    #[tokio::test]
    async fn test_injector_rejects_after_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let injector = ordered_injector(tx);

        assert!(injector.inject_stop());
        assert!(!injector.inject_stop());
        assert!(injector.is_closed());

        let err = injector.put(1).await.unwrap_err();
        assert!(err.to_string().contains("shut down"));

        // Exactly one stop marker was enqueued.
        assert!(rx.recv().await.unwrap().is_stop());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_marks_draining() {
        let (tx, _rx) = mpsc::unbounded_channel::<Envelope<Sequenced<u32>>>();
        let state = Arc::new(RwLock::new(StageState::Running));
        let injector = Injector::ordered(
            "test".to_string(),
            Arc::clone(&state),
            Arc::new(StageMetrics::new()),
            tx,
        );

        injector.inject_stop();
        assert_eq!(*state.read(), StageState::Draining);
    }
}
