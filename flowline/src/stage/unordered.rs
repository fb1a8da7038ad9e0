//! Unordered stage: results leave in completion order, with optional
//! bounded-backlog backpressure.

use super::{Injector, Outlet, Stage, StageConfig, StageCore, StageState};
use crate::envelope::Envelope;
use crate::faults::{FaultSink, LoggingFaultSink};
use crate::metrics::StageMetrics;
use crate::transform::Transform;
use crate::worker;
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

/// A stage whose outputs are emitted as workers finish.
///
/// With a `backlog_limit` of K, at most K tasks are admitted but not yet
/// emitted at any time; further `put` calls wait for a slot, pacing
/// upstream producers to this stage's drain rate. Without a limit,
/// admission never waits.
pub struct UnorderedStage<T> {
    core: StageCore<T>,
    injector: Injector<T>,
    backlog: Option<Arc<Semaphore>>,
    input_tx: UnboundedSender<Envelope<T>>,
    input_rx: parking_lot::Mutex<Option<UnboundedReceiver<Envelope<T>>>>,
}

impl<T> UnorderedStage<T>
where
    T: Send + Clone + 'static,
{
    /// Creates an unordered stage with the default (logging) fault sink.
    #[must_use]
    pub fn new(transform: impl Transform<T> + 'static, config: StageConfig) -> Self {
        Self::with_fault_sink(transform, config, Arc::new(LoggingFaultSink))
    }

    /// Creates an unordered stage reporting faults to the given sink.
    #[must_use]
    pub fn with_fault_sink(
        transform: impl Transform<T> + 'static,
        config: StageConfig,
        faults: Arc<dyn FaultSink>,
    ) -> Self {
        let backlog = config
            .backlog_limit
            .filter(|&limit| limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let core = StageCore::new(Arc::new(transform), config, faults);
        let injector = Injector::unordered(
            core.config.name.clone(),
            Arc::clone(&core.state),
            Arc::clone(&core.metrics),
            backlog.clone(),
            input_tx.clone(),
        );
        Self {
            core,
            injector,
            backlog,
            input_tx,
            input_rx: parking_lot::Mutex::new(Some(input_rx)),
        }
    }
}

#[async_trait]
impl<T> Stage<T> for UnorderedStage<T>
where
    T: Send + Clone + 'static,
{
    fn name(&self) -> &str {
        &self.core.config.name
    }

    fn state(&self) -> StageState {
        *self.core.state.read()
    }

    fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.core.metrics)
    }

    fn injector(&self) -> Injector<T> {
        self.injector.clone()
    }

    fn start(&mut self, outlet: Arc<dyn Outlet<T>>) {
        if !self.core.begin() {
            tracing::warn!(stage = %self.core.config.name, "stage already started");
            return;
        }
        let Some(input_rx) = self.input_rx.lock().take() else {
            return;
        };

        let workers = self.core.config.workers.max(1);
        let input = Arc::new(tokio::sync::Mutex::new(input_rx));
        let countdown = Arc::new(AtomicUsize::new(workers));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(tokio::spawn(worker::run_unordered(
                self.core.worker_context(Arc::clone(&countdown)),
                Arc::clone(&input),
                self.input_tx.clone(),
                Arc::clone(&outlet),
                self.backlog.clone(),
            )));
        }

        *self.core.handles.lock() = handles;
        tracing::debug!(stage = %self.core.config.name, workers, "unordered stage started");
    }

    async fn shutdown(&self) {
        self.injector.inject_stop();
        self.core.join().await;
    }

    async fn join(&self) {
        self.core.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClosedStageError;
    use crate::transform::MapTransform;

    #[tokio::test]
    async fn test_put_after_shutdown_fails() {
        let stage = UnorderedStage::new(
            MapTransform::new(|x: u32| x),
            StageConfig::new("sink"),
        );

        stage.shutdown().await;

        let error: ClosedStageError = stage.put(1).await.unwrap_err();
        assert_eq!(error.stage, "sink");
    }

    #[tokio::test]
    async fn test_zero_backlog_limit_means_unbounded() {
        let stage = UnorderedStage::new(
            MapTransform::new(|x: u32| x),
            StageConfig::new("sink").with_backlog_limit(0),
        );

        assert!(stage.backlog.is_none());
    }
}
