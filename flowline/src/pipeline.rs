//! Pipeline composition and the caller-facing put/get surface.
//!
//! A pipeline is a linear sequence of stages. The builder wires each
//! stage's outlet to the next stage's injector back to front, so every
//! stage stays agnostic of its position; the last stage feeds a terminal
//! channel the caller drains through `get`.

use crate::envelope::Envelope;
use crate::errors::{ClosedPipelineError, PipelineBuildError};
use crate::metrics::StageMetrics;
use crate::stage::{Outlet, Stage, StageConfig, StageOutlet};
use crate::transform::Transform;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::error::Elapsed;
use uuid::Uuid;

/// The outlet of the final stage: feeds the channel `get` drains.
pub(crate) struct TerminalOutlet<T> {
    tx: UnboundedSender<Envelope<T>>,
}

impl<T> TerminalOutlet<T> {
    pub(crate) fn new(tx: UnboundedSender<Envelope<T>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T> Outlet<T> for TerminalOutlet<T>
where
    T: Send + 'static,
{
    async fn deliver(&self, task: T) {
        let _ = self.tx.send(Envelope::Task(task));
    }

    fn finish(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }
}

/// Builder for pipelines.
pub struct PipelineBuilder<T> {
    stages: Vec<Box<dyn Stage<T>>>,
}

impl<T> Default for PipelineBuilder<T>
where
    T: Send + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PipelineBuilder<T>
where
    T: Send + Clone + 'static,
{
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage to the pipeline.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage<T> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Appends an ordered stage built from a transform and config.
    #[must_use]
    pub fn ordered(self, transform: impl Transform<T> + 'static, config: StageConfig) -> Self {
        self.stage(crate::stage::OrderedStage::new(transform, config))
    }

    /// Appends an unordered stage built from a transform and config.
    #[must_use]
    pub fn unordered(self, transform: impl Transform<T> + 'static, config: StageConfig) -> Self {
        self.stage(crate::stage::UnorderedStage::new(transform, config))
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Wires the stages together and starts their worker pools.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages.
    pub fn build(mut self) -> Result<Pipeline<T>, PipelineBuildError> {
        if self.stages.is_empty() {
            return Err(PipelineBuildError::new("pipeline has no stages"));
        }

        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let mut outlet: Arc<dyn Outlet<T>> = Arc::new(TerminalOutlet::new(terminal_tx));
        for stage in self.stages.iter_mut().rev() {
            stage.start(Arc::clone(&outlet));
            outlet = Arc::new(StageOutlet::new(stage.injector()));
        }

        let id = Uuid::new_v4();
        tracing::debug!(
            pipeline_id = %id,
            stages = self.stages.len(),
            "pipeline started"
        );
        Ok(Pipeline {
            id,
            stages: self.stages,
            output: terminal_rx,
            closed: AtomicBool::new(false),
            finished: false,
        })
    }
}

/// A running pipeline of stages.
///
/// Tasks enter with [`put`](Self::put), results come back with
/// [`get`](Self::get). Wiring is fixed at build time; pipelines must be
/// acyclic (a backlog limit inside a cycle can deadlock).
pub struct Pipeline<T> {
    id: Uuid,
    stages: Vec<Box<dyn Stage<T>>>,
    output: UnboundedReceiver<Envelope<T>>,
    closed: AtomicBool,
    finished: bool,
}

impl<T> Pipeline<T>
where
    T: Send + Clone + 'static,
{
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder<T> {
        PipelineBuilder::new()
    }

    /// Returns the pipeline's run identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Offers a task to the first stage.
    ///
    /// Waits while the first stage's backlog is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`ClosedPipelineError`] after shutdown.
    pub async fn put(&self, task: T) -> Result<(), ClosedPipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClosedPipelineError);
        }
        match self.stages.first() {
            Some(stage) => stage.put(task).await.map_err(ClosedPipelineError::from),
            None => Err(ClosedPipelineError),
        }
    }

    /// Returns the next result, or `None` once the stream has ended.
    ///
    /// Waits while the pipeline is running but has nothing ready. After
    /// end of stream every call returns `None` immediately.
    pub async fn get(&mut self) -> Option<T> {
        if self.finished {
            return None;
        }
        match self.output.recv().await {
            Some(Envelope::Task(task)) => Some(task),
            Some(Envelope::Stop) | None => {
                self.finished = true;
                None
            }
        }
    }

    /// Like [`get`](Self::get), but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Elapsed`] if no result and no end of stream arrived in
    /// time.
    pub async fn get_timeout(&mut self, timeout: Duration) -> Result<Option<T>, Elapsed> {
        if self.finished {
            return Ok(None);
        }
        match tokio::time::timeout(timeout, self.output.recv()).await? {
            Some(Envelope::Task(task)) => Ok(Some(task)),
            Some(Envelope::Stop) | None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Returns a stream over the remaining results, ending at end of
    /// stream.
    pub fn results(&mut self) -> impl futures::Stream<Item = T> + '_ {
        futures::stream::unfold(self, |pipeline| async move {
            pipeline.get().await.map(|task| (task, pipeline))
        })
    }

    /// Shuts the pipeline down.
    ///
    /// Injects the stop marker at the first stage; it cascades through the
    /// wiring and every downstream stage drains and terminates. Results
    /// already produced stay available through [`get`](Self::get).
    /// Idempotent: a second call returns immediately.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pipeline_id = %self.id, "pipeline shutting down");
        if let Some(first) = self.stages.first() {
            first.shutdown().await;
        }
        for stage in self.stages.iter().skip(1) {
            stage.join().await;
        }
        tracing::debug!(pipeline_id = %self.id, "pipeline terminated");
    }

    /// Returns each stage's metrics, in pipeline order.
    #[must_use]
    pub fn stage_metrics(&self) -> Vec<(String, Arc<StageMetrics>)> {
        self.stages
            .iter()
            .map(|stage| (stage.name().to_string(), stage.metrics()))
            .collect()
    }

    /// Converts all stage counters to a JSON snapshot.
    #[must_use]
    pub fn metrics_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "pipeline_id": self.id.to_string(),
            "stages": self
                .stages
                .iter()
                .map(|stage| {
                    serde_json::json!({
                        "name": stage.name(),
                        "metrics": stage.metrics().snapshot(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}
