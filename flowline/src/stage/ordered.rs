//! Ordered stage: workers complete out of order, results leave in input
//! order.

use super::{Injector, Outlet, Stage, StageConfig, StageCore, StageState};
use crate::envelope::{Envelope, Sequenced};
use crate::errors::{SequenceIntegrityError, SequenceViolation};
use crate::faults::{FaultSink, LoggingFaultSink};
use crate::metrics::StageMetrics;
use crate::transform::Transform;
use crate::worker::{self, Completion};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Restores admission order over out-of-order completions.
///
/// Holds completed batches whose predecessors have not been emitted yet,
/// keyed by sequence number. The batch for the next expected number is
/// never buffered; it is released immediately together with any
/// consecutively-ready successors.
pub(crate) struct Reassembler<T> {
    stage: String,
    next_expected: u64,
    pending: HashMap<u64, Vec<T>>,
}

impl<T> Reassembler<T> {
    pub(crate) fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            next_expected: 0,
            pending: HashMap::new(),
        }
    }

    /// Accepts the completed batch for one sequence number.
    ///
    /// Returns the batches that became ready for emission, in order.
    pub(crate) fn accept(
        &mut self,
        seq: u64,
        batch: Vec<T>,
    ) -> Result<Vec<Vec<T>>, SequenceIntegrityError> {
        if seq < self.next_expected || self.pending.contains_key(&seq) {
            return Err(self.violation(SequenceViolation::Duplicate, seq));
        }
        if seq != self.next_expected {
            self.pending.insert(seq, batch);
            return Ok(Vec::new());
        }

        let mut ready = vec![batch];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        Ok(ready)
    }

    /// Verifies nothing is left waiting once input has ended.
    pub(crate) fn finish(&self) -> Result<(), SequenceIntegrityError> {
        match self.pending.keys().min() {
            None => Ok(()),
            Some(&stranded) => Err(self.violation(SequenceViolation::Missing, stranded)),
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn violation(&self, kind: SequenceViolation, found: u64) -> SequenceIntegrityError {
        SequenceIntegrityError {
            stage: self.stage.clone(),
            kind,
            expected: self.next_expected,
            found,
        }
    }
}

/// Consumes worker completions, emits payloads in admission order.
async fn run_reassembly<T>(
    stage: String,
    mut completions: UnboundedReceiver<Completion<T>>,
    outlet: Arc<dyn Outlet<T>>,
    metrics: Arc<StageMetrics>,
) where
    T: Send + 'static,
{
    let mut reassembler = Reassembler::new(stage.clone());
    while let Some(message) = completions.recv().await {
        match message {
            Completion::Batch { seq, tasks } => match reassembler.accept(seq, tasks) {
                Ok(ready) => {
                    for batch in ready {
                        for task in batch {
                            outlet.deliver(task).await;
                            metrics.record_emitted();
                        }
                        metrics.record_completed();
                    }
                }
                Err(error) => {
                    tracing::error!(
                        stage = %stage,
                        error = %error,
                        "sequence integrity violated, halting ordered stage"
                    );
                    outlet.finish();
                    return;
                }
            },
            Completion::Stop => {
                if let Err(error) = reassembler.finish() {
                    tracing::error!(
                        stage = %stage,
                        error = %error,
                        stranded = reassembler.pending_len(),
                        "input ended with buffered completions stranded"
                    );
                }
                outlet.finish();
                return;
            }
        }
    }
    // All workers gone without a stop marker (the stage was dropped
    // mid-flight); still close the downstream side.
    outlet.finish();
}

/// A stage whose output order matches its input order.
///
/// Every admitted task gets the next sequence number; workers process out
/// of order and a reassembly task re-sequences completed batches before
/// they leave the stage. One stalled task buffers all later completions
/// without bound; choose an [`UnorderedStage`](super::UnorderedStage) with
/// a backlog limit when that risk is unacceptable.
pub struct OrderedStage<T> {
    core: StageCore<T>,
    injector: Injector<T>,
    input_tx: UnboundedSender<Envelope<Sequenced<T>>>,
    input_rx: parking_lot::Mutex<Option<UnboundedReceiver<Envelope<Sequenced<T>>>>>,
}

impl<T> OrderedStage<T>
where
    T: Send + Clone + 'static,
{
    /// Creates an ordered stage with the default (logging) fault sink.
    #[must_use]
    pub fn new(transform: impl Transform<T> + 'static, config: StageConfig) -> Self {
        Self::with_fault_sink(transform, config, Arc::new(LoggingFaultSink))
    }

    /// Creates an ordered stage reporting faults to the given sink.
    #[must_use]
    pub fn with_fault_sink(
        transform: impl Transform<T> + 'static,
        config: StageConfig,
        faults: Arc<dyn FaultSink>,
    ) -> Self {
        if config.backlog_limit.is_some() {
            tracing::debug!(
                stage = %config.name,
                "backlog limit is ignored by ordered stages"
            );
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let core = StageCore::new(Arc::new(transform), config, faults);
        let injector = Injector::ordered(
            core.config.name.clone(),
            Arc::clone(&core.state),
            Arc::clone(&core.metrics),
            input_tx.clone(),
        );
        Self {
            core,
            injector,
            input_tx,
            input_rx: parking_lot::Mutex::new(Some(input_rx)),
        }
    }
}

#[async_trait]
impl<T> Stage<T> for OrderedStage<T>
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
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(workers + 1);
        for _ in 0..workers {
            handles.push(tokio::spawn(worker::run_ordered(
                self.core.worker_context(Arc::clone(&countdown)),
                Arc::clone(&input),
                self.input_tx.clone(),
                completions_tx.clone(),
            )));
        }
        handles.push(tokio::spawn(run_reassembly(
            self.core.config.name.clone(),
            completions_rx,
            outlet,
            Arc::clone(&self.core.metrics),
        )));

        *self.core.handles.lock() = handles;
        tracing::debug!(stage = %self.core.config.name, workers, "ordered stage started");
    }

    async fn shutdown(&self) {
        self.injector.inject_stop();
        self.core.join().await;
    }

    async fn join(&self) {
        self.core.join().await;
    }
}
