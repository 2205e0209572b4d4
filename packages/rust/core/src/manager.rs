//! Stateful Queue Manager.
//!
//! Runs every queue concurrently as a sequence of slices. A slice reads one
//! bounded batch from the change feed, runs it through the queue's processor
//! and reports back. The manager restarts queues that finished behind the
//! store's head, detects global stability and owns shutdown.
//!
//! A queue is restarted when its slice was cut short by the batch size or
//! when it stopped below the current store sequence. The second condition
//! lets slow queues pick up work that faster queues wrote while they ran,
//! at the cost of occasional rework.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use schemaflow_shared::{FeedOptions, PipelineConfig, PipelineError, QueueState, Result};
use schemaflow_storage::FeedConnector;

use crate::changes::ChangesReader;
use crate::model::DocModel;
use crate::processor::QueueProcessor;
use crate::queue::QueueRunner;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Running,
    Failed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One queue as seen by the status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueView {
    pub name: String,
    pub status: QueueStatus,
    pub seq: u64,
    /// Store sequence minus queue sequence.
    pub lag: u64,
    /// The last slice ran out of input.
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub global_seq: u64,
    pub queues: Vec<QueueView>,
}

impl PipelineStatus {
    /// The live queue furthest behind.
    pub fn slowest(&self) -> Option<&QueueView> {
        self.queues
            .iter()
            .filter(|q| q.status != QueueStatus::Failed)
            .min_by_key(|q| q.seq)
    }

    pub fn is_stable(&self) -> bool {
        is_stable(&self.queues, self.global_seq)
    }
}

/// Every live queue is idle, out of input and at the same sequence, and
/// that sequence has caught up with the store.
pub fn is_stable(queues: &[QueueView], global_seq: u64) -> bool {
    let mut live = queues.iter().filter(|q| q.status != QueueStatus::Failed);
    let Some(first) = live.next() else {
        return true;
    };
    let settled =
        |q: &QueueView| q.status == QueueStatus::Idle && q.exhausted && q.seq == first.seq;
    settled(first) && live.all(settled) && first.seq >= global_seq
}

/// What to do once the pipeline is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StablePolicy {
    /// Keep running, parked on the feed until new input arrives.
    Continue,
    /// Shut down gracefully.
    Stop,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Items written by all queues.
    pub created: usize,
    /// The run reached stability at least once.
    pub stable: bool,
    pub queues: Vec<QueueView>,
    /// `(queue, error)` for every queue that failed.
    pub failures: Vec<(String, String)>,
}

/// Progress callback for long-running pipeline runs.
pub trait ProgressReporter: Send + Sync {
    /// Called on every status interval and on stability.
    fn status(&self, status: &PipelineStatus);
    /// Called when a queue fails.
    fn queue_failed(&self, queue: &str, error: &PipelineError);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn status(&self, _status: &PipelineStatus) {}
    fn queue_failed(&self, _queue: &str, _error: &PipelineError) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Slices
// ---------------------------------------------------------------------------

struct Slot {
    processor: Arc<dyn QueueProcessor>,
    state: QueueState,
    status: QueueStatus,
    exhausted: bool,
    created: usize,
    error: Option<String>,
    /// The checkpoint still records a failure from an earlier run.
    stale_failure: bool,
}

impl Slot {
    fn view(&self, global_seq: u64) -> QueueView {
        QueueView {
            name: self.processor.id().to_string(),
            status: self.status,
            seq: self.state.seq,
            lag: global_seq.saturating_sub(self.state.seq),
            exhausted: self.exhausted,
        }
    }

    fn live(&self) -> bool {
        self.status != QueueStatus::Failed
    }
}

/// Everything a slice task needs, cloned per spawn.
#[derive(Clone)]
struct SliceEnv {
    model: Arc<DocModel>,
    connector: Arc<dyn FeedConnector>,
    feed: FeedOptions,
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
}

struct SliceOutput {
    index: usize,
    state: QueueState,
    result: Result<(usize, bool)>,
}

async fn run_slice(
    env: SliceEnv,
    processor: Arc<dyn QueueProcessor>,
    mut state: QueueState,
    index: usize,
    wait: bool,
) -> SliceOutput {
    let result = async {
        let mut reader = ChangesReader::new(
            env.connector.clone(),
            env.model.store().clone(),
            env.feed.clone(),
            env.cancel.clone(),
        );
        reader.initialize(state.seq, processor.uses_dependencies()).await?;
        let events = reader.make_iter(env.config.batch_size, wait).await?;

        let runner =
            QueueRunner::new(processor.as_ref(), &env.model, &env.config).with_cancel(&env.cancel);
        let created = runner.process_queue(events, &mut state).await?;

        // The sentinel can carry the position past the last event.
        if reader.exhausted() {
            state.seq = state.seq.max(reader.current_seq());
        }
        Ok((created, reader.exhausted()))
    }
    .await;

    SliceOutput {
        index,
        state,
        result,
    }
}

enum Wake {
    Cancelled,
    Joined(std::result::Result<(Id, SliceOutput), JoinError>),
    Tick,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct StatefulQueueManager {
    env: SliceEnv,
    slots: Vec<Slot>,
    tasks: JoinSet<SliceOutput>,
    task_index: HashMap<Id, usize>,
    last_slowest: Option<(String, u64)>,
}

impl StatefulQueueManager {
    pub fn new(
        model: Arc<DocModel>,
        connector: Arc<dyn FeedConnector>,
        feed: FeedOptions,
        config: PipelineConfig,
        cancel: CancellationToken,
        processors: Vec<Arc<dyn QueueProcessor>>,
    ) -> Self {
        let slots = processors
            .into_iter()
            .map(|processor| Slot {
                state: QueueState::new(processor.id()),
                processor,
                status: QueueStatus::Idle,
                exhausted: false,
                created: 0,
                error: None,
                stale_failure: false,
            })
            .collect();
        Self {
            env: SliceEnv {
                model,
                connector,
                feed,
                config: Arc::new(config),
                cancel,
            },
            slots,
            tasks: JoinSet::new(),
            task_index: HashMap::new(),
            last_slowest: None,
        }
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let global_seq = self.env.model.store().current_seq().await?;
        Ok(self.status_at(global_seq))
    }

    fn status_at(&self, global_seq: u64) -> PipelineStatus {
        PipelineStatus {
            global_seq,
            queues: self.slots.iter().map(|s| s.view(global_seq)).collect(),
        }
    }

    fn spawn(&mut self, index: usize, wait: bool) {
        let slot = &mut self.slots[index];
        slot.status = QueueStatus::Running;
        debug!(queue = %slot.processor.id(), seq = slot.state.seq, wait, "starting slice");
        let handle = self.tasks.spawn(run_slice(
            self.env.clone(),
            slot.processor.clone(),
            slot.state.clone(),
            index,
            wait,
        ));
        self.task_index.insert(handle.id(), index);
    }

    /// Idle queues that have work left.
    fn restartable(&self, global_seq: u64) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.status == QueueStatus::Idle && (!s.exhausted || s.state.seq < global_seq)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Run all queues until `on_stable` asks to stop, a stop is requested
    /// through the cancel token, or a queue fails with stop-on-error set.
    #[instrument(skip_all, fields(queues = self.slots.len()))]
    pub async fn run<F>(
        &mut self,
        mut on_stable: F,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunSummary>
    where
        F: FnMut(&PipelineStatus) -> StablePolicy,
    {
        for slot in &mut self.slots {
            slot.state = self.env.model.load_queue_state(slot.processor.id()).await?;
            slot.stale_failure = slot.state.last_error.take().is_some();
            slot.status = QueueStatus::Idle;
            slot.exhausted = false;
            slot.error = None;
        }
        info!(queues = self.slots.len(), "starting queues");

        let period = self.env.config.status_interval.max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + period, period);
        let cancel = self.env.cancel.clone();
        let mut stable = false;
        let mut fatal: Option<PipelineError> = None;

        loop {
            let global_seq = self.env.model.store().current_seq().await?;
            for index in self.restartable(global_seq) {
                self.spawn(index, false);
            }

            if self.tasks.is_empty() {
                if !self.slots.iter().any(Slot::live) {
                    warn!("no live queues left");
                    break;
                }
                let status = self.status_at(global_seq);
                if status.is_stable() {
                    stable = true;
                    info!(seq = global_seq, "pipeline stable");
                    reporter.status(&status);
                    match on_stable(&status) {
                        StablePolicy::Stop => break,
                        StablePolicy::Continue => {
                            let live: Vec<usize> = (0..self.slots.len())
                                .filter(|i| self.slots[*i].live())
                                .collect();
                            for index in live {
                                self.spawn(index, true);
                            }
                        }
                    }
                }
            }

            let wake = tokio::select! {
                () = cancel.cancelled() => Wake::Cancelled,
                Some(joined) = self.tasks.join_next_with_id() => Wake::Joined(joined),
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => {
                    info!("stop requested");
                    break;
                }
                Wake::Joined(joined) => {
                    if let Some(err) = self.absorb(joined, reporter) {
                        fatal = Some(err);
                        break;
                    }
                }
                Wake::Tick => self.report(reporter).await,
            }
        }

        let shutdown = self.shutdown(reporter).await;
        let summary = self.summary(stable).await;
        reporter.done(&summary);

        if let Some(err) = fatal {
            return Err(err);
        }
        shutdown?;
        Ok(summary)
    }

    /// Fold a finished slice back into its slot. Returns an error when the
    /// whole run must stop.
    fn absorb(
        &mut self,
        joined: std::result::Result<(Id, SliceOutput), JoinError>,
        reporter: &dyn ProgressReporter,
    ) -> Option<PipelineError> {
        let output = match joined {
            Ok((id, output)) => {
                self.task_index.remove(&id);
                output
            }
            Err(join_err) => {
                let index = self.task_index.remove(&join_err.id())?;
                let slot = &mut self.slots[index];
                let message = if join_err.is_cancelled() {
                    "did not stop before the shutdown timeout".to_string()
                } else {
                    "slice task panicked".to_string()
                };
                error!(queue = %slot.processor.id(), %message, "queue failed");
                slot.status = QueueStatus::Failed;
                slot.error = Some(message.clone());
                return None;
            }
        };

        let stop_on_error = self.env.config.stop_on_error;
        let slot = &mut self.slots[output.index];
        slot.state = output.state;

        match output.result {
            Ok((created, exhausted)) => {
                slot.status = QueueStatus::Idle;
                slot.exhausted = exhausted;
                slot.created += created;
                None
            }
            Err(PipelineError::Stopped) => {
                slot.status = QueueStatus::Idle;
                slot.exhausted = false;
                None
            }
            Err(err) => {
                error!(queue = %slot.processor.id(), error = %err, "queue failed");
                slot.status = QueueStatus::Failed;
                slot.error = Some(err.to_string());
                reporter.queue_failed(slot.processor.id(), &err);
                if stop_on_error {
                    self.env.cancel.cancel();
                    Some(err)
                } else {
                    None
                }
            }
        }
    }

    async fn report(&mut self, reporter: &dyn ProgressReporter) {
        let status = match self.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "status unavailable");
                return;
            }
        };
        reporter.status(&status);
        if let Some(q) = status.slowest() {
            let key = (q.name.clone(), q.seq);
            if self.last_slowest.as_ref() != Some(&key) {
                info!(queue = %q.name, seq = q.seq, lag = q.lag, "slowest queue");
                self.last_slowest = Some(key);
            }
        }
    }

    /// Stop every slice, fail the ones that do not stop in time and flush
    /// checkpoints of queues that stopped cleanly.
    async fn shutdown(&mut self, reporter: &dyn ProgressReporter) -> Result<()> {
        self.env.cancel.cancel();

        let timeout = self.env.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.tasks.join_next_with_id().await {
                self.absorb(joined, reporter);
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "queues did not stop in time, aborting");
            self.tasks.abort_all();
            while let Some(joined) = self.tasks.join_next_with_id().await {
                self.absorb(joined, reporter);
            }
        }

        let mut first_err: Option<PipelineError> = None;
        for slot in &mut self.slots {
            if slot.status == QueueStatus::Failed {
                // Record the failure at the last saved position; the failed
                // slice's position is not trusted.
                let mut marker = slot.state.clone();
                marker.seq = marker.last_saved_seq;
                marker.last_error = slot.error.clone();
                if let Err(e) = self.env.model.save_queue_state(&mut marker).await {
                    warn!(
                        queue = %slot.processor.id(),
                        error = %e,
                        "could not record queue failure"
                    );
                }
                continue;
            }
            if slot.state.drift() == 0 && !slot.stale_failure {
                continue;
            }
            if let Err(e) = self.env.model.save_queue_state(&mut slot.state).await {
                error!(queue = %slot.processor.id(), error = %e, "final checkpoint failed");
                slot.status = QueueStatus::Failed;
                slot.error = Some(e.to_string());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn summary(&self, stable: bool) -> RunSummary {
        let global_seq = match self.env.model.store().current_seq().await {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "store sequence unavailable");
                0
            }
        };
        RunSummary {
            created: self.slots.iter().map(|s| s.created).sum(),
            stable,
            queues: self.slots.iter().map(|s| s.view(global_seq)).collect(),
            failures: self
                .slots
                .iter()
                .filter_map(|s| s.error.clone().map(|e| (s.processor.id().to_string(), e)))
                .collect(),
        }
    }
}
