//! The pipeline facade: extensions plus registered processors over one store.
//!
//! Besides the long-running [`Pipeline::run`] it offers the operator sweeps:
//! retrying error records, forcing every source back through its extensions
//! and removing everything the pipeline derived.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use schemaflow_shared::{
    ERROR_SCHEMA, ExtensionCategory, FeedOptions, ItemRef, PipelineConfig, PipelineError, Result,
    SchemaItem, SourceRef,
};
use schemaflow_storage::{DocStore, FeedConnector, PollingFeedConnector, ViewQuery, ViewRow};

use crate::conductor::OUTGOING_SENT_SCHEMA;
use crate::manager::{
    PipelineStatus, ProgressReporter, QueueStatus, QueueView, RunSummary, StablePolicy,
    StatefulQueueManager,
};
use crate::model::DocModel;
use crate::processor::{ExtensionProcessor, QueueProcessor};
use crate::queue::QueueRunner;
use crate::registry::ExtensionRegistry;

/// Outcome of [`Pipeline::retry_errors`].
///
/// Counts cover error records and failed outgoing deliveries alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Failures whose source was offered again.
    pub retried: usize,
    /// Failures gone after the sweep.
    pub cleared: usize,
    /// Failures still present.
    pub remaining: usize,
}

/// Outcome of [`Pipeline::unprocess`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnprocessReport {
    pub removed: usize,
    pub checkpoints: usize,
}

pub struct Pipeline {
    model: Arc<DocModel>,
    registry: Arc<ExtensionRegistry>,
    config: PipelineConfig,
    feed: FeedOptions,
    connector: Arc<dyn FeedConnector>,
    extra: Vec<Arc<dyn QueueProcessor>>,
    cancel: CancellationToken,
    /// Queues of the run in progress, if any.
    running: Mutex<BTreeSet<String>>,
}

impl Pipeline {
    /// A pipeline reading the store's own change log.
    pub fn new(
        store: Arc<dyn DocStore>,
        registry: ExtensionRegistry,
        config: PipelineConfig,
        feed: FeedOptions,
    ) -> Self {
        let connector = Arc::new(PollingFeedConnector::new(store.clone(), feed.clone()));
        Self::with_connector(store, registry, config, feed, connector)
    }

    pub fn with_connector(
        store: Arc<dyn DocStore>,
        registry: ExtensionRegistry,
        config: PipelineConfig,
        feed: FeedOptions,
        connector: Arc<dyn FeedConnector>,
    ) -> Self {
        Self {
            model: Arc::new(DocModel::new(store, config.view_refresh_every)),
            registry: Arc::new(registry),
            config,
            feed,
            connector,
            extra: Vec::new(),
            cancel: CancellationToken::new(),
            running: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn model(&self) -> &Arc<DocModel> {
        &self.model
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cancelling this token stops a running pipeline gracefully.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a queue that is not a loaded extension.
    pub fn add_processor(&mut self, processor: Arc<dyn QueueProcessor>) -> Result<()> {
        let id = processor.id();
        if self.registry.get(id).is_some() || self.extra.iter().any(|p| p.id() == id) {
            return Err(PipelineError::config(format!("queue {id} is already registered")));
        }
        info!(queue = %id, "processor registered");
        self.extra.push(processor);
        Ok(())
    }

    /// Write items produced outside the pipeline.
    pub async fn provide_schema_items(&self, items: Vec<SchemaItem>) -> Result<Vec<ItemRef>> {
        self.model.create_schema_items(items).await
    }

    /// Every queue this pipeline runs, honouring the `only` filter.
    pub fn processors(&self) -> Vec<Arc<dyn QueueProcessor>> {
        let only = &self.config.only;
        self.registry
            .iter()
            .map(|ext| {
                Arc::new(ExtensionProcessor::new(ext.clone(), self.config.stop_on_error))
                    as Arc<dyn QueueProcessor>
            })
            .chain(self.extra.iter().cloned())
            .filter(|p| only.is_empty() || only.iter().any(|id| id == p.id()))
            .collect()
    }

    fn processor(&self, id: &str) -> Option<Arc<dyn QueueProcessor>> {
        self.processors().into_iter().find(|p| p.id() == id)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Run every queue. `on_stable` is consulted each time all queues have
    /// caught up.
    pub async fn run<F>(&self, on_stable: F, reporter: &dyn ProgressReporter) -> Result<RunSummary>
    where
        F: FnMut(&PipelineStatus) -> StablePolicy,
    {
        let processors = self.processors();
        self.set_running(processors.iter().map(|p| p.id().to_string()).collect());
        let mut manager = StatefulQueueManager::new(
            self.model.clone(),
            self.connector.clone(),
            self.feed.clone(),
            self.config.clone(),
            self.cancel.child_token(),
            processors,
        );
        let result = manager.run(on_stable, reporter).await;
        self.set_running(BTreeSet::new());
        let summary = result?;
        self.model.store().refresh_views().await?;
        Ok(summary)
    }

    fn set_running(&self, ids: BTreeSet<String>) {
        if let Ok(mut running) = self.running.lock() {
            *running = ids;
        }
    }

    /// Run until the first time every queue is stable.
    pub async fn run_until_stable(&self, reporter: &dyn ProgressReporter) -> Result<RunSummary> {
        self.run(|_| StablePolicy::Stop, reporter).await
    }

    /// Per-queue position and outcome from the persisted checkpoints.
    ///
    /// A queue whose last run failed reports `failed` until a later run
    /// clears it; queues running in this process report `running`.
    pub async fn status(&self) -> Result<PipelineStatus> {
        let global_seq = self.model.store().current_seq().await?;
        let running = self.running.lock().map(|r| r.clone()).unwrap_or_default();
        let mut queues = Vec::new();
        for processor in self.processors() {
            let state = self.model.load_queue_state(processor.id()).await?;
            let status = if state.last_error.is_some() {
                QueueStatus::Failed
            } else if running.contains(processor.id()) {
                QueueStatus::Running
            } else {
                QueueStatus::Idle
            };
            queues.push(QueueView {
                name: processor.id().to_string(),
                status,
                seq: state.seq,
                lag: global_seq.saturating_sub(state.seq),
                exhausted: state.seq >= global_seq,
            });
        }
        Ok(PipelineStatus { global_seq, queues })
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Offer the source of every error record to its extension again, and
    /// every failed outgoing delivery to its sender.
    #[instrument(skip_all)]
    pub async fn retry_errors(&self) -> Result<RetryReport> {
        let failures = self.failed_records().await?;

        let mut report = RetryReport::default();
        let mut by_queue: Vec<(Arc<dyn QueueProcessor>, Vec<SourceRef>)> = Vec::new();

        for row in &failures {
            let Some(src) = &row.source else { continue };
            let Some(processor) = self.processor(&row.ext_id) else {
                warn!(ext_id = %row.ext_id, "failure recorded by an unknown queue");
                continue;
            };
            let Some(current) = self.model.current_source(&src.doc_id, &src.schema_id).await? else {
                continue;
            };
            report.retried += 1;
            match by_queue.iter_mut().find(|(p, _)| p.id() == processor.id()) {
                Some((_, sources)) => sources.push(current),
                None => by_queue.push((processor, vec![current])),
            }
        }

        for (processor, sources) in by_queue {
            QueueRunner::new(processor.as_ref(), &self.model, &self.config)
                .with_cancel(&self.cancel)
                .process_sources(sources, true)
                .await?;
        }

        report.remaining = self.failed_records().await?.len();
        report.cleared = failures.len().saturating_sub(report.remaining);
        info!(
            retried = report.retried,
            cleared = report.cleared,
            remaining = report.remaining,
            "error sweep done"
        );
        Ok(report)
    }

    /// Error records plus delivery records in the error state.
    async fn failed_records(&self) -> Result<Vec<ViewRow>> {
        let mut rows = self
            .model
            .query(&ViewQuery::BySchema {
                schema_id: ERROR_SCHEMA.to_string(),
            })
            .await?;
        let deliveries = self
            .model
            .query(&ViewQuery::BySchema {
                schema_id: OUTGOING_SENT_SCHEMA.to_string(),
            })
            .await?;
        rows.extend(
            deliveries
                .into_iter()
                .filter(|r| r.fields.get("sent_state").and_then(Value::as_str) == Some("error")),
        );
        Ok(rows)
    }

    /// Force every existing source through every queue.
    #[instrument(skip_all)]
    pub async fn reprocess(&self) -> Result<usize> {
        let mut created = 0;
        for processor in self.processors() {
            let mut sources = Vec::new();
            for schema_id in processor.source_schemas() {
                let rows = self
                    .model
                    .query(&ViewQuery::BySchema {
                        schema_id: schema_id.clone(),
                    })
                    .await?;
                let docs: BTreeSet<String> = rows.into_iter().map(|r| r.doc_id).collect();
                for doc_id in docs {
                    if let Some(src) = self.model.current_source(&doc_id, schema_id).await? {
                        sources.push(src);
                    }
                }
            }
            info!(queue = %processor.id(), sources = sources.len(), "reprocessing");
            created += QueueRunner::new(processor.as_ref(), &self.model, &self.config)
                .with_cancel(&self.cancel)
                .process_sources(sources, true)
                .await?;
        }
        Ok(created)
    }

    /// Remove every item the pipeline's queues wrote and reset their
    /// checkpoints so the next run starts from scratch.
    #[instrument(skip_all)]
    pub async fn unprocess(&self) -> Result<UnprocessReport> {
        let mut report = UnprocessReport::default();
        for processor in self.processors() {
            report.removed += self.remove_outputs(processor.id()).await?;
            if self.model.delete_queue_state(processor.id()).await? {
                report.checkpoints += 1;
            }
        }
        info!(removed = report.removed, checkpoints = report.checkpoints, "unprocessed");
        Ok(report)
    }

    async fn remove_outputs(&self, ext_id: &str) -> Result<usize> {
        let mut removed = 0;
        let mut attempt: u32 = 0;
        loop {
            let rows = self
                .model
                .query(&ViewQuery::ByExtension {
                    ext_id: ext_id.to_string(),
                })
                .await?;
            if rows.is_empty() {
                return Ok(removed);
            }
            let total = rows.len();
            let tombstones = rows
                .into_iter()
                .map(|r| SchemaItem::tombstone(r.rd_key, r.schema_id, ext_id, r.doc_rev))
                .collect();

            match self.model.create_schema_items(tombstones).await {
                Ok(_) => return Ok(removed + total),
                Err(PipelineError::Conflict { conflicts }) => {
                    removed += total.saturating_sub(conflicts.len());
                    attempt += 1;
                    if attempt > self.config.max_conflict_retries {
                        return Err(PipelineError::ConflictRetriesExhausted {
                            attempts: attempt,
                            conflicts,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Categories of loaded extensions, for display.
    pub fn describe(&self) -> Vec<(String, ExtensionCategory, Vec<String>)> {
        self.registry
            .iter()
            .map(|e| (e.id.clone(), e.category, e.source_schemas.clone()))
            .collect()
    }
}
