//! Queue Runner: drives one processor over a batch of change events.
//!
//! Output is buffered and written in groups. A conflicting write re-invokes
//! the call that produced it, against the source's current revision, until
//! it lands or the retry bound runs out.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use schemaflow_shared::{PipelineConfig, PipelineError, QueueState, Result, SchemaItem, SourceRef};

use crate::changes::ChangeEvent;
use crate::model::DocModel;
use crate::processor::{ProcessOutcome, QueueProcessor};

/// Call that produced a group of buffered items, kept so it can be redone.
#[derive(Debug, Clone)]
enum Origin {
    Source(SourceRef),
    Later(Vec<Value>),
}

#[derive(Debug)]
struct Pending {
    origin: Origin,
    items: Vec<SchemaItem>,
}

impl Pending {
    fn conflicts_with(&self, conflict: &schemaflow_shared::Conflict) -> bool {
        self.items
            .iter()
            .any(|i| i.doc_id() == conflict.doc_id && i.schema_id == conflict.schema_id)
    }
}

/// Work accumulated over one batch.
#[derive(Debug, Default)]
struct Batch {
    pending: Vec<Pending>,
    buffered: usize,
    deferred: Vec<Value>,
    created: usize,
}

pub struct QueueRunner<'a> {
    processor: &'a dyn QueueProcessor,
    model: &'a DocModel,
    config: &'a PipelineConfig,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> QueueRunner<'a> {
    pub fn new(
        processor: &'a dyn QueueProcessor,
        model: &'a DocModel,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            processor,
            model,
            config,
            cancel: None,
        }
    }

    /// Stop between events once `cancel` fires.
    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }

    /// Source schemas of `event` this processor consumes.
    fn matching_schemas<'e>(&self, event: &'e ChangeEvent) -> Vec<&'e str> {
        if event.deleted {
            return Vec::new();
        }
        let wanted = self.processor.source_schemas();
        event
            .schemas
            .iter()
            .filter(|s| wanted.contains(s))
            .map(String::as_str)
            .collect()
    }

    /// Process a batch of events, advancing `state` to the highest sequence
    /// handled. Returns the number of items written.
    ///
    /// The checkpoint is saved when anything was written or the unsaved
    /// distance grows past the drift threshold. If a stop is requested the
    /// events already handled are still flushed and checkpointed before
    /// [`PipelineError::Stopped`] is returned.
    #[instrument(skip_all, fields(queue = %self.processor.id(), events = events.len()))]
    pub async fn process_queue(
        &self,
        events: Vec<ChangeEvent>,
        state: &mut QueueState,
    ) -> Result<usize> {
        let mut batch = Batch::default();
        let mut high = state.seq;
        let mut stopped = false;

        for event in &events {
            if self.cancelled() {
                stopped = true;
                break;
            }
            for schema_id in self.matching_schemas(event) {
                let Some(src) = self.model.current_source(&event.doc_id, schema_id).await? else {
                    continue;
                };
                self.offer(src, false, &mut batch).await?;
            }
            if let Some(seq) = event.seq {
                high = high.max(seq);
            }
        }

        let created = self.finish(batch).await?;
        state.seq = high;

        if created > 0 || state.drift() >= self.config.checkpoint_drift {
            self.model.save_queue_state(state).await?;
        }

        if created > 0 {
            info!(created, seq = state.seq, "batch written");
        } else {
            debug!(seq = state.seq, "batch produced nothing");
        }

        if stopped {
            return Err(PipelineError::Stopped);
        }
        Ok(created)
    }

    /// Offer explicit sources, bypassing the change log. Used by sweeps.
    pub async fn process_sources(&self, sources: Vec<SourceRef>, force: bool) -> Result<usize> {
        let mut batch = Batch::default();
        for src in sources {
            if self.cancelled() {
                break;
            }
            self.offer(src, force, &mut batch).await?;
        }
        self.finish(batch).await
    }

    async fn offer(&self, src: SourceRef, force: bool, batch: &mut Batch) -> Result<()> {
        match self.processor.process(self.model, &src, force).await? {
            ProcessOutcome::Unchanged => {}
            ProcessOutcome::Deferred(tokens) => batch.deferred.extend(tokens),
            ProcessOutcome::Items {
                items,
                must_save_now,
            } => {
                batch.buffered += items.len();
                batch.pending.push(Pending {
                    origin: Origin::Source(src),
                    items,
                });
                if must_save_now || batch.buffered > self.config.flush_threshold {
                    self.flush(batch).await?;
                }
            }
        }
        Ok(())
    }

    /// Run the later phase over deferred tokens and write everything left.
    async fn finish(&self, mut batch: Batch) -> Result<usize> {
        if !batch.deferred.is_empty() {
            let tokens = std::mem::take(&mut batch.deferred);
            let items = self.processor.process_later(self.model, tokens.clone()).await?;
            if !items.is_empty() {
                batch.buffered += items.len();
                batch.pending.push(Pending {
                    origin: Origin::Later(tokens),
                    items,
                });
            }
        }
        self.flush(&mut batch).await?;
        Ok(batch.created)
    }

    /// Write buffered items, redoing conflicting calls up to the retry bound.
    async fn flush(&self, batch: &mut Batch) -> Result<()> {
        let mut pending = std::mem::take(&mut batch.pending);
        batch.buffered = 0;
        let mut attempt: u32 = 0;

        while !pending.is_empty() {
            let items: Vec<SchemaItem> = pending
                .iter()
                .flat_map(|p| p.items.iter().cloned())
                .collect();
            let total = items.len();

            match self.model.create_schema_items(items).await {
                Ok(refs) => {
                    batch.created += refs.len();
                    return Ok(());
                }
                Err(PipelineError::Conflict { conflicts }) => {
                    batch.created += total.saturating_sub(conflicts.len());
                    attempt += 1;
                    if attempt > self.config.max_conflict_retries {
                        warn!(
                            attempts = attempt,
                            conflicts = conflicts.len(),
                            "conflict retries exhausted"
                        );
                        return Err(PipelineError::ConflictRetriesExhausted {
                            attempts: attempt,
                            conflicts,
                        });
                    }
                    debug!(attempt, conflicts = conflicts.len(), "redoing conflicting calls");

                    let origins: Vec<Origin> = pending
                        .into_iter()
                        .filter(|p| conflicts.iter().any(|c| p.conflicts_with(c)))
                        .map(|p| p.origin)
                        .collect();
                    pending = self.redo(origins).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Re-invoke calls against current state.
    async fn redo(&self, origins: Vec<Origin>) -> Result<Vec<Pending>> {
        let mut out = Vec::new();
        for origin in origins {
            match origin {
                Origin::Source(src) => {
                    let current = self
                        .model
                        .current_source(&src.doc_id, &src.schema_id)
                        .await?;
                    let Some(current) = current else {
                        continue;
                    };
                    match self.processor.process(self.model, &current, true).await? {
                        ProcessOutcome::Unchanged => {}
                        ProcessOutcome::Items { items, .. } => out.push(Pending {
                            origin: Origin::Source(current),
                            items,
                        }),
                        ProcessOutcome::Deferred(tokens) => {
                            let items = self
                                .processor
                                .process_later(self.model, tokens.clone())
                                .await?;
                            out.push(Pending {
                                origin: Origin::Later(tokens),
                                items,
                            });
                        }
                    }
                }
                Origin::Later(tokens) => {
                    let items = self.processor.process_later(self.model, tokens.clone()).await?;
                    out.push(Pending {
                        origin: Origin::Later(tokens),
                        items,
                    });
                }
            }
        }
        out.retain(|p| !p.items.is_empty());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use schemaflow_shared::{RAW_EXT_ID, RdKey};
    use schemaflow_storage::LibsqlStore;
    use serde_json::Map;
    use uuid::Uuid;

    async fn model() -> DocModel {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        let store = LibsqlStore::open(&tmp).await.expect("open");
        DocModel::new(Arc::new(store), 50)
    }

    fn event(doc_id: &str, seq: u64, schemas: &[&str]) -> ChangeEvent {
        ChangeEvent {
            doc_id: doc_id.to_string(),
            rev: None,
            schemas: schemas.iter().map(|s| s.to_string()).collect(),
            seq: Some(seq),
            deleted: false,
        }
    }

    async fn seed(model: &DocModel, key: &str) -> String {
        let item = SchemaItem::new(RdKey::new("msg", key), "in", RAW_EXT_ID, Map::new());
        let doc_id = item.doc_id();
        model.create_schema_items(vec![item]).await.expect("seed");
        doc_id
    }

    /// Writes `out` under the source key; the first `conflicts` calls also
    /// emit a stale tombstone that is bound to conflict.
    struct Flaky {
        sources: Vec<String>,
        calls: AtomicUsize,
        conflicts: usize,
    }

    #[async_trait]
    impl QueueProcessor for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        fn source_schemas(&self) -> &[String] {
            &self.sources
        }

        async fn process(
            &self,
            _model: &DocModel,
            src: &SourceRef,
            _force: bool,
        ) -> Result<ProcessOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut items = vec![
                SchemaItem::new(RdKey::new("out", src.doc_id.clone()), "out", "flaky", Map::new())
                    .with_source(src.clone()),
            ];
            if n < self.conflicts {
                let mut stale = SchemaItem::new(RdKey::new("other", n), "x", "flaky", Map::new());
                stale.rev = Some("1-stale".into());
                items.push(stale);
            }
            Ok(ProcessOutcome::Items {
                items,
                must_save_now: false,
            })
        }
    }

    fn flaky(conflicts: usize) -> Flaky {
        Flaky {
            sources: vec!["in".into()],
            calls: AtomicUsize::new(0),
            conflicts,
        }
    }

    #[tokio::test]
    async fn filters_events_and_checkpoints() {
        let model = model().await;
        let doc = seed(&model, "m1").await;
        let proc = flaky(0);
        let config = PipelineConfig::default();
        let runner = QueueRunner::new(&proc, &model, &config);

        let mut state = model.load_queue_state("flaky").await.expect("load");
        let events = vec![event(&doc, 1, &["in"]), event(&doc, 2, &["unrelated"])];
        let created = runner.process_queue(events, &mut state).await.expect("run");

        assert_eq!(created, 1);
        assert_eq!(proc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.seq, 2);
        assert_eq!(model.load_queue_state("flaky").await.expect("reload").seq, 2);
    }

    #[tokio::test]
    async fn conflicting_call_is_redone() {
        let model = model().await;
        let doc = seed(&model, "m1").await;
        let proc = flaky(1);
        let config = PipelineConfig::default();
        let runner = QueueRunner::new(&proc, &model, &config);

        let mut state = model.load_queue_state("flaky").await.expect("load");
        let created = runner
            .process_queue(vec![event(&doc, 1, &["in"])], &mut state)
            .await
            .expect("run");
        assert_eq!(proc.calls.load(Ordering::SeqCst), 2);
        assert!(created >= 1);
    }

    #[tokio::test]
    async fn persistent_conflict_is_fatal() {
        let model = model().await;
        let doc = seed(&model, "m1").await;
        let proc = flaky(usize::MAX);
        let config = PipelineConfig {
            max_conflict_retries: 2,
            ..PipelineConfig::default()
        };
        let runner = QueueRunner::new(&proc, &model, &config);

        let mut state = model.load_queue_state("flaky").await.expect("load");
        let err = runner
            .process_queue(vec![event(&doc, 1, &["in"])], &mut state)
            .await
            .expect_err("exhausted");
        assert!(matches!(err, PipelineError::ConflictRetriesExhausted { attempts: 3, .. }));
        assert_eq!(proc.calls.load(Ordering::SeqCst), 3);
        assert_eq!(model.load_queue_state("flaky").await.expect("reload").seq, 0);
    }

    #[tokio::test]
    async fn idle_batch_saves_only_past_drift() {
        let model = model().await;
        let proc = flaky(0);
        let config = PipelineConfig {
            checkpoint_drift: 10,
            ..PipelineConfig::default()
        };
        let runner = QueueRunner::new(&proc, &model, &config);
        let mut state = model.load_queue_state("flaky").await.expect("load");

        runner
            .process_queue(vec![event("rk!none", 5, &["other"])], &mut state)
            .await
            .expect("run");
        assert_eq!(state.seq, 5);
        assert!(state.doc_rev.is_none());

        runner
            .process_queue(vec![event("rk!none", 12, &["other"])], &mut state)
            .await
            .expect("run");
        assert_eq!(state.last_saved_seq, 12);
    }

    #[tokio::test]
    async fn cancelled_runner_stops_before_work() {
        let model = model().await;
        let doc = seed(&model, "m1").await;
        let proc = flaky(0);
        let config = PipelineConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = QueueRunner::new(&proc, &model, &config).with_cancel(&cancel);

        let mut state = model.load_queue_state("flaky").await.expect("load");
        let err = runner
            .process_queue(vec![event(&doc, 1, &["in"])], &mut state)
            .await
            .expect_err("stopped");
        assert!(matches!(err, PipelineError::Stopped));
        assert_eq!(proc.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.seq, 0);
    }

    #[tokio::test]
    async fn sweep_offers_sources_directly() {
        let model = model().await;
        let doc = seed(&model, "m1").await;
        let proc = flaky(0);
        let config = PipelineConfig::default();
        let runner = QueueRunner::new(&proc, &model, &config);
        let src = model
            .current_source(&doc, "in")
            .await
            .expect("source")
            .expect("exists");
        let created = runner.process_sources(vec![src], true).await.expect("sweep");
        assert_eq!(created, 1);
    }
}
