//! Extension Processor: decides whether an extension must run on a source,
//! runs it, contains its failures and diffs its output against last time.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use schemaflow_shared::{
    ERROR_SCHEMA, ExtensionCategory, PipelineError, Result, SchemaItem, SourceRef, content_rev,
};
use schemaflow_storage::ViewRow;

use crate::model::{DocModel, SourceDocument};
use crate::registry::Extension;
use crate::runtime::ExtensionContext;

/// Result of offering one source to a processor.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Nothing to write.
    Unchanged,
    /// Items to write; `must_save_now` asks the runner to flush immediately.
    Items {
        items: Vec<SchemaItem>,
        must_save_now: bool,
    },
    /// The handler deferred work to the batch-end later phase.
    Deferred(Vec<Value>),
}

/// Anything the queue runner can drive over a change stream.
///
/// Extensions are the usual implementation; external subsystems register
/// their own through the pipeline.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// Queue id, also the checkpoint key.
    fn id(&self) -> &str;

    fn source_schemas(&self) -> &[String];

    fn uses_dependencies(&self) -> bool {
        false
    }

    async fn process(
        &self,
        model: &DocModel,
        src: &SourceRef,
        force: bool,
    ) -> Result<ProcessOutcome>;

    /// Consume tokens deferred during the batch.
    async fn process_later(
        &self,
        _model: &DocModel,
        _tokens: Vec<Value>,
    ) -> Result<Vec<SchemaItem>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Extension processor
// ---------------------------------------------------------------------------

pub struct ExtensionProcessor {
    ext: Arc<Extension>,
    stop_on_error: bool,
}

impl ExtensionProcessor {
    pub fn new(ext: Arc<Extension>, stop_on_error: bool) -> Self {
        Self { ext, stop_on_error }
    }

    pub fn extension(&self) -> &Arc<Extension> {
        &self.ext
    }

    /// Whether the extension's output for `src` may be out of date.
    ///
    /// A prior error record always counts: the failure may have been
    /// transient, and an identical repeat is not rewritten.
    fn is_dirty(&self, priors: &[ViewRow], src: &SourceRef) -> bool {
        if self.ext.uses_dependencies || priors.is_empty() {
            return true;
        }
        priors
            .iter()
            .any(|p| p.source.as_ref() != Some(src) || p.schema_id == ERROR_SCHEMA)
    }

    fn error_item(&self, source: &SourceDocument, err: &PipelineError) -> SchemaItem {
        let fields = json!({
            "error_ext": self.ext.id,
            "message": err.to_string(),
            "source_doc": source.doc_id,
            "source_schema": source.schema_id,
            "source_rev": source.rev,
            "failed_at": Utc::now().to_rfc3339(),
        });
        SchemaItem::new(
            source.rd_key.clone(),
            ERROR_SCHEMA,
            &self.ext.id,
            fields.as_object().cloned().unwrap_or_default(),
        )
        .with_source(source.source_ref())
    }
}

/// Prior entry the new item would overwrite with identical content.
fn is_unchanged(item: &SchemaItem, priors: &[ViewRow]) -> bool {
    if !item.attachments.is_empty() {
        return false;
    }
    let doc_id = item.doc_id();
    let mut deps = item.deps.clone();
    deps.sort();
    deps.dedup();
    priors.iter().any(|p| {
        p.doc_id == doc_id
            && p.schema_id == item.schema_id
            && p.source == item.source
            && p.deps == deps
            && p.entry_rev == content_rev(&item.fields, item.confidence)
    })
}

#[async_trait]
impl QueueProcessor for ExtensionProcessor {
    fn id(&self) -> &str {
        &self.ext.id
    }

    fn source_schemas(&self) -> &[String] {
        &self.ext.source_schemas
    }

    fn uses_dependencies(&self) -> bool {
        self.ext.uses_dependencies
    }

    #[instrument(skip_all, fields(ext_id = %self.ext.id, src = %src))]
    async fn process(
        &self,
        model: &DocModel,
        src: &SourceRef,
        force: bool,
    ) -> Result<ProcessOutcome> {
        let ext = &self.ext;

        let priors = if ext.category == ExtensionCategory::Smart {
            // No freshness bookkeeping beyond its own error records.
            let mut priors = model.prior_outputs(&ext.id, src).await?;
            priors.retain(|p| p.schema_id == ERROR_SCHEMA);
            priors
        } else {
            let priors = model.prior_outputs(&ext.id, src).await?;
            if !force && !self.is_dirty(&priors, src) {
                return Ok(ProcessOutcome::Unchanged);
            }
            priors
        };

        let Some(source) = model.open_source(src).await? else {
            debug!("source moved on, skipping");
            return Ok(ProcessOutcome::Unchanged);
        };

        if source.contributors.iter().all(|c| c == &ext.id) {
            if ext.category == ExtensionCategory::Provider {
                warn!("provider offered its own output, skipping");
            }
            return Ok(ProcessOutcome::Unchanged);
        }

        let result = {
            let _single_flight = ext.invocation().await;
            let mut ctx = ExtensionContext::new(model, ext, Some(&source));
            ext.handler
                .handle(&source, &mut ctx)
                .await
                .map(|()| ctx.finish())
        };

        let (mut items, did_query) = match result {
            Ok(emission) if !emission.deferred.is_empty() => {
                return Ok(ProcessOutcome::Deferred(emission.deferred));
            }
            Ok(emission) => (emission.items, emission.did_query),
            Err(e) => {
                if self.stop_on_error {
                    return Err(PipelineError::extension(&ext.id, e.to_string()));
                }
                let message = e.to_string();
                let recorded = priors.iter().any(|p| {
                    p.schema_id == ERROR_SCHEMA
                        && p.source.as_ref() == Some(src)
                        && p.fields.get("message").and_then(Value::as_str) == Some(message.as_str())
                });
                if recorded {
                    debug!(error = %e, "extension failed again; error already recorded");
                    return Ok(ProcessOutcome::Unchanged);
                }
                warn!(error = %e, "extension failed; recording error");
                (vec![self.error_item(&source, &e)], false)
            }
        };

        let must_save_now = did_query || items.iter().any(|i| i.rd_key != source.rd_key);

        let current: HashSet<(String, String)> = items
            .iter()
            .map(|i| (i.doc_id(), i.schema_id.clone()))
            .collect();
        let tombstones: Vec<SchemaItem> = priors
            .iter()
            .filter(|p| !current.contains(&(p.doc_id.clone(), p.schema_id.clone())))
            .map(|p| {
                SchemaItem::tombstone(p.rd_key.clone(), &p.schema_id, &ext.id, &p.doc_rev)
                    .with_source(src.clone())
            })
            .collect();

        items.retain(|i| !is_unchanged(i, &priors));
        if items.is_empty() && tombstones.is_empty() {
            debug!("output unchanged");
            return Ok(ProcessOutcome::Unchanged);
        }
        debug!(items = items.len(), tombstones = tombstones.len(), "extension produced output");

        let mut out = tombstones;
        out.append(&mut items);
        Ok(ProcessOutcome::Items {
            items: out,
            must_save_now,
        })
    }

    #[instrument(skip_all, fields(ext_id = %self.ext.id, tokens = tokens.len()))]
    async fn process_later(&self, model: &DocModel, tokens: Vec<Value>) -> Result<Vec<SchemaItem>> {
        let Some(later) = self.ext.later.as_ref() else {
            warn!("tokens deferred but no later handler is configured");
            return Ok(Vec::new());
        };

        let result = {
            let _single_flight = self.ext.invocation().await;
            let mut ctx = ExtensionContext::new(model, &self.ext, None);
            later
                .handle_later(tokens, &mut ctx)
                .await
                .map(|()| ctx.finish())
        };

        match result {
            Ok(emission) => Ok(emission.items),
            Err(e) if self.stop_on_error => {
                Err(PipelineError::extension(&self.ext.id, e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "later handler failed; batch output dropped");
                Ok(Vec::new())
            }
        }
    }
}

/// Fields of an error record, for operators and the retry sweep.
pub fn error_summary(fields: &Map<String, Value>) -> String {
    let ext = fields.get("error_ext").and_then(Value::as_str).unwrap_or("?");
    let message = fields.get("message").and_then(Value::as_str).unwrap_or("");
    format!("{ext}: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use schemaflow_shared::{RAW_EXT_ID, RdKey};
    use schemaflow_storage::LibsqlStore;
    use uuid::Uuid;

    use crate::registry::{ExtensionHandler, LaterHandler};

    async fn model() -> DocModel {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        let store = LibsqlStore::open(&tmp).await.expect("open");
        DocModel::new(Arc::new(store), 50)
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    /// Emits one `out` item per source, plus `extra` while the flag is set.
    struct Echo {
        calls: AtomicUsize,
        extra: std::sync::atomic::AtomicBool,
    }

    impl Echo {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                extra: std::sync::atomic::AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl ExtensionHandler for Echo {
        async fn handle(
            &self,
            source: &SourceDocument,
            ctx: &mut ExtensionContext<'_>,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.emit("out", source.fields.clone())?;
            if self.extra.load(Ordering::SeqCst) {
                ctx.emit("extra", Map::new())?;
            }
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl ExtensionHandler for Fails {
        async fn handle(&self, _: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
            ctx.emit("out", Map::new())?;
            Err(PipelineError::validation("bad input"))
        }
    }

    /// Fails on its first call only.
    struct FailsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtensionHandler for FailsOnce {
        async fn handle(&self, _: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PipelineError::validation("not yet"));
            }
            ctx.emit("out", obj(json!({"ok": true})))?;
            Ok(())
        }
    }

    struct Defers;

    #[async_trait]
    impl ExtensionHandler for Defers {
        async fn handle(
            &self,
            source: &SourceDocument,
            ctx: &mut ExtensionContext<'_>,
        ) -> Result<()> {
            ctx.emit("ignored", Map::new())?;
            ctx.process_later(json!(source.doc_id));
            Ok(())
        }
    }

    struct CountTokens;

    #[async_trait]
    impl LaterHandler for CountTokens {
        async fn handle_later(
            &self,
            tokens: Vec<Value>,
            ctx: &mut ExtensionContext<'_>,
        ) -> Result<()> {
            let src = SourceRef::new("rk!x", "in", "r");
            ctx.emit_for(src, RdKey::new("batch", "1"), "count", obj(json!({"n": tokens.len()})));
            Ok(())
        }
    }

    async fn seed(model: &DocModel, key: &str, v: Value) -> SourceRef {
        let item = SchemaItem::new(RdKey::new("msg", key), "in", RAW_EXT_ID, obj(v));
        let doc_id = item.doc_id();
        model.create_schema_items(vec![item]).await.expect("seed");
        model
            .current_source(&doc_id, "in")
            .await
            .expect("source")
            .expect("exists")
    }

    async fn write(model: &DocModel, outcome: ProcessOutcome) -> usize {
        match outcome {
            ProcessOutcome::Items { items, .. } => {
                let n = items.len();
                model.create_schema_items(items).await.expect("write");
                n
            }
            _ => 0,
        }
    }

    fn provider(handler: Arc<dyn ExtensionHandler>) -> Arc<Extension> {
        Arc::new(
            Extension::new("p", ExtensionCategory::Provider, vec!["in".into()], handler)
                .with_emits(vec!["out".into(), "extra".into()]),
        )
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let model = model().await;
        let echo = Echo::new();
        let proc = ExtensionProcessor::new(provider(echo.clone()), false);
        let src = seed(&model, "m1", json!({"v": 1})).await;

        let first = proc.process(&model, &src, false).await.expect("first");
        assert_eq!(write(&model, first).await, 2);

        let second = proc.process(&model, &src, false).await.expect("second");
        assert!(matches!(second, ProcessOutcome::Unchanged));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        // Forced runs invoke the handler but write nothing new.
        let forced = proc.process(&model, &src, true).await.expect("forced");
        assert!(matches!(forced, ProcessOutcome::Unchanged));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shrinking_output_tombstones_prior_item() {
        let model = model().await;
        let echo = Echo::new();
        let proc = ExtensionProcessor::new(provider(echo.clone()), false);
        let src = seed(&model, "m1", json!({"v": 1})).await;
        let first = proc.process(&model, &src, false).await.expect("first");
        write(&model, first).await;

        echo.extra.store(false, Ordering::SeqCst);
        let outcome = proc.process(&model, &src, true).await.expect("second");
        let ProcessOutcome::Items { items, .. } = outcome else {
            panic!("expected a tombstone");
        };
        assert_eq!(items.len(), 1);
        assert!(items[0].deleted);
        assert_eq!(items[0].schema_id, "extra");
        model.create_schema_items(items).await.expect("tombstone");

        let doc_id = RdKey::new("msg", "m1").doc_id();
        assert!(model.open_schema(&doc_id, "extra").await.expect("read").is_none());
        assert!(model.open_schema(&doc_id, "out").await.expect("read").is_some());
    }

    #[tokio::test]
    async fn failure_becomes_single_error_record() {
        let model = model().await;
        let proc = ExtensionProcessor::new(provider(Arc::new(Fails)), false);
        let src = seed(&model, "m1", json!({})).await;

        let outcome = proc.process(&model, &src, false).await.expect("contained");
        let ProcessOutcome::Items { items, .. } = outcome else {
            panic!("expected error record");
        };
        assert_eq!(items.len(), 1);
        assert!(items[0].is_error());
        assert_eq!(items[0].fields["error_ext"], json!("p"));
        assert_eq!(items[0].fields["source_rev"], json!(src.rev));
        assert!(error_summary(&items[0].fields).starts_with("p: "));
        model.create_schema_items(items).await.expect("write");

        // The same failure on the same source is not written twice.
        let again = proc.process(&model, &src, false).await.expect("again");
        assert!(matches!(again, ProcessOutcome::Unchanged));
        let forced = proc.process(&model, &src, true).await.expect("forced");
        assert!(matches!(forced, ProcessOutcome::Unchanged));
    }

    #[tokio::test]
    async fn earlier_failure_is_retried_without_force() {
        let model = model().await;
        let handler = Arc::new(FailsOnce {
            calls: AtomicUsize::new(0),
        });
        let proc = ExtensionProcessor::new(provider(handler.clone()), false);
        let src = seed(&model, "m1", json!({})).await;

        let first = proc.process(&model, &src, false).await.expect("first");
        assert_eq!(write(&model, first).await, 1);
        let doc_id = RdKey::new("msg", "m1").doc_id();
        assert!(model.open_schema(&doc_id, ERROR_SCHEMA).await.expect("read").is_some());

        // Same source revision, no force: the error record alone makes it dirty.
        let second = proc.process(&model, &src, false).await.expect("second");
        assert_eq!(write(&model, second).await, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(model.open_schema(&doc_id, ERROR_SCHEMA).await.expect("read").is_none());
        assert!(model.open_schema(&doc_id, "out").await.expect("read").is_some());

        let third = proc.process(&model, &src, false).await.expect("third");
        assert!(matches!(third, ProcessOutcome::Unchanged));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_propagates_with_stop_on_error() {
        let model = model().await;
        let proc = ExtensionProcessor::new(provider(Arc::new(Fails)), true);
        let src = seed(&model, "m1", json!({})).await;
        let err = proc.process(&model, &src, false).await.expect_err("stop");
        assert!(matches!(err, PipelineError::Extension { .. }));
    }

    #[tokio::test]
    async fn stale_source_is_skipped() {
        let model = model().await;
        let proc = ExtensionProcessor::new(provider(Echo::new()), false);
        let src = seed(&model, "m1", json!({"v": 1})).await;
        seed(&model, "m1", json!({"v": 2})).await;
        let outcome = proc.process(&model, &src, false).await.expect("process");
        assert!(matches!(outcome, ProcessOutcome::Unchanged));
    }

    #[tokio::test]
    async fn deferred_tokens_reach_later_handler() {
        let model = model().await;
        let ext = Arc::new(
            Extension::new("s", ExtensionCategory::Smart, vec!["in".into()], Arc::new(Defers))
                .with_later(Arc::new(CountTokens)),
        );
        let proc = ExtensionProcessor::new(ext, false);
        let a = seed(&model, "m1", json!({})).await;
        let b = seed(&model, "m2", json!({})).await;

        let mut tokens = Vec::new();
        for src in [&a, &b] {
            match proc.process(&model, src, false).await.expect("process") {
                ProcessOutcome::Deferred(t) => tokens.extend(t),
                other => panic!("expected deferral, got {other:?}"),
            }
        }
        let items = proc.process_later(&model, tokens).await.expect("later");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].fields["n"], json!(2));
    }
}
