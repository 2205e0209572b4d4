//! End-to-end runs of the pipeline over a real libsql store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use schemaflow_core::builtin::{BODY_SCHEMA, CONV_SUMMARY_SCHEMA};
use schemaflow_core::manager::is_stable;
use schemaflow_core::{
    Extension, ExtensionContext, ExtensionHandler, ExtensionRegistry, HandlerCatalog, Pipeline,
    QueueStatus, QueueView, SilentProgress, SourceDocument, SyncConductor, builtin_descriptors,
    raw_from_rfc822,
};
use schemaflow_shared::{
    ERROR_SCHEMA, ExtensionCategory, ExtensionDescriptor, FeedOptions, PipelineConfig,
    PipelineError, RawDocument, RdKey, Result, SchemaItem,
};
use schemaflow_storage::{LibsqlStore, ViewQuery};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

async fn store() -> Arc<LibsqlStore> {
    let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
    Arc::new(LibsqlStore::open(&tmp).await.expect("open store"))
}

fn pipeline_with(store: Arc<LibsqlStore>, registry: ExtensionRegistry) -> Pipeline {
    Pipeline::new(store, registry, PipelineConfig::default(), FeedOptions::default())
}

async fn builtin_pipeline() -> Pipeline {
    let (registry, report) =
        ExtensionRegistry::load(&builtin_descriptors(), &HandlerCatalog::builtin());
    assert!(report.rejected.is_empty());
    pipeline_with(store().await, registry)
}

fn message(id: &str, in_reply_to: Option<&str>, subject: &str) -> Vec<u8> {
    let mut text = format!(
        "From: ann@example.com\r\nTo: bob@example.com\r\nSubject: {subject}\r\n\
         Date: Tue, 1 Jul 2025 10:00:00 +0000\r\nMessage-Id: <{id}>\r\n"
    );
    if let Some(parent) = in_reply_to {
        text.push_str(&format!("In-Reply-To: <{parent}>\r\n"));
    }
    text.push_str("\r\nHello there.\r\n");
    text.into_bytes()
}

async fn ingest(pipeline: &Pipeline, raws: Vec<RawDocument>) {
    SyncConductor::new(pipeline.model().clone())
        .ingest(raws)
        .await
        .expect("ingest");
}

async fn rows(pipeline: &Pipeline, schema_id: &str) -> Vec<schemaflow_storage::ViewRow> {
    pipeline
        .model()
        .query(&ViewQuery::BySchema {
            schema_id: schema_id.to_string(),
        })
        .await
        .expect("query")
}

async fn run(pipeline: &Pipeline) -> schemaflow_core::RunSummary {
    tokio::time::timeout(Duration::from_secs(30), pipeline.run_until_stable(&SilentProgress))
        .await
        .expect("pipeline reached stability in time")
        .expect("run")
}

fn note(id: &str, fields: Value) -> RawDocument {
    let mut raw = RawDocument::new("note", "rd.test.note", id);
    raw.fields = fields.as_object().cloned().unwrap_or_default();
    raw
}

/// One `rd.test.tag` item per entry of the source's `tags` array.
struct Tagger;

#[async_trait]
impl ExtensionHandler for Tagger {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let tags = source.fields.get("tags").and_then(Value::as_array).cloned().unwrap_or_default();
        for tag in tags {
            let mut fields = Map::new();
            fields.insert("tag".into(), tag.clone());
            ctx.emit_keyed(RdKey::new("tag", tag), "rd.test.tag", fields)?;
        }
        Ok(())
    }
}

/// Fails on notes marked `boom` while `broken` is set.
struct Fragile {
    broken: AtomicBool,
}

#[async_trait]
impl ExtensionHandler for Fragile {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let boom = source.fields.get("boom").and_then(Value::as_bool).unwrap_or(false);
        if boom && self.broken.load(Ordering::SeqCst) {
            return Err(PipelineError::extension("test.fragile", "note exploded"));
        }
        let mut fields = Map::new();
        fields.insert("ok".into(), Value::Bool(true));
        ctx.emit("rd.test.done", fields)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_message_yields_one_body() {
    let pipeline = builtin_pipeline().await;
    let raw = raw_from_rfc822(&message("m1@example.com", None, "Lunch")).expect("raw");
    ingest(&pipeline, vec![raw]).await;
    let inserted_at = pipeline.model().store().current_seq().await.expect("seq");

    let summary = run(&pipeline).await;
    assert!(summary.stable);
    assert!(summary.failures.is_empty());

    let bodies = rows(&pipeline, BODY_SCHEMA).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0].fields["subject"], json!("Lunch"));
    assert_eq!(bodies[0].fields["body"], json!("Hello there."));
    assert_eq!(bodies[0].rd_key, RdKey::new("msg", "m1@example.com"));

    let status = pipeline.status().await.expect("status");
    assert_eq!(status.queues.len(), 4);
    for queue in &status.queues {
        assert!(queue.seq >= inserted_at, "{} stuck at {}", queue.name, queue.seq);
    }
}

#[tokio::test]
async fn shared_conversation_has_one_summary() {
    let pipeline = builtin_pipeline().await;
    let first = raw_from_rfc822(&message("m1@example.com", None, "Plans")).expect("raw");
    let reply = message("m2@example.com", Some("m1@example.com"), "Re: Plans");
    let reply = raw_from_rfc822(&reply).expect("raw");
    ingest(&pipeline, vec![first]).await;
    ingest(&pipeline, vec![reply]).await;

    run(&pipeline).await;

    let summaries = rows(&pipeline, CONV_SUMMARY_SCHEMA).await;
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.rd_key, RdKey::new("conv", "m1@example.com"));
    assert_eq!(summary.fields["message_ids"], json!(["m1@example.com", "m2@example.com"]));
    assert_eq!(summary.fields["message_count"], json!(2));
}

#[tokio::test]
async fn rerun_without_new_input_writes_nothing() {
    let pipeline = builtin_pipeline().await;
    let raw = raw_from_rfc822(&message("m1@example.com", None, "Once")).expect("raw");
    ingest(&pipeline, vec![raw]).await;

    let first = run(&pipeline).await;
    assert!(first.created > 0);
    let before = rows(&pipeline, BODY_SCHEMA).await;

    let second = run(&pipeline).await;
    assert_eq!(second.created, 0);
    assert_eq!(rows(&pipeline, BODY_SCHEMA).await[0].doc_rev, before[0].doc_rev);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_handler_is_recorded_and_retried() {
    let fragile = Arc::new(Fragile {
        broken: AtomicBool::new(true),
    });
    let mut registry = ExtensionRegistry::new();
    registry
        .add(Extension::new(
            "test.fragile",
            ExtensionCategory::Provider,
            vec!["rd.test.note".into()],
            fragile.clone(),
        ))
        .expect("add");
    let pipeline = pipeline_with(store().await, registry);

    ingest(
        &pipeline,
        vec![note("n1", json!({"boom": true})), note("n2", json!({"boom": false}))],
    )
    .await;
    let summary = run(&pipeline).await;
    assert!(summary.failures.is_empty(), "a handler error must not fail the queue");

    let errors = rows(&pipeline, ERROR_SCHEMA).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].ext_id, "test.fragile");
    assert!(errors[0].fields["message"].as_str().unwrap_or("").contains("note exploded"));
    // The queue carried on past the failure.
    assert_eq!(rows(&pipeline, "rd.test.done").await.len(), 1);

    fragile.broken.store(false, Ordering::SeqCst);
    let report = pipeline.retry_errors().await.expect("retry");
    assert_eq!(report.retried, 1);
    assert_eq!(report.cleared, 1);
    assert_eq!(report.remaining, 0);
    assert!(rows(&pipeline, ERROR_SCHEMA).await.is_empty());
    assert_eq!(rows(&pipeline, "rd.test.done").await.len(), 2);
}

#[tokio::test]
async fn shrinking_output_tombstones_missing_items() {
    let mut registry = ExtensionRegistry::new();
    registry
        .add(Extension::new(
            "test.tagger",
            ExtensionCategory::Provider,
            vec!["rd.test.note".into()],
            Arc::new(Tagger),
        ))
        .expect("add");
    let pipeline = pipeline_with(store().await, registry);

    ingest(&pipeline, vec![note("n1", json!({"tags": ["a", "b"]}))]).await;
    run(&pipeline).await;
    assert_eq!(rows(&pipeline, "rd.test.tag").await.len(), 2);

    ingest(&pipeline, vec![note("n1", json!({"tags": ["a"]}))]).await;
    run(&pipeline).await;

    let tags = rows(&pipeline, "rd.test.tag").await;
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].fields["tag"], json!("a"));
}

// ---------------------------------------------------------------------------
// Write protocol and loading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_conflict_does_not_block_the_batch() {
    let pipeline = pipeline_with(store().await, ExtensionRegistry::new());
    let model = pipeline.model();
    let target = RdKey::new("msg", "taken");
    model
        .create_schema_items(vec![SchemaItem::new(target.clone(), "s", "ext.a", Map::new())])
        .await
        .expect("seed");

    let mut stale = SchemaItem::new(target.clone(), "s", "ext.b", Map::new());
    stale.rev = Some("1-stale".into());
    let mut batch = vec![stale];
    for i in 0..3 {
        let key = RdKey::new("msg", format!("free-{i}"));
        batch.push(SchemaItem::new(key, "s", "ext.b", Map::new()));
    }

    let err = model.create_schema_items(batch).await.expect_err("conflict");
    let PipelineError::Conflict { conflicts } = err else {
        panic!("expected a conflict, got {err}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].doc_id, target.doc_id());

    for i in 0..3 {
        let doc = RdKey::new("msg", format!("free-{i}")).doc_id();
        assert!(model.open_schema(&doc, "s").await.expect("read").is_some());
    }
    assert!(
        model
            .query(&ViewQuery::ByKey {
                doc_id: target.doc_id(),
                schema_id: Some("s".into()),
            })
            .await
            .expect("read")
            .iter()
            .all(|r| r.ext_id == "ext.a")
    );
}

#[tokio::test]
async fn written_fields_read_back_unchanged() {
    let pipeline = pipeline_with(store().await, ExtensionRegistry::new());
    let fields = json!({
        "subject": "Hi",
        "count": 3,
        "ratio": 0.5,
        "tags": ["x", "y"],
        "nested": {"deep": [1, {"k": null}]},
    })
    .as_object()
    .cloned()
    .unwrap_or_default();
    let key = RdKey::new("msg", "rt");
    pipeline
        .provide_schema_items(vec![SchemaItem::new(
            key.clone(),
            "rd.test.rt",
            "outside",
            fields.clone(),
        )])
        .await
        .expect("write");

    let read = pipeline
        .model()
        .open_schema(&key.doc_id(), "rd.test.rt")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(read, fields);
}

#[test]
fn provider_reading_its_own_output_is_rejected() {
    let looped = ExtensionDescriptor {
        id: "test.loop".into(),
        handler: "rfc822-to-body".into(),
        later_handler: None,
        source_schemas: vec![BODY_SCHEMA.into()],
        emits: vec![BODY_SCHEMA.into()],
        category: ExtensionCategory::Provider,
        confidence: None,
        uses_dependencies: false,
        enabled: true,
    };
    let mut descriptors = builtin_descriptors();
    descriptors.push(looped);

    let (registry, report) = ExtensionRegistry::load(&descriptors, &HandlerCatalog::builtin());
    assert_eq!(registry.len(), 4);
    assert!(registry.get("test.loop").is_none());
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, "test.loop");
    assert!(report.rejected[0].reason.contains("own output"));
}

#[test]
fn stability_needs_every_queue_caught_up() {
    let view = |name: &str, seq| QueueView {
        name: name.into(),
        status: QueueStatus::Idle,
        seq,
        lag: 0,
        exhausted: true,
    };
    assert!(is_stable(&[view("a", 5), view("b", 5)], 5));
    assert!(!is_stable(&[view("a", 5), view("b", 7)], 7));
}
