//! Document store client for schemaflow.
//!
//! The [`DocStore`] trait is everything the pipeline needs from a store:
//! revision-checked bulk writes, reads by id and revision, revision-chained
//! attachments, indexed views over schema entries, a reverse dependency index
//! and a monotonically sequenced change log.
//!
//! [`LibsqlStore`] implements it over an embedded libSQL database and
//! [`PollingFeed`] serves its change log as a streamed transport.

mod feed;
mod migrations;
mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use schemaflow_shared::{Attachment, DepKey, RdKey, Result, SourceRef};

pub use feed::{
    ChangeTransport, FeedConnector, FeedRead, PollingFeed, PollingFeedConnector, TransportError,
};
pub use store::LibsqlStore;

// ---------------------------------------------------------------------------
// Documents and writes
// ---------------------------------------------------------------------------

/// Name and size of an attachment, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentStub {
    pub name: String,
    pub content_type: String,
    pub length: u64,
}

/// A live document as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub rev: String,
    pub body: Value,
    /// Sequence at which the document was first written.
    pub created_seq: u64,
    pub attachments: Vec<AttachmentStub>,
}

/// One document write in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct DocWrite {
    pub id: String,
    /// Current revision the write is based on; `None` creates the document.
    pub expected_rev: Option<String>,
    pub body: Value,
    pub deleted: bool,
}

/// Per-document result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Written (or already identical) at this revision.
    Ok { rev: String },
    /// The expected revision is not the current one.
    Conflict,
    /// Rejected for a reason other than a conflict.
    Failed(String),
}

/// Outcome of one [`DocWrite`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub id: String,
    pub result: WriteResult,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Indexed lookups over schema entries.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewQuery {
    /// Entries one extension derived from one source schema.
    BySource {
        ext_id: String,
        doc_id: String,
        schema_id: String,
    },
    /// Every entry of a schema.
    BySchema { schema_id: String },
    /// Entries in one document, optionally of one schema.
    ByKey {
        doc_id: String,
        schema_id: Option<String>,
    },
    /// Entries of a schema whose top-level scalar `field` equals `value`.
    ByField {
        schema_id: String,
        field: String,
        value: Value,
    },
    /// Every entry written by one extension.
    ByExtension { ext_id: String },
    /// Entries with no source (raw input).
    Sourceless,
}

/// One schema entry as indexed by the views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub doc_id: String,
    /// Current revision of the containing document.
    pub doc_rev: String,
    pub rd_key: RdKey,
    pub ext_id: String,
    pub schema_id: String,
    pub source: Option<SourceRef>,
    pub fields: Map<String, Value>,
    pub confidence: Option<f64>,
    /// Content revision of this entry alone.
    pub entry_rev: String,
    pub created_seq: u64,
    /// Schemas read while the entry was computed.
    pub deps: Vec<DepKey>,
}

/// An entry that read `(dep_doc, dep_schema)` while it was computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependentRow {
    pub doc_id: String,
    pub ext_id: String,
    pub schema_id: String,
    /// Source the dependent entry was derived from.
    pub source: Option<SourceRef>,
}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

/// A document's latest change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub seq: u64,
    pub doc_id: String,
    pub rev: String,
    pub deleted: bool,
    /// Schema ids present in the document at that change.
    pub schemas: Vec<String>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Operations the pipeline performs against a document store.
///
/// Transient failures are retried inside implementations and never surface
/// as [`schemaflow_shared::PipelineError::Transient`] unless retries ran out.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Write documents; each is checked against its expected revision
    /// independently, so one conflict does not block the rest.
    async fn bulk_upsert(&self, writes: Vec<DocWrite>) -> Result<Vec<WriteOutcome>>;

    /// Read the current revision of a live document.
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>>;

    /// Read a document only if `rev` is its current revision.
    async fn get_at(&self, id: &str, rev: &str) -> Result<Option<StoredDocument>>;

    /// Store an attachment on top of `rev`, returning the new revision.
    async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<WriteResult>;

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Attachment>>;

    /// Run a view lookup. Views are caught up with the change log first.
    async fn query(&self, query: &ViewQuery) -> Result<Vec<ViewRow>>;

    /// Entries that recorded a read of any of `keys`.
    async fn dependents(&self, keys: &[DepKey]) -> Result<Vec<DependentRow>>;

    /// Changes after `since`, in sequence order.
    async fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRow>>;

    /// Highest sequence in the change log.
    async fn current_seq(&self) -> Result<u64>;

    /// Bring materialized views up to date; returns the sequence reached.
    async fn refresh_views(&self) -> Result<u64>;
}

/// Schema ids present in a document body.
pub(crate) fn body_schema_ids(body: &Value) -> Vec<String> {
    let mut ids: Vec<String> = body
        .get("schemas")
        .and_then(Value::as_object)
        .map(|by_ext| {
            by_ext
                .values()
                .filter_map(Value::as_object)
                .flat_map(|by_schema| by_schema.keys().cloned())
                .collect()
        })
        .unwrap_or_default();
    ids.sort();
    ids.dedup();
    ids
}
