//! Core domain types shared by the store, the pipeline and its collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Schema id of the record written when an extension fails.
pub const ERROR_SCHEMA: &str = "rd.core.error";

/// Extension id used for raw documents fed in by protocol collaborators.
pub const RAW_EXT_ID: &str = "rd.core.raw";

/// rd_key kind used for queue checkpoint documents.
pub const QUEUE_KEY_KIND: &str = "ext";

/// Length of the hex digests used in ids and revisions.
const HASH_LEN: usize = 32;

/// Hex SHA-256 of `bytes`, truncated to `len` characters.
pub fn short_hash(bytes: &[u8], len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(len);
    hex
}

// ---------------------------------------------------------------------------
// RdKey
// ---------------------------------------------------------------------------

/// Composite key naming the logical subject of a fact, e.g. `["msg", "<id>"]`.
///
/// Serialized as a two element JSON array `[kind, id]`; `id` may itself be
/// any JSON value (attachments use `[message_id, index]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RdKey(pub String, pub Value);

impl RdKey {
    /// Build a key from a kind and any JSON-convertible id.
    pub fn new(kind: impl Into<String>, id: impl Into<Value>) -> Self {
        Self(kind.into(), id.into())
    }

    /// The key kind (`msg`, `conv`, `identity`, ...).
    pub fn kind(&self) -> &str {
        &self.0
    }

    /// The key value within its kind.
    pub fn id(&self) -> &Value {
        &self.1
    }

    /// Deterministic document id for this key.
    ///
    /// Every schema written under the same key lands in the same document.
    pub fn doc_id(&self) -> String {
        let canonical = serde_json::json!([self.0, self.1]).to_string();
        format!("rk!{}!{}", self.0, short_hash(canonical.as_bytes(), HASH_LEN))
    }
}

impl std::fmt::Display for RdKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.0, self.1)
    }
}

// ---------------------------------------------------------------------------
// Source references and dependency keys
// ---------------------------------------------------------------------------

/// Points at the exact schema revision an item was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// Document holding the source schema.
    pub doc_id: String,
    /// Schema within that document.
    pub schema_id: String,
    /// Revision of that schema (not of the whole document).
    pub rev: String,
}

impl SourceRef {
    pub fn new(
        doc_id: impl Into<String>,
        schema_id: impl Into<String>,
        rev: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            schema_id: schema_id.into(),
            rev: rev.into(),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.doc_id, self.schema_id, self.rev)
    }
}

/// `(doc_id, schema_id)` an item was computed from by reading it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepKey(pub String, pub String);

impl DepKey {
    pub fn doc_id(&self) -> &str {
        &self.0
    }

    pub fn schema_id(&self) -> &str {
        &self.1
    }
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// Governs how an extension's staleness is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionCategory {
    /// Manages its own freshness; no bookkeeping by the processor.
    Smart,
    /// Derives new facts; must never depend on its own output.
    Provider,
    /// Refines facts; may read its own output and skips re-firing on it.
    Extender,
}

impl std::fmt::Display for ExtensionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Smart => "smart",
            Self::Provider => "provider",
            Self::Extender => "extender",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Schema items
// ---------------------------------------------------------------------------

/// Binary payload stored beside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// One fact about an rd_key, contributed by exactly one extension.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaItem {
    pub rd_key: RdKey,
    pub schema_id: String,
    pub ext_id: String,
    /// Source the item was derived from; `None` for raw input.
    pub source: Option<SourceRef>,
    pub fields: Map<String, Value>,
    pub confidence: Option<f64>,
    /// Schemas read while computing the item.
    pub deps: Vec<DepKey>,
    pub attachments: BTreeMap<String, Attachment>,
    /// Tombstone: remove this extension's instance of the schema.
    pub deleted: bool,
    /// Document revision the write must match, if any.
    pub rev: Option<String>,
}

impl SchemaItem {
    pub fn new(
        rd_key: RdKey,
        schema_id: impl Into<String>,
        ext_id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            rd_key,
            schema_id: schema_id.into(),
            ext_id: ext_id.into(),
            source: None,
            fields,
            confidence: None,
            deps: Vec::new(),
            attachments: BTreeMap::new(),
            deleted: false,
            rev: None,
        }
    }

    /// A tombstone for a previously written item, guarded by `doc_rev`.
    pub fn tombstone(
        rd_key: RdKey,
        schema_id: impl Into<String>,
        ext_id: impl Into<String>,
        doc_rev: impl Into<String>,
    ) -> Self {
        Self {
            deleted: true,
            rev: Some(doc_rev.into()),
            ..Self::new(rd_key, schema_id, ext_id, Map::new())
        }
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Id of the document this item is stored in.
    pub fn doc_id(&self) -> String {
        self.rd_key.doc_id()
    }

    pub fn is_error(&self) -> bool {
        self.schema_id == ERROR_SCHEMA
    }
}

/// Id and revision of a document after a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub rev: String,
}

// ---------------------------------------------------------------------------
// Raw documents
// ---------------------------------------------------------------------------

/// Input unit from a protocol collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    /// Broad category, e.g. `msg`.
    pub category: String,
    /// Document type, which becomes the schema id (e.g. `rd.msg.rfc822`).
    pub doc_type: String,
    /// Identifier assigned by the originating provider.
    pub provider_id: String,
    pub fields: Map<String, Value>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl RawDocument {
    pub fn new(
        category: impl Into<String>,
        doc_type: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            doc_type: doc_type.into(),
            provider_id: provider_id.into(),
            fields: Map::new(),
            attachments: BTreeMap::new(),
        }
    }

    pub fn rd_key(&self) -> RdKey {
        RdKey::new(self.category.clone(), self.provider_id.clone())
    }

    /// Shape the raw document as a schema item.
    pub fn into_schema_item(self) -> SchemaItem {
        let mut item = SchemaItem::new(self.rd_key(), self.doc_type, RAW_EXT_ID, self.fields);
        item.attachments = self.attachments;
        item
    }
}

// ---------------------------------------------------------------------------
// QueueState
// ---------------------------------------------------------------------------

/// Persisted position of one queue in the change log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueState {
    pub queue_id: String,
    /// Sequence consumed up to.
    pub seq: u64,
    /// Sequence last written to the store.
    pub last_saved_seq: u64,
    /// Revision of the checkpoint document, once it exists.
    pub doc_rev: Option<String>,
    /// Why the queue failed in its last run, if it did.
    pub last_error: Option<String>,
}

impl QueueState {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            ..Self::default()
        }
    }

    pub fn rd_key(&self) -> RdKey {
        RdKey::new(QUEUE_KEY_KIND, self.queue_id.clone())
    }

    pub fn doc_id(&self) -> String {
        self.rd_key().doc_id()
    }

    /// How far the live position is ahead of the persisted one.
    pub fn drift(&self) -> u64 {
        self.seq.saturating_sub(self.last_saved_seq)
    }
}
