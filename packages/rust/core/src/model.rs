//! Schema/Document Model: the write path and the reads the pipeline needs.
//!
//! Items are grouped by target document (derived from the rd_key alone, so
//! different schemas about the same subject share a document), merged into
//! that document's per-extension entries and upserted in one request.
//! Attachments follow in a second, strictly sequential pass per document
//! because each save moves the document to a new revision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use schemaflow_shared::{
    Attachment, Conflict, ItemRef, PipelineError, QueueState, RawDocument, RdKey, Result,
    SchemaDocument, SchemaEntry, SchemaItem, SourceRef,
};
use schemaflow_storage::{AttachmentStub, DocStore, DocWrite, ViewQuery, ViewRow, WriteResult};

/// A stored document parsed into the schema layout.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub id: String,
    pub rev: String,
    pub created_seq: u64,
    pub doc: SchemaDocument,
    pub attachments: Vec<AttachmentStub>,
}

/// One schema of one document, as handed to an extension.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub doc_id: String,
    /// Revision of the whole document.
    pub doc_rev: String,
    pub rd_key: RdKey,
    pub schema_id: String,
    /// Revision of `schema_id` within the document.
    pub rev: String,
    /// Merged view of the schema across contributing extensions.
    pub fields: Map<String, Value>,
    /// Extensions contributing the schema.
    pub contributors: Vec<String>,
    /// Names of the document's attachments.
    pub attachments: Vec<String>,
}

impl SourceDocument {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::new(&self.doc_id, &self.schema_id, &self.rev)
    }

    /// String value of a top-level field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

fn conflict_of(item: &SchemaItem) -> Conflict {
    Conflict {
        doc_id: item.doc_id(),
        ext_id: item.ext_id.clone(),
        schema_id: item.schema_id.clone(),
        source: item.source.clone(),
    }
}

/// A document write awaiting its outcome.
struct PendingDoc {
    id: String,
    applied: Vec<SchemaItem>,
}

/// Shapes schema items into documents and reads them back.
pub struct DocModel {
    store: Arc<dyn DocStore>,
    refresh_every: usize,
    writes: AtomicUsize,
}

impl DocModel {
    pub fn new(store: Arc<dyn DocStore>, refresh_every: usize) -> Self {
        Self {
            store,
            refresh_every: refresh_every.max(1),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Write schema items, merging them into their documents.
    ///
    /// Returns one [`ItemRef`] per committed item. If any item conflicted,
    /// the rest are still committed and the error lists exactly the
    /// conflicting items.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn create_schema_items(&self, items: Vec<SchemaItem>) -> Result<Vec<ItemRef>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<SchemaItem>> = HashMap::new();
        for item in items {
            let id = item.doc_id();
            if !groups.contains_key(&id) {
                order.push(id.clone());
            }
            groups.entry(id).or_default().push(item);
        }

        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut writes: Vec<DocWrite> = Vec::new();
        let mut pending: Vec<PendingDoc> = Vec::new();

        for id in order {
            let Some(group) = groups.remove(&id) else { continue };
            let current = self.open_document(&id).await?;
            let base_rev = current.as_ref().map(|d| d.rev.clone());
            let mut doc = match current {
                Some(open) => open.doc,
                None => SchemaDocument::new(group[0].rd_key.clone()),
            };

            let mut applied = Vec::new();
            for item in group {
                if let Some(expected) = &item.rev {
                    if base_rev.as_deref() != Some(expected.as_str()) {
                        debug!(doc_id = %id, schema_id = %item.schema_id, "stale item revision");
                        conflicts.push(conflict_of(&item));
                        continue;
                    }
                }
                if item.deleted {
                    doc.remove(&item.ext_id, &item.schema_id);
                } else {
                    doc.insert(&item.ext_id, &item.schema_id, SchemaEntry::from_item(&item));
                }
                applied.push(item);
            }

            if applied.is_empty() {
                continue;
            }
            let deleted = doc.is_empty();
            if deleted && base_rev.is_none() {
                // Tombstones for a document that never existed.
                continue;
            }

            writes.push(DocWrite {
                id: id.clone(),
                expected_rev: base_rev,
                body: doc.to_value()?,
                deleted,
            });
            pending.push(PendingDoc { id, applied });
        }

        let outcomes = if writes.is_empty() {
            Vec::new()
        } else {
            self.store.bulk_upsert(writes).await?
        };

        let mut refs = Vec::new();
        let mut failures = Vec::new();

        for (outcome, doc) in outcomes.into_iter().zip(pending) {
            match outcome.result {
                WriteResult::Ok { rev } => {
                    let mut rev = rev;
                    for item in &doc.applied {
                        match self.save_attachments(&doc.id, &rev, item).await? {
                            WriteResult::Ok { rev: new_rev } => {
                                rev = new_rev;
                                refs.push(ItemRef {
                                    id: doc.id.clone(),
                                    rev: rev.clone(),
                                });
                            }
                            WriteResult::Conflict => conflicts.push(conflict_of(item)),
                            WriteResult::Failed(msg) => failures.push(format!("{}: {msg}", doc.id)),
                        }
                    }
                    self.note_write().await;
                }
                WriteResult::Conflict => {
                    conflicts.extend(doc.applied.iter().map(conflict_of));
                }
                WriteResult::Failed(msg) => failures.push(format!("{}: {msg}", doc.id)),
            }
        }

        if !failures.is_empty() {
            return Err(PipelineError::Storage(failures.join("; ")));
        }
        if !conflicts.is_empty() {
            debug!(conflicts = conflicts.len(), committed = refs.len(), "write had conflicts");
            return Err(PipelineError::Conflict { conflicts });
        }
        Ok(refs)
    }

    /// Save an item's attachments one after another on top of `rev`.
    async fn save_attachments(
        &self,
        doc_id: &str,
        rev: &str,
        item: &SchemaItem,
    ) -> Result<WriteResult> {
        let mut rev = rev.to_string();
        if item.deleted {
            return Ok(WriteResult::Ok { rev });
        }
        for (name, attachment) in &item.attachments {
            match self
                .store
                .put_attachment(doc_id, &rev, name, &attachment.content_type, &attachment.data)
                .await?
            {
                WriteResult::Ok { rev: next } => rev = next,
                other => return Ok(other),
            }
        }
        Ok(WriteResult::Ok { rev })
    }

    /// Count a document write and periodically let the views catch up.
    async fn note_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.refresh_every == 0 {
            if let Err(e) = self.store.refresh_views().await {
                warn!(error = %e, "view refresh failed");
            }
        }
    }

    /// Write raw documents from a protocol collaborator.
    pub async fn create_raw_documents(&self, raws: Vec<RawDocument>) -> Result<Vec<ItemRef>> {
        let items = raws.into_iter().map(RawDocument::into_schema_item).collect();
        self.create_schema_items(items).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn open_document(&self, doc_id: &str) -> Result<Option<OpenDocument>> {
        let Some(stored) = self.store.get(doc_id).await? else {
            return Ok(None);
        };
        Ok(Some(OpenDocument {
            doc: SchemaDocument::from_value(&stored.body)?,
            id: stored.id,
            rev: stored.rev,
            created_seq: stored.created_seq,
            attachments: stored.attachments,
        }))
    }

    /// Current revision of one schema in a document, as a source reference.
    pub async fn current_source(&self, doc_id: &str, schema_id: &str) -> Result<Option<SourceRef>> {
        Ok(self
            .open_document(doc_id)
            .await?
            .and_then(|open| open.doc.schema_rev(schema_id))
            .map(|rev| SourceRef::new(doc_id, schema_id, rev)))
    }

    /// Open a source schema, only if it is still at the referenced revision.
    pub async fn open_source(&self, src: &SourceRef) -> Result<Option<SourceDocument>> {
        let Some(open) = self.open_document(&src.doc_id).await? else {
            return Ok(None);
        };
        if open.doc.schema_rev(&src.schema_id).as_deref() != Some(src.rev.as_str()) {
            return Ok(None);
        }
        let Some(fields) = open.doc.merged_fields(&src.schema_id) else {
            return Ok(None);
        };
        let contributors = open
            .doc
            .contributions(&src.schema_id)
            .into_iter()
            .map(|(ext, _)| ext.to_string())
            .collect();

        Ok(Some(SourceDocument {
            doc_id: open.id,
            doc_rev: open.rev,
            rd_key: open.doc.rd_key,
            schema_id: src.schema_id.clone(),
            rev: src.rev.clone(),
            fields,
            contributors,
            attachments: open.attachments.into_iter().map(|a| a.name).collect(),
        }))
    }

    /// Merged fields of one schema in a document.
    pub async fn open_schema(
        &self,
        doc_id: &str,
        schema_id: &str,
    ) -> Result<Option<Map<String, Value>>> {
        Ok(self
            .open_document(doc_id)
            .await?
            .and_then(|open| open.doc.merged_fields(schema_id)))
    }

    pub async fn open_attachment(&self, doc_id: &str, name: &str) -> Result<Option<Attachment>> {
        self.store.get_attachment(doc_id, name).await
    }

    /// Items an extension previously derived from `src`'s document and schema.
    pub async fn prior_outputs(&self, ext_id: &str, src: &SourceRef) -> Result<Vec<ViewRow>> {
        self.store
            .query(&ViewQuery::BySource {
                ext_id: ext_id.to_string(),
                doc_id: src.doc_id.clone(),
                schema_id: src.schema_id.clone(),
            })
            .await
    }

    pub async fn query(&self, query: &ViewQuery) -> Result<Vec<ViewRow>> {
        self.store.query(query).await
    }

    // -----------------------------------------------------------------------
    // Queue checkpoints
    // -----------------------------------------------------------------------

    /// Load a queue's checkpoint, or a fresh state at sequence 0.
    pub async fn load_queue_state(&self, queue_id: &str) -> Result<QueueState> {
        let mut state = QueueState::new(queue_id);
        if let Some(stored) = self.store.get(&state.doc_id()).await? {
            let seq = stored.body.get("seq").and_then(Value::as_u64).unwrap_or(0);
            state.seq = seq;
            state.last_saved_seq = seq;
            state.last_error = stored
                .body
                .get("last_error")
                .and_then(Value::as_str)
                .map(str::to_string);
            state.doc_rev = Some(stored.rev);
        }
        Ok(state)
    }

    /// Persist a queue's checkpoint. Any failure is an error; position is
    /// never dropped silently.
    pub async fn save_queue_state(&self, state: &mut QueueState) -> Result<()> {
        let write = DocWrite {
            id: state.doc_id(),
            expected_rev: state.doc_rev.clone(),
            body: json!({
                "rd_key": state.rd_key(),
                "seq": state.seq,
                "last_error": state.last_error,
            }),
            deleted: false,
        };

        let outcome = self
            .store
            .bulk_upsert(vec![write])
            .await
            .map_err(|e| PipelineError::checkpoint(&state.queue_id, e.to_string()))?;

        match outcome.into_iter().next().map(|o| o.result) {
            Some(WriteResult::Ok { rev }) => {
                debug!(queue = %state.queue_id, seq = state.seq, "checkpoint saved");
                state.doc_rev = Some(rev);
                state.last_saved_seq = state.seq;
                Ok(())
            }
            Some(WriteResult::Conflict) => Err(PipelineError::checkpoint(
                &state.queue_id,
                "checkpoint document changed underneath the queue",
            )),
            Some(WriteResult::Failed(msg)) => Err(PipelineError::checkpoint(&state.queue_id, msg)),
            None => Err(PipelineError::checkpoint(&state.queue_id, "no write outcome")),
        }
    }

    /// Remove a queue's checkpoint so it starts over from sequence 0.
    pub async fn delete_queue_state(&self, queue_id: &str) -> Result<bool> {
        let state = self.load_queue_state(queue_id).await?;
        let Some(rev) = state.doc_rev.clone() else {
            return Ok(false);
        };
        let outcome = self
            .store
            .bulk_upsert(vec![DocWrite {
                id: state.doc_id(),
                expected_rev: Some(rev),
                body: json!({}),
                deleted: true,
            }])
            .await?;
        match outcome.into_iter().next().map(|o| o.result) {
            Some(WriteResult::Ok { .. }) => Ok(true),
            _ => Err(PipelineError::checkpoint(queue_id, "could not delete checkpoint")),
        }
    }
}
