//! libSQL-backed [`DocStore`] (embedded, local file).
//!
//! A single connection is shared behind an async mutex; every operation runs
//! to completion before the next one starts. Materialized views are derived
//! from the change log and caught up lazily.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, Row, Value as SqlValue, params};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use schemaflow_shared::{
    Attachment, DepKey, PipelineError, RdKey, Result, SchemaDocument, SourceRef, short_hash,
};

use crate::migrations;
use crate::{
    AttachmentStub, ChangeRow, DependentRow, DocStore, DocWrite, StoredDocument, ViewQuery,
    ViewRow, WriteOutcome, WriteResult, body_schema_ids,
};

const MAX_TRANSIENT_RETRIES: u32 = 5;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(25);
const REV_HASH_LEN: usize = 32;

/// Retry an operation while it fails with a transient error.
macro_rules! retry_transient {
    ($op:expr, $body:expr) => {{
        let mut attempt = 0u32;
        loop {
            match $body {
                Err(e) if e.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!(op = $op, attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(TRANSIENT_BACKOFF * attempt).await;
                }
                other => break other,
            }
        }
    }};
}

/// Map a libSQL error, classifying lock contention as transient.
fn db_err(e: libsql::Error) -> PipelineError {
    classify(e.to_string())
}

fn classify(message: String) -> PipelineError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("database is locked") || lower.contains("busy") {
        PipelineError::Transient(message)
    } else {
        PipelineError::Storage(message)
    }
}

/// Primary store handle wrapping a libSQL database.
pub struct LibsqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
}

impl LibsqlStore {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        // Returns the new timeout as a row, so it goes through `query`.
        conn.query("PRAGMA busy_timeout = 5000", params![])
            .await
            .map_err(db_err)?;

        run_migrations(&conn).await?;
        debug!(?path, "document store opened");

        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }
}

/// Run pending schema migrations.
async fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = schema_version(conn).await;

    for migration in migrations::all_migrations() {
        if migration.version > current_version {
            info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                PipelineError::Storage(format!("migration v{} failed: {e}", migration.version))
            })?;
        }
    }
    Ok(())
}

/// Current schema version, or 0 if no migrations have been applied.
async fn schema_version(conn: &Connection) -> u32 {
    match conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await
    {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        // Table doesn't exist yet
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn col_text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

fn col_int(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(db_err)
}

fn col_opt_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx).map_err(db_err)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s)),
        other => Err(PipelineError::Storage(format!(
            "expected text in column {idx}, got {other:?}"
        ))),
    }
}

fn col_opt_real(row: &Row, idx: i32) -> Result<Option<f64>> {
    match row.get_value(idx).map_err(db_err)? {
        SqlValue::Null => Ok(None),
        SqlValue::Real(f) => Ok(Some(f)),
        SqlValue::Integer(i) => Ok(Some(i as f64)),
        other => Err(PipelineError::Storage(format!(
            "expected number in column {idx}, got {other:?}"
        ))),
    }
}

fn col_blob(row: &Row, idx: i32) -> Result<Vec<u8>> {
    match row.get_value(idx).map_err(db_err)? {
        SqlValue::Blob(b) => Ok(b),
        SqlValue::Text(s) => Ok(s.into_bytes()),
        other => Err(PipelineError::Storage(format!(
            "expected blob in column {idx}, got {other:?}"
        ))),
    }
}

fn seq_of(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn seq_param(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Document heads and the change log
// ---------------------------------------------------------------------------

/// Revision bookkeeping of a stored document.
struct Head {
    rev: String,
    generation: i64,
    deleted: bool,
    created_seq: i64,
    body: String,
}

async fn load_head(conn: &Connection, id: &str) -> Result<Option<Head>> {
    let mut rows = conn
        .query(
            "SELECT rev, generation, deleted, created_seq, body FROM documents WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(Head {
            rev: col_text(&row, 0)?,
            generation: col_int(&row, 1)?,
            deleted: col_int(&row, 2)? != 0,
            created_seq: col_int(&row, 3)?,
            body: col_text(&row, 4)?,
        })),
        None => Ok(None),
    }
}

/// Whether a write based on `expected` may replace `head`.
fn revision_matches(head: Option<&Head>, expected: Option<&str>) -> bool {
    match (head, expected) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(h), None) => h.deleted,
        (Some(h), Some(rev)) => h.rev == rev,
    }
}

fn next_rev(generation: i64, material: &str) -> String {
    format!("{generation}-{}", short_hash(material.as_bytes(), REV_HASH_LEN))
}

/// Append a change for `doc_id`, dropping its previous one. Returns the new seq.
async fn record_change(
    conn: &Connection,
    doc_id: &str,
    rev: &str,
    deleted: bool,
    schemas: &[String],
) -> Result<i64> {
    let schemas_json = serde_json::to_string(schemas)?;
    let now = Utc::now().to_rfc3339();

    conn.execute("DELETE FROM changes WHERE doc_id = ?1", params![doc_id])
        .await
        .map_err(db_err)?;
    conn.execute(
        "INSERT INTO changes (doc_id, rev, deleted, schemas, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![doc_id, rev, i64::from(deleted), schemas_json.as_str(), now.as_str()],
    )
    .await
    .map_err(db_err)?;

    Ok(conn.last_insert_rowid())
}

async fn bulk_upsert_once(conn: &Connection, writes: &[DocWrite]) -> Result<Vec<WriteOutcome>> {
    let tx = conn.transaction().await.map_err(db_err)?;
    let mut outcomes = Vec::with_capacity(writes.len());

    for write in writes {
        let head = load_head(&tx, &write.id).await?;

        if !revision_matches(head.as_ref(), write.expected_rev.as_deref()) {
            outcomes.push(WriteOutcome {
                id: write.id.clone(),
                result: WriteResult::Conflict,
            });
            continue;
        }

        let body_text = serde_json::to_string(&write.body)?;

        let result = match &head {
            None if write.deleted => WriteResult::Failed("cannot delete a missing document".into()),
            Some(h) if h.deleted && write.deleted => WriteResult::Ok { rev: h.rev.clone() },
            Some(h) if !h.deleted && !write.deleted && h.body == body_text => {
                WriteResult::Ok { rev: h.rev.clone() }
            }
            _ => {
                let generation = head.as_ref().map_or(0, |h| h.generation) + 1;
                let rev = next_rev(generation, &format!("{}{body_text}", write.deleted));
                let schemas = if write.deleted {
                    Vec::new()
                } else {
                    body_schema_ids(&write.body)
                };
                let seq = record_change(&tx, &write.id, &rev, write.deleted, &schemas).await?;
                let created_seq = head
                    .as_ref()
                    .filter(|h| !h.deleted)
                    .map_or(seq, |h| h.created_seq);
                let now = Utc::now().to_rfc3339();

                tx.execute(
                    "INSERT INTO documents (id, rev, generation, body, deleted, created_seq, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        rev = excluded.rev,
                        generation = excluded.generation,
                        body = excluded.body,
                        deleted = excluded.deleted,
                        created_seq = excluded.created_seq,
                        updated_at = excluded.updated_at",
                    params![
                        write.id.as_str(),
                        rev.as_str(),
                        generation,
                        body_text.as_str(),
                        i64::from(write.deleted),
                        created_seq,
                        now.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;

                if write.deleted {
                    tx.execute(
                        "DELETE FROM attachments WHERE doc_id = ?1",
                        params![write.id.as_str()],
                    )
                    .await
                    .map_err(db_err)?;
                }

                WriteResult::Ok { rev }
            }
        };

        outcomes.push(WriteOutcome {
            id: write.id.clone(),
            result,
        });
    }

    tx.commit().await.map_err(db_err)?;
    Ok(outcomes)
}

async fn attachment_stubs(conn: &Connection, id: &str) -> Result<Vec<AttachmentStub>> {
    let mut rows = conn
        .query(
            "SELECT name, content_type, length(data) FROM attachments WHERE doc_id = ?1 ORDER BY name",
            params![id],
        )
        .await
        .map_err(db_err)?;

    let mut stubs = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        stubs.push(AttachmentStub {
            name: col_text(&row, 0)?,
            content_type: col_text(&row, 1)?,
            length: seq_of(col_int(&row, 2)?),
        });
    }
    Ok(stubs)
}

async fn get_once(conn: &Connection, id: &str) -> Result<Option<StoredDocument>> {
    let Some(head) = load_head(conn, id).await? else {
        return Ok(None);
    };
    if head.deleted {
        return Ok(None);
    }
    let body: Value = serde_json::from_str(&head.body)?;
    Ok(Some(StoredDocument {
        id: id.to_string(),
        rev: head.rev,
        body,
        created_seq: seq_of(head.created_seq),
        attachments: attachment_stubs(conn, id).await?,
    }))
}

async fn put_attachment_once(
    conn: &Connection,
    id: &str,
    rev: &str,
    name: &str,
    content_type: &str,
    data: &[u8],
) -> Result<WriteResult> {
    let tx = conn.transaction().await.map_err(db_err)?;

    let head = match load_head(&tx, id).await? {
        Some(h) if !h.deleted && h.rev == rev => h,
        _ => return Ok(WriteResult::Conflict),
    };

    let mut rows = tx
        .query(
            "SELECT content_type, data FROM attachments WHERE doc_id = ?1 AND name = ?2",
            params![id, name],
        )
        .await
        .map_err(db_err)?;
    if let Some(row) = rows.next().await.map_err(db_err)? {
        if col_text(&row, 0)? == content_type && col_blob(&row, 1)? == data {
            return Ok(WriteResult::Ok { rev: head.rev });
        }
    }
    drop(rows);

    tx.execute(
        "INSERT INTO attachments (doc_id, name, content_type, data) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(doc_id, name) DO UPDATE SET
            content_type = excluded.content_type,
            data = excluded.data",
        params![id, name, content_type, data.to_vec()],
    )
    .await
    .map_err(db_err)?;

    let generation = head.generation + 1;
    let data_hash = short_hash(data, REV_HASH_LEN);
    let new_rev = next_rev(generation, &format!("{}{name}{content_type}{data_hash}", head.rev));
    let body: Value = serde_json::from_str(&head.body)?;
    record_change(&tx, id, &new_rev, false, &body_schema_ids(&body)).await?;

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE documents SET rev = ?1, generation = ?2, updated_at = ?3 WHERE id = ?4",
        params![new_rev.as_str(), generation, now.as_str(), id],
    )
    .await
    .map_err(db_err)?;

    tx.commit().await.map_err(db_err)?;
    Ok(WriteResult::Ok { rev: new_rev })
}

async fn get_attachment_once(
    conn: &Connection,
    id: &str,
    name: &str,
) -> Result<Option<Attachment>> {
    let mut rows = conn
        .query(
            "SELECT a.content_type, a.data FROM attachments a
             JOIN documents d ON d.id = a.doc_id
             WHERE a.doc_id = ?1 AND a.name = ?2 AND d.deleted = 0",
            params![id, name],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(Attachment::new(col_text(&row, 0)?, col_blob(&row, 1)?))),
        None => Ok(None),
    }
}

async fn changes_once(conn: &Connection, since: u64, limit: usize) -> Result<Vec<ChangeRow>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut rows = conn
        .query(
            "SELECT seq, doc_id, rev, deleted, schemas FROM changes
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            params![seq_param(since), limit],
        )
        .await
        .map_err(db_err)?;

    let mut changes = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        changes.push(ChangeRow {
            seq: seq_of(col_int(&row, 0)?),
            doc_id: col_text(&row, 1)?,
            rev: col_text(&row, 2)?,
            deleted: col_int(&row, 3)? != 0,
            schemas: serde_json::from_str(&col_text(&row, 4)?)?,
        });
    }
    Ok(changes)
}

async fn current_seq_once(conn: &Connection) -> Result<u64> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(seq), 0) FROM changes", params![])
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(seq_of(col_int(&row, 0)?)),
        None => Ok(0),
    }
}

// ---------------------------------------------------------------------------
// Materialized views
// ---------------------------------------------------------------------------

/// A change waiting to be folded into the views.
struct PendingChange {
    seq: i64,
    doc_id: String,
    deleted: bool,
    body: Option<String>,
}

async fn refresh_once(conn: &Connection) -> Result<u64> {
    let view_seq = {
        let mut rows = conn
            .query("SELECT seq FROM view_state WHERE id = 1", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => col_int(&row, 0)?,
            None => 0,
        }
    };

    let mut pending = Vec::new();
    {
        let mut rows = conn
            .query(
                "SELECT c.seq, c.doc_id, c.deleted, d.body FROM changes c
                 LEFT JOIN documents d ON d.id = c.doc_id
                 WHERE c.seq > ?1 ORDER BY c.seq",
                params![view_seq],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            pending.push(PendingChange {
                seq: col_int(&row, 0)?,
                doc_id: col_text(&row, 1)?,
                deleted: col_int(&row, 2)? != 0,
                body: col_opt_text(&row, 3)?,
            });
        }
    }

    let Some(last) = pending.last().map(|c| c.seq) else {
        return Ok(seq_of(view_seq));
    };

    let tx = conn.transaction().await.map_err(db_err)?;
    for change in &pending {
        for table in ["schema_index", "field_index", "dependencies"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE doc_id = ?1"),
                params![change.doc_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        if change.deleted {
            continue;
        }
        let Some(text) = &change.body else { continue };
        let body: Value = serde_json::from_str(text)?;
        match SchemaDocument::from_value(&body) {
            Ok(doc) => index_document(&tx, &change.doc_id, &doc).await?,
            Err(e) => {
                debug!(doc_id = %change.doc_id, error = %e, "not a schema document, skipping")
            }
        }
    }
    tx.execute("UPDATE view_state SET seq = ?1 WHERE id = 1", params![last])
        .await
        .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;

    debug!(from = view_seq, to = last, changes = pending.len(), "views refreshed");
    Ok(seq_of(last))
}

async fn index_document(conn: &Connection, doc_id: &str, doc: &SchemaDocument) -> Result<()> {
    let rd_key = serde_json::to_string(&doc.rd_key)?;

    for (ext_id, by_schema) in &doc.schemas {
        for (schema_id, entry) in by_schema {
            let fields = serde_json::to_string(&entry.fields)?;
            let deps = serde_json::to_string(&entry.deps)?;
            let (source_doc, source_schema, source_rev) = match &entry.source {
                Some(s) => (
                    Some(s.doc_id.as_str()),
                    Some(s.schema_id.as_str()),
                    Some(s.rev.as_str()),
                ),
                None => (None, None, None),
            };
            conn.execute(
                "INSERT INTO schema_index
                    (doc_id, ext_id, schema_id, rd_key, source_doc, source_schema, source_rev,
                     entry_rev, confidence, fields, deps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    doc_id,
                    ext_id.as_str(),
                    schema_id.as_str(),
                    rd_key.as_str(),
                    source_doc,
                    source_schema,
                    source_rev,
                    entry.rev.as_str(),
                    entry.confidence,
                    fields.as_str(),
                    deps.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

            for (field, value) in &entry.fields {
                if !(value.is_string() || value.is_number() || value.is_boolean()) {
                    continue;
                }
                let value_text = serde_json::to_string(value)?;
                conn.execute(
                    "INSERT INTO field_index (doc_id, ext_id, schema_id, field, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        doc_id,
                        ext_id.as_str(),
                        schema_id.as_str(),
                        field.as_str(),
                        value_text.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;
            }

            for dep in &entry.deps {
                conn.execute(
                    "INSERT INTO dependencies (doc_id, ext_id, schema_id, dep_doc, dep_schema)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        doc_id,
                        ext_id.as_str(),
                        schema_id.as_str(),
                        dep.doc_id(),
                        dep.schema_id()
                    ],
                )
                .await
                .map_err(db_err)?;
            }
        }
    }
    Ok(())
}

const VIEW_SELECT: &str = "SELECT s.doc_id, d.rev, s.rd_key, s.ext_id, s.schema_id,
        s.source_doc, s.source_schema, s.source_rev, s.fields, s.confidence, s.entry_rev,
        d.created_seq, s.deps
     FROM schema_index s
     JOIN documents d ON d.id = s.doc_id";

const VIEW_ORDER: &str = "ORDER BY d.created_seq, s.doc_id, s.ext_id, s.schema_id";

fn source_from_columns(
    doc: Option<String>,
    schema: Option<String>,
    rev: Option<String>,
) -> Option<SourceRef> {
    match (doc, schema, rev) {
        (Some(d), Some(s), Some(r)) => Some(SourceRef::new(d, s, r)),
        _ => None,
    }
}

fn view_row(row: &Row) -> Result<ViewRow> {
    let rd_key: RdKey = serde_json::from_str(&col_text(row, 2)?)?;
    let fields: Map<String, Value> = serde_json::from_str(&col_text(row, 8)?)?;
    Ok(ViewRow {
        doc_id: col_text(row, 0)?,
        doc_rev: col_text(row, 1)?,
        rd_key,
        ext_id: col_text(row, 3)?,
        schema_id: col_text(row, 4)?,
        source: source_from_columns(
            col_opt_text(row, 5)?,
            col_opt_text(row, 6)?,
            col_opt_text(row, 7)?,
        ),
        fields,
        confidence: col_opt_real(row, 9)?,
        entry_rev: col_text(row, 10)?,
        created_seq: seq_of(col_int(row, 11)?),
        deps: serde_json::from_str(&col_text(row, 12)?)?,
    })
}

async fn query_once(conn: &Connection, query: &ViewQuery) -> Result<Vec<ViewRow>> {
    refresh_once(conn).await?;

    let (clause, args): (String, Vec<SqlValue>) = match query {
        ViewQuery::BySource {
            ext_id,
            doc_id,
            schema_id,
        } => (
            "WHERE s.ext_id = ?1 AND s.source_doc = ?2 AND s.source_schema = ?3".into(),
            vec![ext_id.clone().into(), doc_id.clone().into(), schema_id.clone().into()],
        ),
        ViewQuery::BySchema { schema_id } => {
            ("WHERE s.schema_id = ?1".into(), vec![schema_id.clone().into()])
        }
        ViewQuery::ByKey {
            doc_id,
            schema_id: Some(schema_id),
        } => (
            "WHERE s.doc_id = ?1 AND s.schema_id = ?2".into(),
            vec![doc_id.clone().into(), schema_id.clone().into()],
        ),
        ViewQuery::ByKey {
            doc_id,
            schema_id: None,
        } => ("WHERE s.doc_id = ?1".into(), vec![doc_id.clone().into()]),
        ViewQuery::ByField {
            schema_id,
            field,
            value,
        } => (
            "JOIN field_index f
                ON f.doc_id = s.doc_id AND f.ext_id = s.ext_id AND f.schema_id = s.schema_id
             WHERE f.schema_id = ?1 AND f.field = ?2 AND f.value = ?3"
                .into(),
            vec![
                schema_id.clone().into(),
                field.clone().into(),
                serde_json::to_string(value)?.into(),
            ],
        ),
        ViewQuery::ByExtension { ext_id } => {
            ("WHERE s.ext_id = ?1".into(), vec![ext_id.clone().into()])
        }
        ViewQuery::Sourceless => ("WHERE s.source_doc IS NULL".into(), Vec::new()),
    };

    let sql = format!("{VIEW_SELECT} {clause} {VIEW_ORDER}");
    let mut rows = conn
        .query(&sql, libsql::params::Params::Positional(args))
        .await
        .map_err(db_err)?;

    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(view_row(&row)?);
    }
    Ok(results)
}

async fn dependents_once(conn: &Connection, keys: &[DepKey]) -> Result<Vec<DependentRow>> {
    refresh_once(conn).await?;

    let mut found: Vec<DependentRow> = Vec::new();
    for key in keys {
        let mut rows = conn
            .query(
                "SELECT DISTINCT s.doc_id, s.ext_id, s.schema_id,
                        s.source_doc, s.source_schema, s.source_rev
                 FROM dependencies dp
                 JOIN schema_index s
                   ON s.doc_id = dp.doc_id AND s.ext_id = dp.ext_id AND s.schema_id = dp.schema_id
                 WHERE dp.dep_doc = ?1 AND dp.dep_schema = ?2
                 ORDER BY s.doc_id, s.ext_id, s.schema_id",
                params![key.doc_id(), key.schema_id()],
            )
            .await
            .map_err(db_err)?;

        while let Some(row) = rows.next().await.map_err(db_err)? {
            let dependent = DependentRow {
                doc_id: col_text(&row, 0)?,
                ext_id: col_text(&row, 1)?,
                schema_id: col_text(&row, 2)?,
                source: source_from_columns(
                    col_opt_text(&row, 3)?,
                    col_opt_text(&row, 4)?,
                    col_opt_text(&row, 5)?,
                ),
            };
            if !found.contains(&dependent) {
                found.push(dependent);
            }
        }
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// DocStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl DocStore for LibsqlStore {
    async fn bulk_upsert(&self, writes: Vec<DocWrite>) -> Result<Vec<WriteOutcome>> {
        let conn = self.conn.lock().await;
        let outcomes = retry_transient!("bulk_upsert", bulk_upsert_once(&conn, &writes).await)?;
        debug!(
            docs = writes.len(),
            conflicts = outcomes
                .iter()
                .filter(|o| o.result == WriteResult::Conflict)
                .count(),
            "bulk upsert"
        );
        Ok(outcomes)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDocument>> {
        let conn = self.conn.lock().await;
        retry_transient!("get", get_once(&conn, id).await)
    }

    async fn get_at(&self, id: &str, rev: &str) -> Result<Option<StoredDocument>> {
        let doc = self.get(id).await?;
        Ok(doc.filter(|d| d.rev == rev))
    }

    async fn put_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<WriteResult> {
        let conn = self.conn.lock().await;
        retry_transient!(
            "put_attachment",
            put_attachment_once(&conn, id, rev, name, content_type, data).await
        )
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Attachment>> {
        let conn = self.conn.lock().await;
        retry_transient!("get_attachment", get_attachment_once(&conn, id, name).await)
    }

    async fn query(&self, query: &ViewQuery) -> Result<Vec<ViewRow>> {
        let conn = self.conn.lock().await;
        retry_transient!("query", query_once(&conn, query).await)
    }

    async fn dependents(&self, keys: &[DepKey]) -> Result<Vec<DependentRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        retry_transient!("dependents", dependents_once(&conn, keys).await)
    }

    async fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRow>> {
        let conn = self.conn.lock().await;
        retry_transient!("changes_since", changes_once(&conn, since, limit).await)
    }

    async fn current_seq(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        retry_transient!("current_seq", current_seq_once(&conn).await)
    }

    async fn refresh_views(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        retry_transient!("refresh_views", refresh_once(&conn).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemaflow_shared::SchemaEntry;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_store() -> LibsqlStore {
        let tmp = std::env::temp_dir().join(format!("sf_test_{}.db", Uuid::now_v7()));
        LibsqlStore::open(&tmp).await.expect("open test store")
    }

    fn entry(source: Option<SourceRef>, fields: Value, deps: Vec<DepKey>) -> SchemaEntry {
        SchemaEntry::new(source, fields.as_object().cloned().unwrap_or_default(), None, deps)
    }

    fn write(id: &str, rev: Option<&str>, body: Value) -> DocWrite {
        DocWrite {
            id: id.into(),
            expected_rev: rev.map(String::from),
            body,
            deleted: false,
        }
    }

    fn ok_rev(outcome: &WriteOutcome) -> String {
        match &outcome.result {
            WriteResult::Ok { rev } => rev.clone(),
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_creates_database() {
        let store = test_store().await;
        assert_eq!(store.current_seq().await.expect("seq"), 0);
    }

    #[tokio::test]
    async fn bulk_upsert_commits_around_conflicts() {
        let store = test_store().await;
        let first = store
            .bulk_upsert(vec![write("a", None, json!({"n": 1})), write("b", None, json!({"n": 1}))])
            .await
            .expect("first write");
        let rev_a = ok_rev(&first[0]);
        assert!(rev_a.starts_with("1-"));

        let second = store
            .bulk_upsert(vec![
                write("a", Some("1-stale"), json!({"n": 2})),
                write("b", Some(&ok_rev(&first[1])), json!({"n": 2})),
                write("c", None, json!({"n": 2})),
            ])
            .await
            .expect("second write");
        assert_eq!(second[0].result, WriteResult::Conflict);
        assert!(ok_rev(&second[1]).starts_with("2-"));
        assert!(ok_rev(&second[2]).starts_with("1-"));

        let a = store.get("a").await.expect("get").expect("exists");
        assert_eq!(a.body, json!({"n": 1}));
        assert_eq!(a.rev, rev_a);
    }

    #[tokio::test]
    async fn create_requires_no_rev() {
        let store = test_store().await;
        store
            .bulk_upsert(vec![write("a", None, json!({}))])
            .await
            .expect("create");
        let again = store
            .bulk_upsert(vec![write("a", None, json!({"x": 1}))])
            .await
            .expect("recreate");
        assert_eq!(again[0].result, WriteResult::Conflict);
    }

    #[tokio::test]
    async fn identical_write_keeps_revision_and_seq() {
        let store = test_store().await;
        let first = store
            .bulk_upsert(vec![write("a", None, json!({"n": 1}))])
            .await
            .expect("write");
        let rev = ok_rev(&first[0]);
        let seq = store.current_seq().await.expect("seq");

        let again = store
            .bulk_upsert(vec![write("a", Some(&rev), json!({"n": 1}))])
            .await
            .expect("rewrite");
        assert_eq!(ok_rev(&again[0]), rev);
        assert_eq!(store.current_seq().await.expect("seq"), seq);
    }

    #[tokio::test]
    async fn get_at_checks_revision() {
        let store = test_store().await;
        let out = store
            .bulk_upsert(vec![write("a", None, json!({}))])
            .await
            .expect("write");
        let rev = ok_rev(&out[0]);
        assert!(store.get_at("a", &rev).await.expect("get_at").is_some());
        assert!(store.get_at("a", "9-nope").await.expect("get_at").is_none());
    }

    #[tokio::test]
    async fn delete_hides_document_and_allows_recreate() {
        let store = test_store().await;
        let out = store
            .bulk_upsert(vec![write("a", None, json!({"n": 1}))])
            .await
            .expect("write");
        let rev = ok_rev(&out[0]);

        let deleted = store
            .bulk_upsert(vec![DocWrite {
                id: "a".into(),
                expected_rev: Some(rev),
                body: json!({}),
                deleted: true,
            }])
            .await
            .expect("delete");
        assert!(ok_rev(&deleted[0]).starts_with("2-"));
        assert!(store.get("a").await.expect("get").is_none());

        let changes = store.changes_since(0, 10).await.expect("changes");
        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);

        let recreated = store
            .bulk_upsert(vec![write("a", None, json!({"n": 3}))])
            .await
            .expect("recreate");
        assert!(ok_rev(&recreated[0]).starts_with("3-"));
    }

    #[tokio::test]
    async fn change_log_keeps_latest_per_document() {
        let store = test_store().await;
        let out = store
            .bulk_upsert(vec![write("a", None, json!({})), write("b", None, json!({}))])
            .await
            .expect("write");
        store
            .bulk_upsert(vec![write("a", Some(&ok_rev(&out[0])), json!({"n": 2}))])
            .await
            .expect("update");

        let changes = store.changes_since(0, 10).await.expect("changes");
        let ids: Vec<&str> = changes.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].seq, 3);
        assert_eq!(store.current_seq().await.expect("seq"), 3);
        assert!(store.changes_since(3, 10).await.expect("tail").is_empty());
    }

    #[tokio::test]
    async fn attachments_chain_revisions() {
        let store = test_store().await;
        let out = store
            .bulk_upsert(vec![write("a", None, json!({}))])
            .await
            .expect("write");
        let rev1 = ok_rev(&out[0]);

        let rev2 = match store
            .put_attachment("a", &rev1, "one", "text/plain", b"1")
            .await
            .expect("put one")
        {
            WriteResult::Ok { rev } => rev,
            other => panic!("unexpected {other:?}"),
        };
        assert!(rev2.starts_with("2-"));

        let stale = store
            .put_attachment("a", &rev1, "two", "text/plain", b"2")
            .await
            .expect("put stale");
        assert_eq!(stale, WriteResult::Conflict);

        let same = store
            .put_attachment("a", &rev2, "one", "text/plain", b"1")
            .await
            .expect("put same");
        assert_eq!(same, WriteResult::Ok { rev: rev2.clone() });

        let att = store
            .get_attachment("a", "one")
            .await
            .expect("get attachment")
            .expect("exists");
        assert_eq!(att.data, b"1".to_vec());

        let doc = store.get("a").await.expect("get").expect("exists");
        assert_eq!(doc.attachments.len(), 1);
        assert_eq!(doc.attachments[0].length, 1);
    }

    #[tokio::test]
    async fn views_index_schema_entries() {
        let store = test_store().await;
        let src = SourceRef::new("rk!msg!1", "rd.msg.rfc822", "r1");

        let mut msg1 = SchemaDocument::new(RdKey::new("msg", "1"));
        msg1.insert("raw", "rd.msg.rfc822", entry(None, json!({"subject": "hi"}), vec![]));
        msg1.insert(
            "conv",
            "rd.msg.conversation",
            entry(Some(src.clone()), json!({"conversation_id": "c1"}), vec![]),
        );
        let mut msg2 = SchemaDocument::new(RdKey::new("msg", "2"));
        msg2.insert(
            "conv",
            "rd.msg.conversation",
            entry(None, json!({"conversation_id": "c1"}), vec![]),
        );

        store
            .bulk_upsert(vec![
                write("rk!msg!1", None, msg1.to_value().expect("body")),
                write("rk!msg!2", None, msg2.to_value().expect("body")),
                write("ckpt", None, json!({"rd_key": ["ext", "q"], "seq": 1})),
            ])
            .await
            .expect("write");

        let by_field = store
            .query(&ViewQuery::ByField {
                schema_id: "rd.msg.conversation".into(),
                field: "conversation_id".into(),
                value: json!("c1"),
            })
            .await
            .expect("by field");
        let ids: Vec<&str> = by_field.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["rk!msg!1", "rk!msg!2"]);

        let by_source = store
            .query(&ViewQuery::BySource {
                ext_id: "conv".into(),
                doc_id: "rk!msg!1".into(),
                schema_id: "rd.msg.rfc822".into(),
            })
            .await
            .expect("by source");
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].source.as_ref(), Some(&src));
        assert_eq!(by_source[0].fields["conversation_id"], json!("c1"));

        let sourceless = store.query(&ViewQuery::Sourceless).await.expect("sourceless");
        assert_eq!(sourceless.len(), 2);

        let by_key = store
            .query(&ViewQuery::ByKey {
                doc_id: "rk!msg!1".into(),
                schema_id: None,
            })
            .await
            .expect("by key");
        assert_eq!(by_key.len(), 2);
    }

    #[tokio::test]
    async fn views_follow_deletes() {
        let store = test_store().await;
        let mut doc = SchemaDocument::new(RdKey::new("msg", "1"));
        doc.insert("e", "s", entry(None, json!({}), vec![]));
        let out = store
            .bulk_upsert(vec![write("d", None, doc.to_value().expect("body"))])
            .await
            .expect("write");
        assert_eq!(
            store
                .query(&ViewQuery::BySchema { schema_id: "s".into() })
                .await
                .expect("query")
                .len(),
            1
        );

        store
            .bulk_upsert(vec![DocWrite {
                id: "d".into(),
                expected_rev: Some(ok_rev(&out[0])),
                body: json!({}),
                deleted: true,
            }])
            .await
            .expect("delete");
        assert!(
            store
                .query(&ViewQuery::BySchema { schema_id: "s".into() })
                .await
                .expect("query")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn dependents_resolve_sources() {
        let store = test_store().await;
        let src = SourceRef::new("rk!msg!1", "rd.msg.conversation", "r1");
        let mut summary = SchemaDocument::new(RdKey::new("conv", "c1"));
        summary.insert(
            "summary",
            "rd.conv.summary",
            entry(
                Some(src.clone()),
                json!({}),
                vec![DepKey("rk!msg!2".into(), "rd.msg.conversation".into())],
            ),
        );
        store
            .bulk_upsert(vec![write("rk!conv!c1", None, summary.to_value().expect("body"))])
            .await
            .expect("write");

        let rows = store
            .dependents(&[DepKey("rk!msg!2".into(), "rd.msg.conversation".into())])
            .await
            .expect("dependents");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ext_id, "summary");
        assert_eq!(rows[0].source.as_ref(), Some(&src));

        assert!(
            store
                .dependents(&[DepKey("rk!msg!3".into(), "rd.msg.conversation".into())])
                .await
                .expect("none")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn refresh_views_reports_seq() {
        let store = test_store().await;
        store
            .bulk_upsert(vec![write("a", None, json!({})), write("b", None, json!({}))])
            .await
            .expect("write");
        assert_eq!(store.refresh_views().await.expect("refresh"), 2);
        assert_eq!(store.refresh_views().await.expect("refresh again"), 2);
    }

    #[test]
    fn busy_errors_are_transient() {
        assert!(classify("database is locked".into()).is_transient());
        assert!(classify("SQLITE_BUSY: cannot commit".into()).is_transient());
        assert!(!classify("no such table: documents".into()).is_transient());
    }
}
