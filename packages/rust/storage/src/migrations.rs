//! SQL migration definitions for the schemaflow document store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents, attachments, change log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Revisioned JSON documents
CREATE TABLE IF NOT EXISTS documents (
    id          TEXT PRIMARY KEY,
    rev         TEXT NOT NULL,
    generation  INTEGER NOT NULL,
    body        TEXT NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    created_seq INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Binary payloads stored beside documents
CREATE TABLE IF NOT EXISTS attachments (
    doc_id       TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    data         BLOB NOT NULL,
    PRIMARY KEY (doc_id, name)
);

-- Change log: one row per document at its latest sequence
CREATE TABLE IF NOT EXISTS changes (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id     TEXT NOT NULL UNIQUE,
    rev        TEXT NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0,
    schemas    TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Materialized views: schema, field and dependency indexes",
            sql: r#"
-- One row per (document, extension, schema) entry
CREATE TABLE IF NOT EXISTS schema_index (
    doc_id        TEXT NOT NULL,
    ext_id        TEXT NOT NULL,
    schema_id     TEXT NOT NULL,
    rd_key        TEXT NOT NULL,
    source_doc    TEXT,
    source_schema TEXT,
    source_rev    TEXT,
    entry_rev     TEXT NOT NULL,
    confidence    REAL,
    fields        TEXT NOT NULL,
    deps          TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (doc_id, ext_id, schema_id)
);

CREATE INDEX IF NOT EXISTS idx_schema_index_schema ON schema_index(schema_id);
CREATE INDEX IF NOT EXISTS idx_schema_index_source ON schema_index(ext_id, source_doc, source_schema);
CREATE INDEX IF NOT EXISTS idx_schema_index_ext ON schema_index(ext_id);

-- Top-level scalar field values for key lookups
CREATE TABLE IF NOT EXISTS field_index (
    doc_id    TEXT NOT NULL,
    ext_id    TEXT NOT NULL,
    schema_id TEXT NOT NULL,
    field     TEXT NOT NULL,
    value     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_field_index_lookup ON field_index(schema_id, field, value);
CREATE INDEX IF NOT EXISTS idx_field_index_doc ON field_index(doc_id);

-- "(dep_doc, dep_schema) is depended upon by (doc_id, ext_id, schema_id)"
CREATE TABLE IF NOT EXISTS dependencies (
    doc_id     TEXT NOT NULL,
    ext_id     TEXT NOT NULL,
    schema_id  TEXT NOT NULL,
    dep_doc    TEXT NOT NULL,
    dep_schema TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dependencies_dep ON dependencies(dep_doc, dep_schema);
CREATE INDEX IF NOT EXISTS idx_dependencies_doc ON dependencies(doc_id);

-- Change sequence the views have caught up to
CREATE TABLE IF NOT EXISTS view_state (
    id  INTEGER PRIMARY KEY CHECK (id = 1),
    seq INTEGER NOT NULL
);

INSERT OR IGNORE INTO view_state (id, seq) VALUES (1, 0);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
