//! Error types for schemaflow.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::SourceRef;

/// One item that could not be written because its target document moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Target document id.
    pub doc_id: String,
    /// Extension that contributed the item.
    pub ext_id: String,
    /// Schema of the item.
    pub schema_id: String,
    /// Source the item was derived from (`None` for raw input).
    pub source: Option<SourceRef>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.doc_id, self.ext_id, self.schema_id)
    }
}

/// Top-level error type for all schemaflow operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A store or network hiccup that is worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// One or more items collided with a newer revision.
    #[error("{} conflicting item(s): {}", conflicts.len(), join_conflicts(conflicts))]
    Conflict { conflicts: Vec<Conflict> },

    /// Conflicts persisted after the configured number of retries.
    #[error("conflicts persisted after {attempts} attempts: {}", join_conflicts(conflicts))]
    ConflictRetriesExhausted {
        attempts: u32,
        conflicts: Vec<Conflict>,
    },

    /// An extension handler failed.
    #[error("extension {ext_id} failed: {message}")]
    Extension { ext_id: String, message: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad document, malformed key, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A queue checkpoint could not be persisted.
    #[error("checkpoint for {queue} could not be saved: {message}")]
    Checkpoint { queue: String, message: String },

    /// Work was abandoned because a stop was requested.
    #[error("stopped")]
    Stopped,
}

fn join_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extension failure.
    pub fn extension(ext_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Extension {
            ext_id: ext_id.into(),
            message: msg.into(),
        }
    }

    /// Create a checkpoint persistence failure.
    pub fn checkpoint(queue: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Checkpoint {
            queue: queue.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
