//! Shared types, error model, and configuration for schemaflow.
//!
//! This crate is the foundation depended on by all other schemaflow crates.
//! It provides:
//! - [`PipelineError`], the unified error type
//! - Domain types ([`RdKey`], [`SchemaItem`], [`SourceRef`], [`QueueState`], [`RawDocument`])
//! - The stored document layout ([`SchemaDocument`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], [`FeedOptions`], config loading)

pub mod config;
pub mod document;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ExtensionDescriptor, FeedOptions, FeedSection, PipelineConfig, PipelineSection,
    StoreConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use document::{SchemaDocument, SchemaEntry, content_rev};
pub use error::{Conflict, PipelineError, Result};
pub use types::{
    Attachment, DepKey, ERROR_SCHEMA, ExtensionCategory, ItemRef, QUEUE_KEY_KIND, QueueState,
    RAW_EXT_ID, RawDocument, RdKey, SchemaItem, SourceRef, short_hash,
};
