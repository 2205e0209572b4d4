//! Extension pipeline for schemaflow.
//!
//! Extensions turn schemas into other schemas. Each runs as a queue that
//! follows the store's change log from its own checkpoint, and writes its
//! output through a conflict-aware batch protocol so that concurrent queues
//! never clobber each other.
//!
//! - [`registry`]: extension descriptors, handlers, and validation
//! - [`runtime`]: the context a handler emits through
//! - [`processor`]: staleness rules per extension category
//! - [`queue`]: batching, flushing, and conflict redo for one queue
//! - [`manager`]: concurrent queues, stability, graceful shutdown
//! - [`pipeline`]: the facade plus operator sweeps
//! - [`conductor`]: ingestion and outgoing delivery for protocol clients
//! - [`builtin`]: RFC 822 message extensions

pub mod builtin;
pub mod changes;
pub mod conductor;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod runtime;

pub use builtin::{builtin_descriptors, parse_rfc822, raw_from_rfc822};
pub use conductor::{OutgoingSender, SyncConductor};
pub use manager::{
    PipelineStatus, ProgressReporter, QueueStatus, QueueView, RunSummary, SilentProgress,
    StablePolicy, StatefulQueueManager,
};
pub use model::{DocModel, SourceDocument};
pub use pipeline::{Pipeline, RetryReport, UnprocessReport};
pub use processor::{ExtensionProcessor, ProcessOutcome, QueueProcessor};
pub use registry::{
    Extension, ExtensionHandler, ExtensionRegistry, HandlerCatalog, LaterHandler, LoadReport,
};
pub use runtime::ExtensionContext;
