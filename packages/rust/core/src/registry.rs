//! Extension registry.
//!
//! Extensions are described in config ([`ExtensionDescriptor`]) and bound to
//! compiled-in handlers through a [`HandlerCatalog`]. The registry is built
//! once and passed explicitly into the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use schemaflow_shared::{ExtensionCategory, ExtensionDescriptor, PipelineError, Result};

use crate::model::SourceDocument;
use crate::runtime::ExtensionContext;

/// Per-source entry point of an extension.
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    async fn handle(&self, source: &SourceDocument, ctx: &mut ExtensionContext<'_>) -> Result<()>;
}

/// Batch entry point consuming tokens deferred with `process_later`.
#[async_trait]
pub trait LaterHandler: Send + Sync {
    async fn handle_later(&self, tokens: Vec<Value>, ctx: &mut ExtensionContext<'_>) -> Result<()>;
}

/// A loaded extension.
pub struct Extension {
    pub id: String,
    pub source_schemas: Vec<String>,
    /// Schemas the extension declares it writes.
    pub emits: Vec<String>,
    pub category: ExtensionCategory,
    pub confidence: Option<f64>,
    pub uses_dependencies: bool,
    pub handler: Arc<dyn ExtensionHandler>,
    pub later: Option<Arc<dyn LaterHandler>>,
    invocation: Mutex<()>,
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("source_schemas", &self.source_schemas)
            .field("emits", &self.emits)
            .finish_non_exhaustive()
    }
}

impl Extension {
    pub fn new(
        id: impl Into<String>,
        category: ExtensionCategory,
        source_schemas: Vec<String>,
        handler: Arc<dyn ExtensionHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            source_schemas,
            emits: Vec::new(),
            category,
            confidence: None,
            uses_dependencies: false,
            handler,
            later: None,
            invocation: Mutex::new(()),
        }
    }

    pub fn with_emits(mut self, emits: Vec<String>) -> Self {
        self.emits = emits;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_dependencies(mut self) -> Self {
        self.uses_dependencies = true;
        self
    }

    pub fn with_later(mut self, later: Arc<dyn LaterHandler>) -> Self {
        self.later = Some(later);
        self
    }

    /// Hold this while the handler runs; one invocation at a time.
    pub(crate) async fn invocation(&self) -> MutexGuard<'_, ()> {
        self.invocation.lock().await
    }

    /// Reject configurations that cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.source_schemas.is_empty() {
            return Err(PipelineError::config(format!(
                "extension {} declares no source schemas",
                self.id
            )));
        }
        if self.category == ExtensionCategory::Provider {
            if let Some(schema) = self.emits.iter().find(|s| self.source_schemas.contains(s)) {
                return Err(PipelineError::config(format!(
                    "provider {} depends on its own output schema {schema}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler catalog
// ---------------------------------------------------------------------------

/// Compiled-in handlers addressable by name from config.
#[derive(Default, Clone)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn ExtensionHandler>>,
    later: HashMap<String, Arc<dyn LaterHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ExtensionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_later(&mut self, name: impl Into<String>, handler: Arc<dyn LaterHandler>) {
        self.later.insert(name.into(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ExtensionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn later(&self, name: &str) -> Option<Arc<dyn LaterHandler>> {
        self.later.get(name).cloned()
    }

    /// Bind a descriptor to its handlers.
    pub fn resolve(&self, descriptor: &ExtensionDescriptor) -> Result<Extension> {
        let handler = self.handler(&descriptor.handler).ok_or_else(|| {
            PipelineError::config(format!(
                "extension {}: unknown handler {}",
                descriptor.id, descriptor.handler
            ))
        })?;

        let mut ext = Extension::new(
            &descriptor.id,
            descriptor.category,
            descriptor.source_schemas.clone(),
            handler,
        )
        .with_emits(descriptor.emits.clone());
        ext.confidence = descriptor.confidence;
        ext.uses_dependencies = descriptor.uses_dependencies;

        if let Some(name) = &descriptor.later_handler {
            let later = self.later(name).ok_or_else(|| {
                PipelineError::config(format!(
                    "extension {}: unknown later handler {name}",
                    descriptor.id
                ))
            })?;
            ext = ext.with_later(later);
        }
        Ok(ext)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// An extension that failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub id: String,
    pub reason: String,
}

/// Outcome of loading descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<Rejection>,
    pub disabled: Vec<String>,
}

/// The set of extensions a pipeline runs.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load descriptors, excluding any that fail validation.
    pub fn load(
        descriptors: &[ExtensionDescriptor],
        catalog: &HandlerCatalog,
    ) -> (Self, LoadReport) {
        let mut registry = Self::new();
        let mut report = LoadReport::default();

        for descriptor in descriptors {
            if !descriptor.enabled {
                report.disabled.push(descriptor.id.clone());
                continue;
            }
            let loaded = catalog
                .resolve(descriptor)
                .and_then(|ext| registry.add(ext));
            match loaded {
                Ok(()) => report.loaded.push(descriptor.id.clone()),
                Err(e) => {
                    warn!(ext_id = %descriptor.id, error = %e, "extension rejected");
                    report.rejected.push(Rejection {
                        id: descriptor.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            disabled = report.disabled.len(),
            "extensions loaded"
        );
        (registry, report)
    }

    /// Register one extension after validating it.
    pub fn add(&mut self, ext: Extension) -> Result<()> {
        ext.validate()?;
        if self.get(&ext.id).is_some() {
            return Err(PipelineError::config(format!("duplicate extension id {}", ext.id)));
        }
        self.extensions.push(Arc::new(ext));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Extension>> {
        self.extensions.iter().find(|e| e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Extension>> {
        self.extensions.iter()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
