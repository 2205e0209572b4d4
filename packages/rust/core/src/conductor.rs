//! Sync Conductor boundary.
//!
//! Protocol clients live outside the pipeline. They hand raw documents in
//! through [`SyncConductor::ingest`] and register outgoing delivery as an
//! ordinary queue through [`SyncConductor::register_outgoing`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use schemaflow_shared::{ItemRef, RawDocument, Result, SchemaItem, SourceRef};

use crate::model::{DocModel, SourceDocument};
use crate::pipeline::Pipeline;
use crate::processor::{ProcessOutcome, QueueProcessor};

/// Schema recording the delivery of an outgoing document.
pub const OUTGOING_SENT_SCHEMA: &str = "rd.msg.outgoing.sent";

/// Value of `outgoing_state` marking a document as ready to send.
pub const OUTGOING_READY: &str = "outgoing";

/// Delivers outgoing documents over some protocol.
#[async_trait]
pub trait OutgoingSender: Send + Sync {
    /// Send one document. Returned fields are recorded with the delivery.
    async fn send(&self, doc: &SourceDocument) -> Result<Map<String, Value>>;
}

/// Queue that hands ready documents of one schema to a sender.
pub struct OutgoingProcessor {
    id: String,
    sources: Vec<String>,
    sender: Arc<dyn OutgoingSender>,
    single_flight: Mutex<()>,
}

impl OutgoingProcessor {
    pub fn new(schema_id: &str, sender: Arc<dyn OutgoingSender>) -> Self {
        Self {
            id: format!("rd.outgoing.{schema_id}"),
            sources: vec![schema_id.to_string()],
            sender,
            single_flight: Mutex::new(()),
        }
    }
}

#[async_trait]
impl QueueProcessor for OutgoingProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_schemas(&self) -> &[String] {
        &self.sources
    }

    #[instrument(skip_all, fields(queue = %self.id, src = %src))]
    async fn process(
        &self,
        model: &DocModel,
        src: &SourceRef,
        force: bool,
    ) -> Result<ProcessOutcome> {
        let Some(doc) = model.open_source(src).await? else {
            return Ok(ProcessOutcome::Unchanged);
        };
        if doc.field_str("outgoing_state") != Some(OUTGOING_READY) {
            return Ok(ProcessOutcome::Unchanged);
        }

        if !force {
            let priors = model.prior_outputs(&self.id, src).await?;
            let attempted = priors.iter().any(|p| p.source.as_ref() == Some(src));
            let sent = priors
                .iter()
                .any(|p| p.fields.get("sent_state").and_then(Value::as_str) == Some("sent"));
            if attempted || sent {
                debug!("already delivered");
                return Ok(ProcessOutcome::Unchanged);
            }
        }

        let _guard = self.single_flight.lock().await;
        let mut fields = match self.sender.send(&doc).await {
            Ok(mut fields) => {
                info!(doc_id = %doc.doc_id, "outgoing document sent");
                fields.insert("sent_state".into(), Value::from("sent"));
                fields
            }
            Err(e) => {
                warn!(doc_id = %doc.doc_id, error = %e, "outgoing delivery failed");
                let mut fields = Map::new();
                fields.insert("sent_state".into(), Value::from("error"));
                fields.insert("error".into(), Value::from(e.to_string()));
                fields
            }
        };
        fields.insert("sent_at".into(), Value::from(Utc::now().to_rfc3339()));

        let item = SchemaItem::new(doc.rd_key.clone(), OUTGOING_SENT_SCHEMA, &self.id, fields)
            .with_source(src.clone());
        Ok(ProcessOutcome::Items {
            items: vec![item],
            must_save_now: true,
        })
    }
}

/// Entry points for protocol collaborators.
pub struct SyncConductor {
    model: Arc<DocModel>,
}

impl SyncConductor {
    pub fn new(model: Arc<DocModel>) -> Self {
        Self { model }
    }

    /// Write raw documents fetched by a protocol client.
    #[instrument(skip_all, fields(count = raws.len()))]
    pub async fn ingest(&self, raws: Vec<RawDocument>) -> Result<Vec<ItemRef>> {
        let refs = self.model.create_raw_documents(raws).await?;
        info!(written = refs.len(), "raw documents ingested");
        Ok(refs)
    }

    /// Deliver documents of `schema_id` marked ready through `sender`.
    pub fn register_outgoing(
        &self,
        pipeline: &mut Pipeline,
        schema_id: &str,
        sender: Arc<dyn OutgoingSender>,
    ) -> Result<()> {
        pipeline.add_processor(Arc::new(OutgoingProcessor::new(schema_id, sender)))
    }
}
