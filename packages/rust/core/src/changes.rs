//! Change Feed Reader.
//!
//! Turns a streamed change transport into bounded, restartable batches of
//! [`ChangeEvent`]s. Partial frames are buffered until a full line arrives,
//! blank heartbeat lines are skipped, the `{"last_seq":N}` sentinel means
//! "reconnect from N" and a connection reset is retried after a delay.
//!
//! With dependency expansion enabled, every batch also yields the source of
//! each entry that *read* one of the changed schemas, as a synthetic event
//! without a sequence number.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use schemaflow_shared::{DepKey, FeedOptions, PipelineError, Result};
use schemaflow_storage::{ChangeTransport, DocStore, FeedConnector, FeedRead, TransportError};

/// Consecutive resets tolerated before the batch fails.
const MAX_RESETS: u32 = 5;

/// One change worth looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub doc_id: String,
    /// Document revision at the change; `None` for synthetic events.
    pub rev: Option<String>,
    /// Schema ids present in the document (a hint for filtering).
    pub schemas: Vec<String>,
    /// Log position; `None` for synthetic events, which never move a checkpoint.
    pub seq: Option<u64>,
    pub deleted: bool,
}

impl ChangeEvent {
    fn synthetic(doc_id: String, schema_id: String) -> Self {
        Self {
            doc_id,
            rev: None,
            schemas: vec![schema_id],
            seq: None,
            deleted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Reassembles newline-terminated records from arbitrary chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line without its terminator, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[derive(Debug, PartialEq)]
enum FeedRecord {
    Change(ChangeEvent),
    Heartbeat,
    EndOfBatch(u64),
}

fn parse_record(line: &str) -> Result<FeedRecord> {
    if line.trim().is_empty() {
        return Ok(FeedRecord::Heartbeat);
    }
    let value: Value = serde_json::from_str(line)?;

    if let Some(last) = value.get("last_seq") {
        return Ok(FeedRecord::EndOfBatch(last.as_u64().unwrap_or(0)));
    }

    let (Some(seq), Some(id)) = (
        value.get("seq").and_then(Value::as_u64),
        value.get("id").and_then(Value::as_str),
    ) else {
        return Err(PipelineError::validation(format!("unrecognised feed record: {line}")));
    };

    let rev = value
        .get("changes")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("rev"))
        .and_then(Value::as_str)
        .map(String::from);
    let schemas = value
        .get("schemas")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();

    Ok(FeedRecord::Change(ChangeEvent {
        doc_id: id.to_string(),
        rev,
        schemas,
        seq: Some(seq),
        deleted: value.get("deleted").and_then(Value::as_bool).unwrap_or(false),
    }))
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Batch-bounded, restartable reader over a change feed.
pub struct ChangesReader {
    connector: Arc<dyn FeedConnector>,
    store: Arc<dyn DocStore>,
    options: FeedOptions,
    cancel: CancellationToken,
    transport: Option<Box<dyn ChangeTransport>>,
    framer: LineFramer,
    current_seq: u64,
    include_deps: bool,
    exhausted: bool,
}

impl ChangesReader {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        store: Arc<dyn DocStore>,
        options: FeedOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            store,
            options,
            cancel,
            transport: None,
            framer: LineFramer::default(),
            current_seq: 0,
            include_deps: false,
            exhausted: false,
        }
    }

    /// Position the reader after `start_seq`. Returns whether the log holds
    /// anything newer.
    pub async fn initialize(&mut self, start_seq: u64, include_deps: bool) -> Result<bool> {
        self.disconnect();
        self.current_seq = start_seq;
        self.include_deps = include_deps;
        self.exhausted = false;
        Ok(self.store.current_seq().await? > start_seq)
    }

    /// Highest sequence handed out so far.
    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    /// Whether the last batch stopped because input ran out rather than
    /// because it was full.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    fn disconnect(&mut self) {
        self.transport = None;
        self.framer.clear();
    }

    /// Read up to `batch_size` events.
    ///
    /// Without `wait` the batch ends when the feed has caught up. With `wait`
    /// the reader parks until at least one event arrives, reconnecting at each
    /// end-of-batch sentinel; the wait is abandoned when the reader's cancel
    /// token fires.
    pub async fn make_iter(&mut self, batch_size: usize, wait: bool) -> Result<Vec<ChangeEvent>> {
        let mut events: Vec<ChangeEvent> = Vec::new();
        let mut resets = 0u32;
        self.exhausted = false;

        'batch: while events.len() < batch_size {
            while let Some(line) = self.framer.next_line() {
                match parse_record(&line)? {
                    FeedRecord::Heartbeat => {}
                    FeedRecord::Change(event) => {
                        if let Some(seq) = event.seq {
                            self.current_seq = self.current_seq.max(seq);
                        }
                        events.push(event);
                        if events.len() >= batch_size {
                            break 'batch;
                        }
                    }
                    FeedRecord::EndOfBatch(last_seq) => {
                        self.current_seq = self.current_seq.max(last_seq);
                        self.disconnect();
                        if !wait || !events.is_empty() {
                            self.exhausted = true;
                            break 'batch;
                        }
                        debug!(seq = self.current_seq, "end of feed batch, reconnecting");
                        continue 'batch;
                    }
                }
            }

            if self.transport.is_none() {
                self.transport = Some(self.connector.connect(self.current_seq, wait).await?);
            }
            let Some(transport) = self.transport.as_mut() else {
                continue;
            };

            let block = wait && events.is_empty();
            let read = tokio::select! {
                () = self.cancel.cancelled() => return Err(PipelineError::Stopped),
                read = transport.read(block) => read,
            };

            match read {
                Ok(FeedRead::Data(bytes)) => {
                    resets = 0;
                    self.framer.push(&bytes);
                }
                Ok(FeedRead::WouldBlock) => {
                    self.exhausted = true;
                    break;
                }
                Ok(FeedRead::Closed) => {
                    self.disconnect();
                    if !wait || !events.is_empty() {
                        self.exhausted = true;
                        break;
                    }
                }
                Err(TransportError::Reset(reason)) => {
                    resets += 1;
                    self.disconnect();
                    if resets > MAX_RESETS {
                        return Err(PipelineError::Transient(format!(
                            "change feed reset {resets} times: {reason}"
                        )));
                    }
                    warn!(
                        seq = self.current_seq,
                        resets,
                        %reason,
                        "change feed reset, reconnecting"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(PipelineError::Stopped),
                        () = tokio::time::sleep(self.options.reconnect_delay) => {}
                    }
                }
                Err(TransportError::Fatal(e)) => return Err(e),
            }
        }

        if self.include_deps && !events.is_empty() {
            let extra = self.expand_dependencies(&events).await?;
            events.extend(extra);
        }

        Ok(events)
    }

    /// Sources of entries that read any schema changed in `events`.
    async fn expand_dependencies(&self, events: &[ChangeEvent]) -> Result<Vec<ChangeEvent>> {
        let keys: Vec<DepKey> = events
            .iter()
            .filter(|e| e.seq.is_some())
            .flat_map(|e| {
                e.schemas
                    .iter()
                    .map(|s| DepKey(e.doc_id.clone(), s.clone()))
            })
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut synthetic: Vec<ChangeEvent> = Vec::new();
        for row in self.store.dependents(&keys).await? {
            let Some(source) = row.source else { continue };
            let already = events
                .iter()
                .chain(synthetic.iter())
                .any(|e| e.doc_id == source.doc_id && e.schemas.contains(&source.schema_id));
            if !already {
                synthetic.push(ChangeEvent::synthetic(source.doc_id, source.schema_id));
            }
        }

        if !synthetic.is_empty() {
            debug!(count = synthetic.len(), "expanded dependency events");
        }
        Ok(synthetic)
    }
}
