//! Streamed change-log transport.
//!
//! The store's change log is served as newline-delimited JSON, the way a
//! continuous changes feed arrives over a slow connection:
//!
//! ```text
//! {"seq":7,"id":"rk!msg!..","changes":[{"rev":"2-.."}],"schemas":["rd.msg.body"]}
//!                                       <- heartbeat (blank line)
//! {"last_seq":7}                        <- end of batch, reconnect from here
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use schemaflow_shared::{FeedOptions, PipelineError, Result};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::{ChangeRow, DocStore};

/// Rows fetched from the store per poll.
const PAGE_SIZE: usize = 500;

/// One read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRead {
    /// Raw bytes; may end mid-record.
    Data(Vec<u8>),
    /// Nothing available without waiting.
    WouldBlock,
    /// The connection has ended.
    Closed,
}

/// Failure reading a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection dropped; reconnecting is expected to work.
    #[error("connection reset: {0}")]
    Reset(String),

    #[error(transparent)]
    Fatal(#[from] PipelineError),
}

/// A byte stream carrying change records.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Read the next chunk. With `wait`, park until data, a heartbeat or the
    /// end of the feed; without it, return [`FeedRead::WouldBlock`] when idle.
    async fn read(&mut self, wait: bool) -> std::result::Result<FeedRead, TransportError>;
}

/// Opens transports positioned after a sequence.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Connect after `since`. A `continuous` feed stays open while idle;
    /// otherwise it ends with the sentinel once caught up.
    async fn connect(&self, since: u64, continuous: bool) -> Result<Box<dyn ChangeTransport>>;
}

/// Serves a [`DocStore`] change log by polling it.
pub struct PollingFeed {
    store: Arc<dyn DocStore>,
    options: FeedOptions,
    since: u64,
    continuous: bool,
    last_activity: Instant,
    last_heartbeat: Instant,
    done: bool,
}

impl PollingFeed {
    pub fn new(
        store: Arc<dyn DocStore>,
        options: FeedOptions,
        since: u64,
        continuous: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            store,
            options,
            since,
            continuous,
            last_activity: now,
            last_heartbeat: now,
            done: false,
        }
    }

    fn encode(rows: &[ChangeRow]) -> Vec<u8> {
        let mut out = Vec::new();
        for row in rows {
            let mut record = json!({
                "seq": row.seq,
                "id": row.doc_id,
                "changes": [{"rev": row.rev}],
                "schemas": row.schemas,
            });
            if row.deleted {
                record["deleted"] = json!(true);
            }
            out.extend_from_slice(record.to_string().as_bytes());
            out.push(b'\n');
        }
        out
    }

    fn sentinel(&mut self) -> FeedRead {
        self.done = true;
        let line = format!("{}\n", json!({ "last_seq": self.since }));
        FeedRead::Data(line.into_bytes())
    }
}

#[async_trait]
impl ChangeTransport for PollingFeed {
    async fn read(&mut self, wait: bool) -> std::result::Result<FeedRead, TransportError> {
        loop {
            if self.done {
                return Ok(FeedRead::Closed);
            }

            let rows = self.store.changes_since(self.since, PAGE_SIZE).await?;
            if let Some(last) = rows.last() {
                self.since = last.seq;
                let now = Instant::now();
                self.last_activity = now;
                self.last_heartbeat = now;
                return Ok(FeedRead::Data(Self::encode(&rows)));
            }

            if !self.continuous {
                return Ok(self.sentinel());
            }
            if !wait {
                return Ok(FeedRead::WouldBlock);
            }

            let now = Instant::now();
            if now.duration_since(self.last_activity) >= self.options.idle_timeout {
                debug!(since = self.since, "feed idle, ending batch");
                return Ok(self.sentinel());
            }
            if now.duration_since(self.last_heartbeat) >= self.options.heartbeat {
                self.last_heartbeat = now;
                return Ok(FeedRead::Data(b"\n".to_vec()));
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }
    }
}

/// Connects [`PollingFeed`]s to a shared store.
#[derive(Clone)]
pub struct PollingFeedConnector {
    store: Arc<dyn DocStore>,
    options: FeedOptions,
}

impl PollingFeedConnector {
    pub fn new(store: Arc<dyn DocStore>, options: FeedOptions) -> Self {
        Self { store, options }
    }
}

#[async_trait]
impl FeedConnector for PollingFeedConnector {
    async fn connect(&self, since: u64, continuous: bool) -> Result<Box<dyn ChangeTransport>> {
        Ok(Box::new(PollingFeed::new(
            Arc::clone(&self.store),
            self.options.clone(),
            since,
            continuous,
        )))
    }
}
