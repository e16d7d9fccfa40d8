//! Content ingestion gate: one event per genuinely new file per producer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::error::Result;
use crate::history::{AppendOutcome, EventLog, EventType, NewEvent};

/// Hex MD5 of the raw downloaded bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub already_ingested: bool,
    pub event_id: i64,
}

#[derive(Clone)]
pub struct IngestionGate {
    log: Arc<dyn EventLog>,
}

impl IngestionGate {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Event id of an earlier ingest of this content by `producer`.
    pub async fn is_ingested(&self, content_hash: &str, producer: &str) -> Result<Option<i64>> {
        self.log.find(producer, content_hash).await
    }

    /// Record a file unless the producer has already ingested this content.
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        content_hash: &str,
        producer: &str,
        source_system: &str,
        payload: serde_json::Value,
    ) -> Result<Submission> {
        if let Some(event_id) = self.log.find(producer, content_hash).await? {
            info!(event_id, "content already ingested");
            return Ok(Submission {
                already_ingested: true,
                event_id,
            });
        }

        let event = NewEvent {
            ingest_ts: Utc::now(),
            producer: producer.to_string(),
            event_type: EventType::NewFile,
            source_system: source_system.to_string(),
            content_hash: content_hash.to_string(),
            payload,
        };
        // The append re-checks the hash, so a concurrent submit of the same
        // content still yields a single event.
        let submission = match self.log.append_if_absent(&event).await? {
            AppendOutcome::Appended(event_id) => {
                info!(event_id, "event recorded");
                Submission {
                    already_ingested: false,
                    event_id,
                }
            }
            AppendOutcome::Existing(event_id) => Submission {
                already_ingested: true,
                event_id,
            },
        };
        Ok(submission)
    }
}
