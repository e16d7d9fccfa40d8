//! Append-only ingest event log and per-consumer processing log.

pub mod ingest_log;
pub mod memory;
pub mod process_log;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::Value;

pub use ingest_log::SqlEventLog;
pub use memory::{MemoryEventLog, MemoryProcessLog};
pub use process_log::SqlProcessLog;

/// Payload key holding the staged object path.
pub const STORAGE_LOCATION: &str = "storage_location";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewFile,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewFile => "new_file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "new_file" => Some(EventType::NewFile),
            _ => None,
        }
    }
}

/// One row of `data_ingest_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: i64,
    pub ingest_ts: DateTime<Utc>,
    pub producer: String,
    pub event_type: EventType,
    pub source_system: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn storage_location(&self) -> Option<&str> {
        self.payload
            .get(STORAGE_LOCATION)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Event before an id has been allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub ingest_ts: DateTime<Utc>,
    pub producer: String,
    pub event_type: EventType,
    pub source_system: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub(crate) fn into_event(self, event_id: i64) -> Event {
        Event {
            event_id,
            ingest_ts: self.ingest_ts,
            producer: self.producer,
            event_type: self.event_type,
            source_system: self.source_system,
            content_hash: self.content_hash,
            payload: self.payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(i64),
    /// Same producer already logged this content hash.
    Existing(i64),
}

/// Audit row written for every event a consumer handles.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub consumer_id: String,
    pub event_id: i64,
    pub previous_hwm: i64,
    pub processed_at: DateTime<Utc>,
    pub detail: String,
    pub rows_written: u64,
    pub rows_deleted: u64,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn find(&self, producer: &str, content_hash: &str) -> Result<Option<i64>>;

    /// Allocate `max(event_id) + 1` (0 on an empty log) and append, unless the
    /// producer already logged this hash. Check and insert are one atomic step.
    async fn append_if_absent(&self, event: &NewEvent) -> Result<AppendOutcome>;

    /// Highest event id, or -1 on an empty log.
    async fn latest_event_id(&self) -> Result<i64>;

    async fn get(&self, event_id: i64) -> Result<Option<Event>>;
}

#[async_trait]
pub trait ProcessLog: Send + Sync {
    async fn watermark(&self, consumer_id: &str) -> Result<Option<i64>>;

    /// Store `event_id` only if it is above the current value. Returns the
    /// value stored after the call.
    async fn raise_watermark(&self, consumer_id: &str, event_id: i64) -> Result<i64>;

    async fn record(&self, record: &ProcessRecord) -> Result<()>;
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("bad timestamp `{}`: {}", s, e)))
}

pub(crate) fn cell_i64(row: &[Value], idx: usize, column: &str) -> Result<i64> {
    row.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Validation(format!("column `{}` is not an integer", column)))
}

pub(crate) fn cell_str<'a>(row: &'a [Value], idx: usize, column: &str) -> Result<&'a str> {
    row.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation(format!("column `{}` is not text", column)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_location_ignores_missing_and_empty() {
        let mut event = NewEvent {
            ingest_ts: Utc::now(),
            producer: "opl-ingest".into(),
            event_type: EventType::NewFile,
            source_system: "Openpowerlifting.org".into(),
            content_hash: "abc".into(),
            payload: json!({ "storage_location": "openpowerlifting/a.csv" }),
        }
        .into_event(3);
        assert_eq!(event.storage_location(), Some("openpowerlifting/a.csv"));

        event.payload = json!({ "storage_location": "" });
        assert_eq!(event.storage_location(), None);
        event.payload = json!({});
        assert_eq!(event.storage_location(), None);
    }

    #[test]
    fn timestamps_round_trip_at_micros() {
        let ts = parse_ts("2025-05-12T08:30:01.123456Z").unwrap();
        assert_eq!(format_ts(&ts), "2025-05-12T08:30:01.123456Z");
        assert!(parse_ts("yesterday").is_err());
        assert_eq!(EventType::parse(" NEW_FILE "), Some(EventType::NewFile));
    }
}
