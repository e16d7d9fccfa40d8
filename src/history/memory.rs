//! In-process logs for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AppendOutcome, Event, EventLog, NewEvent, ProcessLog, ProcessRecord};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn find(&self, producer: &str, content_hash: &str) -> Result<Option<i64>> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        Ok(events
            .iter()
            .find(|e| e.producer == producer && e.content_hash == content_hash)
            .map(|e| e.event_id))
    }

    async fn append_if_absent(&self, event: &NewEvent) -> Result<AppendOutcome> {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = events
            .iter()
            .find(|e| e.producer == event.producer && e.content_hash == event.content_hash)
        {
            return Ok(AppendOutcome::Existing(existing.event_id));
        }
        let next = events.iter().map(|e| e.event_id).max().map_or(0, |m| m + 1);
        events.push(event.clone().into_event(next));
        Ok(AppendOutcome::Appended(next))
    }

    async fn latest_event_id(&self) -> Result<i64> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        Ok(events.iter().map(|e| e.event_id).max().unwrap_or(-1))
    }

    async fn get(&self, event_id: i64) -> Result<Option<Event>> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        Ok(events.iter().find(|e| e.event_id == event_id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryProcessLog {
    marks: Mutex<HashMap<String, i64>>,
    records: Mutex<Vec<ProcessRecord>>,
}

impl MemoryProcessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl ProcessLog for MemoryProcessLog {
    async fn watermark(&self, consumer_id: &str) -> Result<Option<i64>> {
        let marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());
        Ok(marks.get(consumer_id).copied())
    }

    async fn raise_watermark(&self, consumer_id: &str, event_id: i64) -> Result<i64> {
        let mut marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());
        let mark = marks.entry(consumer_id.to_string()).or_insert(event_id);
        if event_id > *mark {
            *mark = event_id;
        }
        Ok(*mark)
    }

    async fn record(&self, record: &ProcessRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }
}
