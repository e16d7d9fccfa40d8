use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::history::{Event, EventLog, ProcessRecord};
use crate::reconcile::{reconcile, ReconcileContext, TargetTable};
use crate::source;
use crate::storage::ObjectStore;
use crate::tracker::WatermarkTracker;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub previous_hwm: i64,
    pub watermark: i64,
    pub events_seen: u64,
    pub files_loaded: u64,
    pub events_skipped: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
}

impl ProcessSummary {
    pub fn no_new_events(&self) -> bool {
        self.events_seen == 0
    }

    pub fn describe(&self) -> String {
        if self.no_new_events() {
            return format!("watermark {} is at the latest event", self.watermark);
        }
        format!(
            "events {}..={}: {} loaded, {} skipped, {} rows written, {} rows marked deleted",
            self.previous_hwm + 1,
            self.watermark,
            self.files_loaded,
            self.events_skipped,
            self.rows_written,
            self.rows_deleted
        )
    }
}

enum Disposition {
    Load(String),
    Skip(String),
}

fn classify(event: Option<&Event>, source_system: &str) -> Disposition {
    match event {
        None => Disposition::Skip("event missing from log".into()),
        Some(e) if e.source_system != source_system => {
            Disposition::Skip(format!("source system `{}`", e.source_system))
        }
        Some(e) => match e.storage_location() {
            Some(location) => Disposition::Load(location.to_string()),
            None => Disposition::Skip("no storage location in payload".into()),
        },
    }
}

/// Process every event after the consumer's watermark, oldest first. Each
/// event is reconciled (or recorded as skipped), then the watermark moves to
/// it. Only the newest data file in the range drives soft deletes.
#[instrument(skip_all, fields(consumer = %ctx.consumer_id))]
pub async fn run_process(
    ctx: &ReconcileContext,
    events: &dyn EventLog,
    tracker: &WatermarkTracker,
    store: &dyn ObjectStore,
    target: &dyn TargetTable,
    cancel: &CancellationToken,
) -> Result<ProcessSummary> {
    let watermark = tracker.get_watermark(&ctx.consumer_id).await?;
    let latest = events.latest_event_id().await?;
    if latest < 0 {
        return Err(Error::Validation("event log is empty".into()));
    }

    let mut summary = ProcessSummary {
        previous_hwm: watermark,
        watermark,
        ..Default::default()
    };
    if watermark >= latest {
        info!(watermark, latest, "no new events");
        return Ok(summary);
    }

    let mut pending = Vec::new();
    for event_id in (watermark + 1)..=latest {
        let event = events.get(event_id).await?;
        pending.push((event_id, classify(event.as_ref(), &ctx.source_system)));
    }
    let last_data = pending
        .iter()
        .rev()
        .find(|(_, d)| matches!(d, Disposition::Load(_)))
        .map(|(id, _)| *id);
    info!(watermark, latest, ?last_data, "processing events");

    for (event_id, disposition) in pending {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "processing stopped before event {}",
                event_id
            )));
        }

        let (detail, rows_written, rows_deleted) = match disposition {
            Disposition::Load(location) => {
                let bytes = store.get(&location).await?;
                let rows = source::decode(&location, bytes)?;
                let result = reconcile(rows, target, ctx, Some(event_id) == last_data).await?;
                summary.files_loaded += 1;
                (format!("loaded {}", location), result.rows_written, result.rows_deleted)
            }
            Disposition::Skip(reason) => {
                warn!(event_id, %reason, "skipping event");
                summary.events_skipped += 1;
                (format!("skipped: {}", reason), 0, 0)
            }
        };

        tracker
            .record(&ProcessRecord {
                consumer_id: ctx.consumer_id.clone(),
                event_id,
                previous_hwm: summary.watermark,
                processed_at: Utc::now(),
                detail,
                rows_written,
                rows_deleted,
            })
            .await?;
        tracker.advance(&ctx.consumer_id, event_id).await?;

        summary.watermark = event_id;
        summary.events_seen += 1;
        summary.rows_written += rows_written;
        summary.rows_deleted += rows_deleted;
    }

    info!(
        watermark = summary.watermark,
        written = summary.rows_written,
        deleted = summary.rows_deleted,
        "processing finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EventType, MemoryEventLog, MemoryProcessLog, NewEvent};
    use crate::reconcile::{MemoryTargetTable, DEFAULT_SAMPLE_ROWS};
    use crate::schema::Naming;
    use crate::storage::{LocalObjectStore, Overwrite};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        store: LocalObjectStore,
        events: MemoryEventLog,
        process_log: Arc<MemoryProcessLog>,
        tracker: WatermarkTracker,
        target: MemoryTargetTable,
        ctx: ReconcileContext,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let process_log = Arc::new(MemoryProcessLog::new());
            Self {
                store: LocalObjectStore::new(dir.path()),
                _dir: dir,
                events: MemoryEventLog::new(),
                tracker: WatermarkTracker::new(process_log.clone()),
                process_log,
                target: MemoryTargetTable::new(),
                ctx: ReconcileContext {
                    consumer_id: "glue".into(),
                    source_system: "Openpowerlifting.org".into(),
                    source_table: "raw.openpowerlifting".into(),
                    naming: Naming::new(BTreeMap::new()),
                    sample_rows: DEFAULT_SAMPLE_ROWS,
                },
            }
        }

        async fn add(&self, hash: &str, system: &str, payload: serde_json::Value) {
            self.events
                .append_if_absent(&NewEvent {
                    ingest_ts: Utc::now(),
                    producer: "opl-ingest".into(),
                    event_type: EventType::NewFile,
                    source_system: system.into(),
                    content_hash: hash.into(),
                    payload,
                })
                .await
                .unwrap();
        }

        async fn add_file(&self, hash: &str, csv: &str) {
            let key = format!("opl/{hash}.csv");
            self.store
                .put(&key, csv.as_bytes(), Overwrite::Replace)
                .await
                .unwrap();
            self.add(hash, "Openpowerlifting.org", json!({ "storage_location": key }))
                .await;
        }

        async fn run(&self, cancel: &CancellationToken) -> Result<ProcessSummary> {
            run_process(
                &self.ctx,
                &self.events,
                &self.tracker,
                &self.store,
                &self.target,
                cancel,
            )
            .await
        }
    }

    #[tokio::test]
    async fn empty_log_is_an_error() {
        let h = Harness::new();
        let err = h.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("empty")));
    }

    #[tokio::test]
    async fn catches_up_and_only_last_file_deletes() {
        let h = Harness::new();
        h.add_file("f1", "Name\nA\nB\n").await;
        h.add_file("f2", "Name\nB\nC\n").await;

        let s = h.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(s.events_seen, 2);
        assert_eq!(s.watermark, 1);
        assert_eq!(s.rows_written, 3);
        // A is missing from the newest file.
        assert_eq!(s.rows_deleted, 1);
        assert_eq!(h.tracker.get_watermark("glue").await.unwrap(), 1);

        let again = h.run(&CancellationToken::new()).await.unwrap();
        assert!(again.no_new_events());
        assert_eq!(h.process_log.records().len(), 2);
    }

    #[tokio::test]
    async fn markers_and_foreign_events_are_skipped_but_advance() {
        let h = Harness::new();
        h.add("marker", "Openpowerlifting.org", json!("invalid")).await;
        h.add("other", "Elsewhere", json!({ "storage_location": "x.csv" }))
            .await;
        h.add_file("f1", "Name\nA\n").await;

        let s = h.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(s.events_skipped, 2);
        assert_eq!(s.files_loaded, 1);
        assert_eq!(s.watermark, 2);

        let records = h.process_log.records();
        let details: Vec<_> = records.iter().map(|r| r.detail.as_str()).collect();
        assert_eq!(
            details,
            vec![
                "skipped: no storage location in payload",
                "skipped: source system `Elsewhere`",
                "loaded opl/f1.csv",
            ]
        );
        assert_eq!(
            records.iter().map(|r| r.previous_hwm).collect::<Vec<_>>(),
            vec![-1, 0, 1]
        );
    }

    #[tokio::test]
    async fn failed_reconcile_keeps_watermark() {
        let h = Harness::new();
        h.add_file("f1", "Name\nA\n").await;
        h.target.set_fail_commits(true);

        assert!(h.run(&CancellationToken::new()).await.is_err());
        assert_eq!(h.tracker.get_watermark("glue").await.unwrap(), -1);
        assert!(h.process_log.records().is_empty());

        h.target.set_fail_commits(false);
        let s = h.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(s.rows_written, 1);
    }

    #[tokio::test]
    async fn missing_staged_object_is_retryable_and_keeps_watermark() {
        let h = Harness::new();
        h.add("gone", "Openpowerlifting.org", json!({ "storage_location": "opl/gone.csv" }))
            .await;
        let err = h.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
        assert!(err.is_retryable());
        assert_eq!(h.tracker.get_watermark("glue").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_events() {
        let h = Harness::new();
        h.add_file("f1", "Name\nA\n").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.run(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(h.tracker.get_watermark("glue").await.unwrap(), -1);
    }
}
