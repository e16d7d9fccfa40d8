use async_trait::async_trait;

use super::{format_ts, ProcessLog, ProcessRecord};
use crate::error::Result;
use crate::query::{qualified, QueryRequest, SqlSession, Statement};

pub const PROCESS_LOG_TABLE: &str = "data_process_log";
pub const PROCESS_EVENTS_TABLE: &str = "data_process_events";

/// `data_process_log` (one watermark row per consumer) and
/// `data_process_events` (one audit row per handled event).
pub struct SqlProcessLog {
    session: SqlSession,
    database: String,
    marks: String,
    records: String,
}

impl SqlProcessLog {
    pub fn new(session: SqlSession, database: &str) -> Result<Self> {
        Ok(Self {
            session,
            database: database.to_string(),
            marks: qualified(database, PROCESS_LOG_TABLE)?,
            records: qualified(database, PROCESS_EVENTS_TABLE)?,
        })
    }

    pub async fn ensure_tables(&self) -> Result<()> {
        let marks = Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                consumer_id TEXT PRIMARY KEY,
                current_event_hwm INTEGER NOT NULL
            )",
            self.marks
        ));
        let records = Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                consumer_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                previous_hwm INTEGER NOT NULL,
                processed_at TEXT NOT NULL,
                detail TEXT NOT NULL,
                rows_written INTEGER NOT NULL,
                rows_deleted INTEGER NOT NULL
            )",
            self.records
        ));
        self.session
            .run(QueryRequest::transaction(&self.database, vec![marks, records]))
            .await?;
        Ok(())
    }

    /// Audit rows for one consumer, oldest first.
    pub async fn records(&self, consumer_id: &str) -> Result<Vec<(i64, String)>> {
        let stmt = Statement::new(format!(
            "SELECT event_id, detail FROM {} WHERE consumer_id = ? ORDER BY rowid",
            self.records
        ))
        .bind(consumer_id);
        let rs = self
            .session
            .run(QueryRequest::single(&self.database, stmt))
            .await?;
        rs.rows
            .iter()
            .map(|row| {
                Ok((
                    super::cell_i64(row, 0, "event_id")?,
                    super::cell_str(row, 1, "detail")?.to_string(),
                ))
            })
            .collect()
    }
}

#[async_trait]
impl ProcessLog for SqlProcessLog {
    async fn watermark(&self, consumer_id: &str) -> Result<Option<i64>> {
        let stmt = Statement::new(format!(
            "SELECT current_event_hwm FROM {} WHERE consumer_id = ?",
            self.marks
        ))
        .bind(consumer_id);
        let rs = self
            .session
            .run(QueryRequest::single(&self.database, stmt))
            .await?;
        Ok(rs.scalar().and_then(|v| v.as_i64()))
    }

    async fn raise_watermark(&self, consumer_id: &str, event_id: i64) -> Result<i64> {
        // The conflict clause only fires upward, so a stale writer cannot lower
        // the mark.
        let upsert = Statement::new(format!(
            "INSERT INTO {} AS hwm (consumer_id, current_event_hwm) VALUES (?, ?)
             ON CONFLICT (consumer_id) DO UPDATE
                SET current_event_hwm = excluded.current_event_hwm
                WHERE excluded.current_event_hwm > hwm.current_event_hwm",
            self.marks
        ))
        .bind(consumer_id)
        .bind(event_id);
        let read = Statement::new(format!(
            "SELECT current_event_hwm FROM {} WHERE consumer_id = ?",
            self.marks
        ))
        .bind(consumer_id);

        let rs = self
            .session
            .run(QueryRequest::transaction(&self.database, vec![upsert, read]))
            .await?;
        Ok(rs.scalar().and_then(|v| v.as_i64()).unwrap_or(event_id))
    }

    async fn record(&self, record: &ProcessRecord) -> Result<()> {
        let stmt = Statement::new(format!(
            "INSERT INTO {} (consumer_id, event_id, previous_hwm, processed_at, detail, rows_written, rows_deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.records
        ))
        .bind(record.consumer_id.as_str())
        .bind(record.event_id)
        .bind(record.previous_hwm)
        .bind(format_ts(&record.processed_at))
        .bind(record.detail.as_str())
        .bind(record.rows_written)
        .bind(record.rows_deleted);
        self.session
            .run(QueryRequest::single(&self.database, stmt))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{PollPolicy, SqliteEngine};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn log() -> SqlProcessLog {
        let engine = Arc::new(SqliteEngine::in_memory(&["metadata"]).unwrap());
        let session = SqlSession::new(engine, PollPolicy::default(), CancellationToken::new());
        let log = SqlProcessLog::new(session, "metadata").unwrap();
        log.ensure_tables().await.unwrap();
        log
    }

    #[tokio::test]
    async fn watermark_only_moves_up() {
        let log = log().await;
        assert_eq!(log.watermark("glue").await.unwrap(), None);

        assert_eq!(log.raise_watermark("glue", 3).await.unwrap(), 3);
        assert_eq!(log.raise_watermark("glue", 1).await.unwrap(), 3);
        assert_eq!(log.raise_watermark("glue", 3).await.unwrap(), 3);
        assert_eq!(log.raise_watermark("glue", 5).await.unwrap(), 5);
        assert_eq!(log.watermark("glue").await.unwrap(), Some(5));

        assert_eq!(log.watermark("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn records_are_appended_in_order() {
        let log = log().await;
        for (event_id, detail) in [(0, "loaded a.csv"), (1, "skipped: no storage location")] {
            log.record(&ProcessRecord {
                consumer_id: "glue".into(),
                event_id,
                previous_hwm: event_id - 1,
                processed_at: Utc::now(),
                detail: detail.into(),
                rows_written: 2,
                rows_deleted: 0,
            })
            .await
            .unwrap();
        }
        let records = log.records("glue").await.unwrap();
        assert_eq!(
            records,
            vec![
                (0, "loaded a.csv".to_string()),
                (1, "skipped: no storage location".to_string())
            ]
        );
    }
}
