use async_trait::async_trait;
use tracing::debug;

use super::{cell_i64, cell_str, format_ts, parse_ts, AppendOutcome, Event, EventLog, EventType, NewEvent};
use crate::error::{Error, Result};
use crate::query::{qualified, QueryRequest, SqlSession, Statement};

pub const INGEST_LOG_TABLE: &str = "data_ingest_log";

/// `data_ingest_log` on the query engine.
pub struct SqlEventLog {
    session: SqlSession,
    database: String,
    table: String,
}

impl SqlEventLog {
    pub fn new(session: SqlSession, database: &str) -> Result<Self> {
        Ok(Self {
            session,
            database: database.to_string(),
            table: qualified(database, INGEST_LOG_TABLE)?,
        })
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let create = Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                event_id INTEGER PRIMARY KEY,
                ingest_ts TEXT NOT NULL,
                event_producer TEXT NOT NULL,
                event_type TEXT NOT NULL,
                source_system TEXT NOT NULL,
                file_md5_hash TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            self.table
        ));
        let index = Statement::new(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (event_producer, file_md5_hash)",
            qualified(&self.database, "ix_data_ingest_log_hash")?,
            INGEST_LOG_TABLE
        ));
        self.session
            .run(QueryRequest::transaction(&self.database, vec![create, index]))
            .await?;
        Ok(())
    }

    fn request(&self, statement: Statement) -> QueryRequest {
        QueryRequest::single(&self.database, statement)
    }
}

#[async_trait]
impl EventLog for SqlEventLog {
    async fn find(&self, producer: &str, content_hash: &str) -> Result<Option<i64>> {
        let stmt = Statement::new(format!(
            "SELECT min(event_id) FROM {} WHERE event_producer = ? AND file_md5_hash = ?",
            self.table
        ))
        .bind(producer)
        .bind(content_hash);
        let rs = self.session.run(self.request(stmt)).await?;
        Ok(rs.scalar().and_then(|v| v.as_i64()))
    }

    async fn append_if_absent(&self, event: &NewEvent) -> Result<AppendOutcome> {
        let stmt = Statement::new(format!(
            "INSERT INTO {t} (event_id, ingest_ts, event_producer, event_type, source_system, file_md5_hash, payload)
             SELECT next_id, ?, ?, ?, ?, ?, ?
             FROM (SELECT coalesce(max(event_id) + 1, 0) AS next_id FROM {t})
             WHERE NOT EXISTS (
                SELECT 1 FROM {t} WHERE event_producer = ? AND file_md5_hash = ?
             )
             RETURNING event_id",
            t = self.table
        ))
        .bind(format_ts(&event.ingest_ts))
        .bind(event.producer.as_str())
        .bind(event.event_type.as_str())
        .bind(event.source_system.as_str())
        .bind(event.content_hash.as_str())
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.producer.as_str())
        .bind(event.content_hash.as_str());

        let rs = self.session.run(self.request(stmt)).await?;
        if let Some(id) = rs.scalar().and_then(|v| v.as_i64()) {
            debug!(event_id = id, hash = %event.content_hash, "event appended");
            return Ok(AppendOutcome::Appended(id));
        }
        match self.find(&event.producer, &event.content_hash).await? {
            Some(id) => Ok(AppendOutcome::Existing(id)),
            None => Err(Error::Validation(format!(
                "insert for hash {} returned no id and no existing event",
                event.content_hash
            ))),
        }
    }

    async fn latest_event_id(&self) -> Result<i64> {
        let stmt = Statement::new(format!("SELECT coalesce(max(event_id), -1) FROM {}", self.table));
        let rs = self.session.run(self.request(stmt)).await?;
        Ok(rs.scalar().and_then(|v| v.as_i64()).unwrap_or(-1))
    }

    async fn get(&self, event_id: i64) -> Result<Option<Event>> {
        let stmt = Statement::new(format!(
            "SELECT event_id, ingest_ts, event_producer, event_type, source_system, file_md5_hash, payload
             FROM {} WHERE event_id = ?",
            self.table
        ))
        .bind(event_id);
        let rs = self.session.run(self.request(stmt)).await?;
        let Some(row) = rs.rows.first() else {
            return Ok(None);
        };

        let event_type = cell_str(row, 3, "event_type")?;
        let raw_payload = cell_str(row, 6, "payload")?;
        Ok(Some(Event {
            event_id: cell_i64(row, 0, "event_id")?,
            ingest_ts: parse_ts(cell_str(row, 1, "ingest_ts")?)?,
            producer: cell_str(row, 2, "event_producer")?.to_string(),
            event_type: EventType::parse(event_type)
                .ok_or_else(|| Error::Validation(format!("unknown event type `{}`", event_type)))?,
            source_system: cell_str(row, 4, "source_system")?.to_string(),
            content_hash: cell_str(row, 5, "file_md5_hash")?.to_string(),
            // Non-JSON payloads are kept verbatim; such events have no location.
            payload: serde_json::from_str(raw_payload)
                .unwrap_or_else(|_| serde_json::Value::String(raw_payload.to_string())),
        }))
    }
}
