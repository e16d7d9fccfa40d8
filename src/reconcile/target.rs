use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::history::format_ts;
use crate::query::{ident, qualified, QueryRequest, SqlSession, Statement, Value};
use crate::schema::Column;

/// Audit columns appended to every target row, in table order.
pub const AUDIT_COLUMNS: [&str; 6] = [
    "row_hash",
    "source_system",
    "source_table",
    "inserted_at",
    "consumer_id",
    "is_deleted",
];

/// Bound-parameter budget per statement; SQLite allows 32766.
const MAX_PARAMS: usize = 30_000;

/// Audit values shared by every row written in one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Audit {
    pub source_system: String,
    pub source_table: String,
    pub inserted_at: DateTime<Utc>,
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub row_hash: String,
    pub values: Vec<Option<String>>,
}

/// Everything one reconcile writes. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct TableChanges {
    /// Create the table first (first load only).
    pub create: Option<Vec<Column>>,
    pub columns: Vec<String>,
    pub inserts: Vec<NewRow>,
    pub audit: Audit,
    /// Fingerprints to mark `is_deleted`.
    pub deletes: Vec<String>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.inserts.is_empty() && self.deletes.is_empty()
    }
}

#[async_trait]
pub trait TargetTable: Send + Sync {
    fn name(&self) -> &str;

    /// Semantic columns in table order, or `None` when the table does not exist.
    async fn columns(&self) -> Result<Option<Vec<String>>>;

    /// Every stored fingerprint with its `is_deleted` flag.
    async fn fingerprints(&self) -> Result<HashMap<String, bool>>;

    async fn commit(&self, changes: &TableChanges) -> Result<()>;
}

/// Target table on the query engine.
pub struct SqlTargetTable {
    session: SqlSession,
    database: String,
    table: String,
    name: String,
}

impl SqlTargetTable {
    pub fn new(session: SqlSession, database: &str, table: &str) -> Result<Self> {
        Ok(Self {
            session,
            database: database.to_string(),
            table: table.to_string(),
            name: qualified(database, table)?,
        })
    }

    fn create_statement(&self, columns: &[Column]) -> Result<Statement> {
        let mut defs = Vec::with_capacity(columns.len() + AUDIT_COLUMNS.len());
        for c in columns {
            defs.push(format!("{} {}", ident(&c.name)?, c.ty.sql_type()));
        }
        defs.push("row_hash TEXT NOT NULL PRIMARY KEY".into());
        defs.push("source_system TEXT NOT NULL".into());
        defs.push("source_table TEXT NOT NULL".into());
        defs.push("inserted_at TEXT NOT NULL".into());
        defs.push("consumer_id TEXT NOT NULL".into());
        defs.push("is_deleted INTEGER NOT NULL DEFAULT 0".into());
        Ok(Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            defs.join(",\n    ")
        )))
    }

    fn insert_statements(&self, changes: &TableChanges) -> Result<Vec<Statement>> {
        let mut names = changes
            .columns
            .iter()
            .map(|c| ident(c))
            .collect::<Result<Vec<_>>>()?;
        names.extend(AUDIT_COLUMNS.iter().map(|c| c.to_string()));

        let width = names.len();
        let placeholder = format!("({})", vec!["?"; width].join(", "));
        let rows_per_statement = (MAX_PARAMS / width).max(1);
        let inserted_at = format_ts(&changes.audit.inserted_at);

        let mut out = Vec::new();
        for chunk in changes.inserts.chunks(rows_per_statement) {
            let mut stmt = Statement::new(format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.name,
                names.join(", "),
                vec![placeholder.as_str(); chunk.len()].join(", ")
            ));
            for row in chunk {
                if row.values.len() != changes.columns.len() {
                    return Err(Error::Validation(format!(
                        "row {} has {} values for {} columns",
                        row.row_hash,
                        row.values.len(),
                        changes.columns.len()
                    )));
                }
                stmt = stmt
                    .bind_all(row.values.iter().cloned())
                    .bind(row.row_hash.as_str())
                    .bind(changes.audit.source_system.as_str())
                    .bind(changes.audit.source_table.as_str())
                    .bind(inserted_at.as_str())
                    .bind(changes.audit.consumer_id.as_str())
                    .bind(false);
            }
            out.push(stmt);
        }
        Ok(out)
    }

    fn delete_statements(&self, deletes: &[String]) -> Vec<Statement> {
        deletes
            .chunks(MAX_PARAMS)
            .map(|chunk| {
                Statement::new(format!(
                    "UPDATE {} SET is_deleted = 1 WHERE is_deleted = 0 AND row_hash IN ({})",
                    self.name,
                    vec!["?"; chunk.len()].join(", ")
                ))
                .bind_all(chunk.iter().map(String::as_str))
            })
            .collect()
    }
}

#[async_trait]
impl TargetTable for SqlTargetTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn columns(&self) -> Result<Option<Vec<String>>> {
        let stmt = Statement::new("SELECT name FROM pragma_table_info(?, ?) ORDER BY cid")
            .bind(self.table.as_str())
            .bind(self.database.as_str());
        let rs = self
            .session
            .run(QueryRequest::single(&self.database, stmt))
            .await?;
        if rs.rows.is_empty() {
            return Ok(None);
        }
        let columns = rs
            .rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str))
            .filter(|name| !AUDIT_COLUMNS.contains(name))
            .map(str::to_string)
            .collect();
        Ok(Some(columns))
    }

    async fn fingerprints(&self) -> Result<HashMap<String, bool>> {
        if self.columns().await?.is_none() {
            return Ok(HashMap::new());
        }
        let stmt = Statement::new(format!("SELECT row_hash, is_deleted FROM {}", self.name));
        let rs = self
            .session
            .run(QueryRequest::single(&self.database, stmt))
            .await?;
        rs.rows
            .iter()
            .map(|row| {
                let hash = row
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Validation("row_hash is not text".into()))?;
                let deleted = row.get(1).and_then(Value::as_bool).unwrap_or(false);
                Ok((hash.to_string(), deleted))
            })
            .collect()
    }

    async fn commit(&self, changes: &TableChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut statements = Vec::new();
        if let Some(columns) = &changes.create {
            statements.push(self.create_statement(columns)?);
        }
        statements.extend(self.insert_statements(changes)?);
        statements.extend(self.delete_statements(&changes.deletes));

        self.session
            .run(QueryRequest::transaction(&self.database, statements))
            .await?;
        Ok(())
    }
}

/// A stored row of the in-memory table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_hash: String,
    pub values: Vec<Option<String>>,
    pub audit: Audit,
    pub is_deleted: bool,
}

#[derive(Default)]
struct MemoryState {
    columns: Option<Vec<String>>,
    rows: Vec<StoredRow>,
}

/// In-memory target for tests. `fail_commits` simulates an engine outage.
#[derive(Default)]
pub struct MemoryTargetTable {
    state: Mutex<MemoryState>,
    fail_commits: AtomicBool,
}

impl MemoryTargetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .rows
            .clone()
    }
}

#[async_trait]
impl TargetTable for MemoryTargetTable {
    fn name(&self) -> &str {
        "memory"
    }

    async fn columns(&self) -> Result<Option<Vec<String>>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .columns
            .clone())
    }

    async fn fingerprints(&self) -> Result<HashMap<String, bool>> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(state
            .rows
            .iter()
            .map(|r| (r.row_hash.clone(), r.is_deleted))
            .collect())
    }

    async fn commit(&self, changes: &TableChanges) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::QueryExecution {
                query_id: "memory".into(),
                state: crate::query::QueryState::Failed,
                reason: "simulated failure".into(),
            });
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(columns) = &changes.create {
            if state.columns.is_none() {
                state.columns = Some(columns.iter().map(|c| c.name.clone()).collect());
            }
        }
        if state.columns.is_none() {
            return Err(Error::Validation("target table does not exist".into()));
        }
        if state
            .rows
            .iter()
            .any(|r| changes.inserts.iter().any(|n| n.row_hash == r.row_hash))
        {
            return Err(Error::Validation("duplicate row_hash".into()));
        }
        for row in &changes.inserts {
            state.rows.push(StoredRow {
                row_hash: row.row_hash.clone(),
                values: row.values.clone(),
                audit: changes.audit.clone(),
                is_deleted: false,
            });
        }
        for row in state.rows.iter_mut() {
            if changes.deletes.contains(&row.row_hash) {
                row.is_deleted = true;
            }
        }
        Ok(())
    }
}
