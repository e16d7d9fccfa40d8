use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use tracing::{debug, info};

use super::{ident, QueryEngine, QueryId, QueryRequest, QueryState, QueryStatus, ResultPage, Statement, Value};
use crate::error::{Error, Result};

enum Execution {
    Running,
    Succeeded { columns: Vec<String>, rows: Vec<Vec<Value>> },
    Failed(String),
}

/// Local stand-in for a managed SQL engine. Every named database is an
/// attached SQLite schema, so `metadata.data_ingest_log` resolves the way it
/// would on the managed service. Submissions run on the blocking pool; until
/// they finish their status reads RUNNING.
pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
    databases: Vec<String>,
    executions: Arc<Mutex<HashMap<String, Execution>>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SqliteEngine {
    /// One `<name>.sqlite` file per database under `dir`.
    pub fn open(dir: impl AsRef<Path>, databases: &[&str]) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let locations = databases
            .iter()
            .map(|db| (db.to_string(), dir.join(format!("{}.sqlite", db)).display().to_string()))
            .collect::<Vec<_>>();
        info!(dir = %dir.display(), ?databases, "opening sqlite warehouse");
        Self::attach_all(&locations)
    }

    /// Private in-memory database per name; nothing survives the process.
    pub fn in_memory(databases: &[&str]) -> Result<Self> {
        let locations = databases
            .iter()
            .map(|db| (db.to_string(), ":memory:".to_string()))
            .collect::<Vec<_>>();
        Self::attach_all(&locations)
    }

    fn attach_all(locations: &[(String, String)]) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(":memory:", e))?;
        for (name, location) in locations {
            ident(name)?;
            if name.eq_ignore_ascii_case("main") || name.eq_ignore_ascii_case("temp") {
                return Err(Error::Config(format!("`{}` is a reserved database name", name)));
            }
            conn.execute(&format!("ATTACH DATABASE ?1 AS {}", name), params![location])
                .map_err(|e| Error::storage(location.clone(), e))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            databases: locations.iter().map(|(n, _)| n.clone()).collect(),
            executions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn run_statement(
    conn: &Connection,
    statement: &Statement,
) -> rusqlite::Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(statement.params.iter().map(to_sql)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_sql(row.get::<_, SqlValue>(i)?));
        }
        out.push(values);
    }
    Ok((columns, out))
}

fn execute(
    conn: &mut Connection,
    statements: &[Statement],
) -> rusqlite::Result<(Vec<String>, Vec<Vec<Value>>)> {
    let tx = conn.transaction()?;
    let mut last = (Vec::new(), Vec::new());
    for statement in statements {
        last = run_statement(&tx, statement)?;
    }
    tx.commit()?;
    Ok(last)
}

#[async_trait]
impl QueryEngine for SqliteEngine {
    async fn submit(&self, request: QueryRequest) -> Result<QueryId> {
        if !self.databases.iter().any(|d| d == &request.database) {
            return Err(Error::Validation(format!(
                "unknown database `{}`",
                request.database
            )));
        }
        if request.statements.is_empty() {
            return Err(Error::Validation("empty query request".into()));
        }

        let id = QueryId(format!("q-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        lock(&self.executions).insert(id.0.clone(), Execution::Running);

        let conn = Arc::clone(&self.conn);
        let executions = Arc::clone(&self.executions);
        let key = id.0.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = {
                let mut conn = lock(&conn);
                execute(&mut conn, &request.statements)
            };
            let execution = match outcome {
                Ok((columns, rows)) => Execution::Succeeded { columns, rows },
                Err(e) => Execution::Failed(e.to_string()),
            };
            // A released id stays gone.
            if let Some(slot) = lock(&executions).get_mut(&key) {
                *slot = execution;
            }
        });

        debug!(query_id = %id, "submitted to sqlite");
        Ok(id)
    }

    /// A FAILED status is reported once; the entry is dropped with it.
    async fn status(&self, id: &QueryId) -> Result<QueryStatus> {
        let mut executions = lock(&self.executions);
        if let Some(Execution::Failed(reason)) = executions.get(&id.0) {
            let reason = reason.clone();
            executions.remove(&id.0);
            return Ok(QueryStatus {
                state: QueryState::Failed,
                reason: Some(reason),
            });
        }
        match executions.get(&id.0) {
            Some(Execution::Running) => Ok(QueryStatus {
                state: QueryState::Running,
                reason: None,
            }),
            Some(Execution::Succeeded { .. }) => Ok(QueryStatus {
                state: QueryState::Succeeded,
                reason: None,
            }),
            Some(Execution::Failed(_)) | None => {
                Err(Error::Validation(format!("unknown query id {}", id)))
            }
        }
    }

    /// Results are released once the last page has been handed out.
    async fn results(
        &self,
        id: &QueryId,
        next_token: Option<&str>,
        page_size: usize,
    ) -> Result<ResultPage> {
        let offset = match next_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| Error::Validation(format!("bad page token `{}`", t)))?,
            None => 0,
        };

        let mut executions = lock(&self.executions);
        let page = match executions.get(&id.0) {
            Some(Execution::Succeeded { columns, rows }) => {
                let end = offset.saturating_add(page_size).min(rows.len());
                let start = offset.min(end);
                ResultPage {
                    columns: columns.clone(),
                    rows: rows[start..end].to_vec(),
                    next_token: (end < rows.len()).then(|| end.to_string()),
                }
            }
            Some(Execution::Running) => {
                return Err(Error::Validation(format!("query {} is still running", id)))
            }
            Some(Execution::Failed(reason)) => {
                return Err(Error::QueryExecution {
                    query_id: id.to_string(),
                    state: QueryState::Failed,
                    reason: reason.clone(),
                })
            }
            None => return Err(Error::Validation(format!("unknown query id {}", id))),
        };
        if page.next_token.is_none() {
            executions.remove(&id.0);
        }
        Ok(page)
    }

    async fn release(&self, id: &QueryId) -> Result<()> {
        if lock(&self.executions).remove(&id.0).is_some() {
            debug!(query_id = %id, "released");
        }
        Ok(())
    }
}
