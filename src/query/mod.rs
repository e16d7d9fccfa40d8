//! Managed query engine capability: submit SQL with bound parameters, poll
//! its state, page through results.

pub mod poll;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
pub use poll::PollPolicy;
pub use sqlite::SqliteEngine;

/// A bound parameter or a result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// SQL text plus positional (`?`) parameters. Values are never spliced into
/// the text.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn bind_all<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.params.extend(values.into_iter().map(Into::into));
        self
    }
}

/// One submission. More than one statement runs inside a single transaction;
/// the result set is the last statement's.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub database: String,
    pub statements: Vec<Statement>,
}

impl QueryRequest {
    pub fn single(database: impl Into<String>, statement: Statement) -> Self {
        Self {
            database: database.into(),
            statements: vec![statement],
        }
    }

    pub fn transaction(database: impl Into<String>, statements: Vec<Statement>) -> Self {
        Self {
            database: database.into(),
            statements,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Running => "RUNNING",
            QueryState::Succeeded => "SUCCEEDED",
            QueryState::Failed => "FAILED",
            QueryState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Running)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryId(pub String);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPage {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub next_token: Option<String>,
}

/// All pages of a finished query, concatenated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// First cell of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn submit(&self, request: QueryRequest) -> Result<QueryId>;
    async fn status(&self, id: &QueryId) -> Result<QueryStatus>;
    async fn results(
        &self,
        id: &QueryId,
        next_token: Option<&str>,
        page_size: usize,
    ) -> Result<ResultPage>;

    /// The caller stopped waiting on `id` and will not read its results.
    async fn release(&self, _id: &QueryId) -> Result<()> {
        Ok(())
    }
}

/// Engine handle + poll policy + cancellation, cloned into every SQL-backed
/// store.
#[derive(Clone)]
pub struct SqlSession {
    pub engine: Arc<dyn QueryEngine>,
    pub policy: PollPolicy,
    pub cancel: CancellationToken,
}

impl SqlSession {
    pub fn new(engine: Arc<dyn QueryEngine>, policy: PollPolicy, cancel: CancellationToken) -> Self {
        Self {
            engine,
            policy,
            cancel,
        }
    }

    pub async fn run(&self, request: QueryRequest) -> Result<ResultSet> {
        poll::run_query(self.engine.as_ref(), request, &self.policy, &self.cancel).await
    }
}

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Validate and double-quote an identifier taken from configuration or a file
/// header.
pub fn ident(name: &str) -> Result<String> {
    if !IDENT_RE.is_match(name) {
        return Err(Error::Validation(format!("invalid SQL identifier `{}`", name)));
    }
    Ok(format!("\"{}\"", name))
}

/// `"database"."table"`
pub fn qualified(database: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", ident(database)?, ident(table)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(ident("best_3_squat_kg").unwrap(), "\"best_3_squat_kg\"");
        assert_eq!(
            qualified("metadata", "data_ingest_log").unwrap(),
            "\"metadata\".\"data_ingest_log\""
        );
        assert!(ident("name; drop table x").is_err());
        assert!(ident("3col").is_err());
        assert!(ident("").is_err());
    }

    #[test]
    fn statement_binds_in_order() {
        let stmt = Statement::new("select ? , ?")
            .bind("abc")
            .bind(Some(7i64))
            .bind_all([true, false]);
        assert_eq!(
            stmt.params,
            vec![
                Value::Text("abc".into()),
                Value::Int(7),
                Value::Bool(true),
                Value::Bool(false)
            ]
        );
        let none: Option<String> = None;
        assert_eq!(Value::from(none), Value::Null);
    }
}
