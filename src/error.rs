//! Error taxonomy for the ingestion pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::query::QueryState;

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Fetch failed: connection error, timeout or non-2xx status.
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// Object storage unavailable or write/read failed.
    #[error("storage error at {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Managed query finished in FAILED or CANCELLED.
    #[error("query {query_id} {state}: {reason}")]
    QueryExecution {
        query_id: String,
        state: QueryState,
        reason: String,
    },

    /// Source data or pipeline state is malformed; retrying blindly won't help.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl Error {
    /// Whether re-invoking the whole run is expected to succeed eventually.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network { .. }
                | Error::Storage { .. }
                | Error::ObjectNotFound(_)
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    pub(crate) fn storage(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::Storage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn network(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_categories() {
        assert!(Error::network("http://x", "503").is_retryable());
        assert!(Error::storage("raw/a.csv", "disk full").is_retryable());
        assert!(!Error::Validation("no csv".into()).is_retryable());
        let failed = Error::QueryExecution {
            query_id: "q-1".into(),
            state: QueryState::Failed,
            reason: "syntax error".into(),
        };
        assert!(!failed.is_retryable());
        assert_eq!(failed.to_string(), "query q-1 FAILED: syntax error");
    }
}
