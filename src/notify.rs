//! Run notifications. Publishing never fails a run.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    NoNewData,
    NoNewEvents,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::NoNewData => "NO NEW DATA",
            RunStatus::NoNewEvents => "NO NEW EVENTS",
            RunStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `"<run> <name>: <STATUS>"`, e.g. `"Ingest opl-ingest: NO NEW DATA"`.
pub fn subject(run: &str, name: &str, status: RunStatus) -> String {
    format!("{} {}: {}", run, name, status)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, subject: &str, body: &str) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, topic: &str, subject: &str, body: &str) -> Result<()> {
        info!(topic, subject, body, "notification");
        Ok(())
    }
}

/// POSTs `{"topic", "subject", "body"}` as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, topic: &str, subject: &str, body: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "topic": topic, "subject": subject, "body": body }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::network(self.url.as_str(), e))?;
        Ok(())
    }
}

/// Fire and forget: failures are logged and swallowed.
pub async fn send(notifier: &dyn Notifier, topic: &str, subject: &str, body: &str) {
    if let Err(e) = notifier.publish(topic, subject, body).await {
        warn!(topic, subject, error = %e, "failed to publish notification");
    }
}
