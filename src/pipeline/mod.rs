//! Wiring: builds the collaborators from `Config` and runs ingest / process
//! with notifications.

pub mod ingest;
pub mod process;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{HttpFetch, ReqwestFetcher};
use crate::gate::IngestionGate;
use crate::history::{EventLog, ProcessLog, SqlEventLog, SqlProcessLog};
use crate::notify::{self, subject, LogNotifier, Notifier, RunStatus, WebhookNotifier};
use crate::query::{QueryEngine, SqlSession, SqliteEngine};
use crate::reconcile::{SqlTargetTable, TargetTable};
use crate::storage::{find_duplicates, LocalObjectStore, ObjectStore};
use crate::tracker::WatermarkTracker;

pub use ingest::{run_ingest, IngestOutcome, IngestSettings};
pub use process::{run_process, ProcessSummary};

pub struct Pipeline {
    pub config: Config,
    pub fetcher: Arc<dyn HttpFetch>,
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventLog>,
    pub process_log: Arc<dyn ProcessLog>,
    pub target: Arc<dyn TargetTable>,
    pub notifier: Arc<dyn Notifier>,
    pub cancel: CancellationToken,
}

impl Pipeline {
    /// Production wiring: reqwest, local object store, SQLite warehouse.
    pub async fn from_config(config: Config, cancel: CancellationToken) -> Result<Self> {
        let databases = config.databases();
        let engine: Arc<dyn QueryEngine> = match &config.warehouse.dir {
            Some(dir) => Arc::new(SqliteEngine::open(dir, &databases)?),
            None => Arc::new(SqliteEngine::in_memory(&databases)?),
        };
        let session = SqlSession::new(engine, config.poll_policy(), cancel.clone());

        let events = SqlEventLog::new(session.clone(), &config.warehouse.metadata_db)?;
        events.ensure_table().await?;
        let process_log = SqlProcessLog::new(session.clone(), &config.warehouse.metadata_db)?;
        process_log.ensure_tables().await?;
        let target = SqlTargetTable::new(
            session,
            &config.warehouse.target_db,
            &config.warehouse.target_table,
        )?;

        let fetcher = ReqwestFetcher::new(Duration::from_secs(config.source.timeout_secs))?;
        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(
                url.as_str(),
                Duration::from_secs(config.notify.timeout_secs),
            )?),
            None => Arc::new(LogNotifier),
        };

        info!(
            storage = %config.storage.root.display(),
            warehouse = ?config.warehouse.dir,
            "pipeline ready"
        );
        Ok(Self {
            store: Arc::new(LocalObjectStore::new(&config.storage.root)),
            fetcher: Arc::new(fetcher),
            events: Arc::new(events),
            process_log: Arc::new(process_log),
            target: Arc::new(target),
            notifier,
            cancel,
            config,
        })
    }

    async fn notify(&self, run: &str, name: &str, status: RunStatus, body: &str) {
        let subject = subject(run, name, status);
        notify::send(self.notifier.as_ref(), &self.config.notify.topic, &subject, body).await;
    }

    pub async fn ingest(&self) -> Result<IngestOutcome> {
        let gate = IngestionGate::new(Arc::clone(&self.events));
        let result = run_ingest(
            &IngestSettings::from(&self.config),
            self.fetcher.as_ref(),
            self.store.as_ref(),
            &gate,
        )
        .await;

        let (status, body) = match &result {
            Ok(outcome @ IngestOutcome::AlreadyIngested { .. }) => {
                (RunStatus::NoNewData, outcome.describe())
            }
            Ok(outcome) => (RunStatus::Success, outcome.describe()),
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "ingest failed");
                (RunStatus::Failure, e.to_string())
            }
        };
        self.notify("Ingest", &self.config.producer, status, &body)
            .await;
        result
    }

    pub async fn process(&self) -> Result<ProcessSummary> {
        let tracker = WatermarkTracker::new(Arc::clone(&self.process_log));
        let result = run_process(
            &self.config.reconcile_context(),
            self.events.as_ref(),
            &tracker,
            self.store.as_ref(),
            self.target.as_ref(),
            &self.cancel,
        )
        .await;

        let (status, body) = match &result {
            Ok(summary) if summary.no_new_events() => (RunStatus::NoNewEvents, summary.describe()),
            Ok(summary) => (RunStatus::Success, summary.describe()),
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "processing failed");
                (RunStatus::Failure, e.to_string())
            }
        };
        self.notify("Process", &self.config.consumer, status, &body)
            .await;
        result
    }

    /// Staged objects whose content duplicates a newer object and that no
    /// event points at. Deleted when `apply` is set.
    pub async fn prune_duplicates(&self, apply: bool) -> Result<Vec<String>> {
        let prefix = self.config.storage.prefix.trim_matches('/');
        let referenced = self.referenced_locations().await?;
        let duplicates: Vec<String> = find_duplicates(self.store.as_ref(), prefix, "")
            .await?
            .into_iter()
            .filter(|key| {
                let in_use = referenced.contains(key);
                if in_use {
                    info!(%key, "duplicate kept, an event still points at it");
                }
                !in_use
            })
            .collect();
        if apply {
            for key in &duplicates {
                self.store.delete(key).await?;
                info!(%key, "deleted duplicate");
            }
        }
        Ok(duplicates)
    }

    /// Storage locations named by any event in the log. Consumers can start
    /// from scratch, so every event counts, not just those past a watermark.
    async fn referenced_locations(&self) -> Result<HashSet<String>> {
        let mut locations = HashSet::new();
        for event_id in 0..=self.events.latest_event_id().await? {
            if let Some(location) = self
                .events
                .get(event_id)
                .await?
                .as_ref()
                .and_then(|e| e.storage_location())
            {
                locations.insert(location.to_string());
            }
        }
        Ok(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EventType, NewEvent};
    use crate::storage::Overwrite;
    use chrono::Utc;
    use serde_json::json;

    async fn pipeline(storage: &std::path::Path) -> Pipeline {
        let mut config = Config::default();
        config.storage.root = storage.to_path_buf();
        config.storage.prefix = "opl".into();
        config.warehouse.dir = None;
        Pipeline::from_config(config, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn stage(p: &Pipeline, key: &str, event_hash: Option<&str>) {
        p.store.put(key, b"Name\nA\n", Overwrite::Replace).await.unwrap();
        if let Some(hash) = event_hash {
            p.events
                .append_if_absent(&NewEvent {
                    ingest_ts: Utc::now(),
                    producer: "opl-ingest".into(),
                    event_type: EventType::NewFile,
                    source_system: "Openpowerlifting.org".into(),
                    content_hash: hash.into(),
                    payload: json!({ "storage_location": key }),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn prune_keeps_duplicates_that_events_point_at() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path()).await;
        let a = "opl/year=2024/month=01/day=06/a.csv";
        let b = "opl/year=2024/month=01/day=07/b.csv";
        let c = "opl/year=2024/month=01/day=08/c.csv";
        stage(&p, a, Some("h0")).await;
        stage(&p, b, None).await;
        stage(&p, c, Some("h1")).await;

        assert_eq!(p.prune_duplicates(false).await.unwrap(), vec![b.to_string()]);
        assert!(p.store.exists(b).await.unwrap());

        assert_eq!(p.prune_duplicates(true).await.unwrap(), vec![b.to_string()]);
        assert!(!p.store.exists(b).await.unwrap());
        assert!(p.store.exists(a).await.unwrap());

        let summary = p.process().await.unwrap();
        assert_eq!(summary.watermark, 1);
        assert_eq!(summary.files_loaded, 2);
        assert_eq!(summary.rows_written, 1);
    }
}
