use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::fetch::{resolve_archive_url, HttpFetch};
use crate::gate::{content_hash, IngestionGate};
use crate::stage::{first_csv, stage_file, StageFormat};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    pub source_url: String,
    pub producer: String,
    pub source_system: String,
    pub prefix: String,
    pub format: StageFormat,
}

impl From<&Config> for IngestSettings {
    fn from(config: &Config) -> Self {
        Self {
            source_url: config.source.url.clone(),
            producer: config.producer.clone(),
            source_system: config.source.system.clone(),
            prefix: config.storage.prefix.clone(),
            format: config.storage.format,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Same bytes were ingested before; nothing staged or recorded.
    AlreadyIngested { content_hash: String, event_id: i64 },
    Ingested {
        content_hash: String,
        event_id: i64,
        location: String,
    },
}

impl IngestOutcome {
    pub fn describe(&self) -> String {
        match self {
            IngestOutcome::AlreadyIngested {
                content_hash,
                event_id,
            } => format!(
                "content {} already ingested as event {}",
                content_hash, event_id
            ),
            IngestOutcome::Ingested {
                content_hash,
                event_id,
                location,
            } => format!(
                "event {} recorded for content {} staged at {}",
                event_id, content_hash, location
            ),
        }
    }
}

/// Download, gate on content hash, stage the CSV, record the event.
///
/// The event is only recorded after the staged object is in place, so a
/// failure at any step leaves the event log untouched.
#[instrument(skip_all, fields(producer = %settings.producer))]
pub async fn run_ingest(
    settings: &IngestSettings,
    fetcher: &dyn HttpFetch,
    store: &dyn ObjectStore,
    gate: &IngestionGate,
) -> Result<IngestOutcome> {
    let archive_url = resolve_archive_url(fetcher, &settings.source_url).await?;
    let archive = fetcher.get(&archive_url).await?;
    info!(url = %archive_url, size = archive.len(), "downloaded");

    let (hash, archive) =
        tokio::task::spawn_blocking(move || (content_hash(&archive), archive)).await?;

    if let Some(event_id) = gate.is_ingested(&hash, &settings.producer).await? {
        info!(%hash, event_id, "no new data");
        return Ok(IngestOutcome::AlreadyIngested {
            content_hash: hash,
            event_id,
        });
    }

    let file = tokio::task::spawn_blocking(move || first_csv(&archive)).await??;
    let entry = file.entry.clone();
    let staged = stage_file(
        store,
        &settings.prefix,
        settings.format,
        file,
        Utc::now().date_naive(),
    )
    .await?;

    let payload = json!({
        "storage_location": staged.location,
        "archive_entry": entry,
        "snapshot_date": staged.snapshot_date.to_string(),
        "size_bytes": staged.size_bytes,
        "source_url": archive_url,
    });
    let submission = gate
        .submit(&hash, &settings.producer, &settings.source_system, payload)
        .await?;

    if submission.already_ingested {
        return Ok(IngestOutcome::AlreadyIngested {
            content_hash: hash,
            event_id: submission.event_id,
        });
    }
    Ok(IngestOutcome::Ingested {
        content_hash: hash,
        event_id: submission.event_id,
        location: staged.location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::history::{EventLog, MemoryEventLog};
    use crate::stage::archive::build_zip;
    use crate::storage::LocalObjectStore;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct Fixed {
        body: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl HttpFetch for Fixed {
        async fn get(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.body.lock().unwrap().clone())
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            source_url: "https://example.org/openpowerlifting-latest.zip".into(),
            producer: "opl-ingest".into(),
            source_system: "Openpowerlifting.org".into(),
            prefix: "openpowerlifting".into(),
            format: StageFormat::Csv,
        }
    }

    #[tokio::test]
    async fn second_download_of_same_bytes_is_no_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let log = Arc::new(MemoryEventLog::new());
        let gate = IngestionGate::new(log.clone());
        let fetcher = Fixed {
            body: Mutex::new(build_zip(&[(
                "openpowerlifting-2024-01-06-abc/openpowerlifting-2024-01-06-abc.csv",
                b"Name,TotalKg\nA,100\n",
            )])),
        };

        let first = run_ingest(&settings(), &fetcher, &store, &gate).await.unwrap();
        let (event_id, location) = match first {
            IngestOutcome::Ingested {
                event_id, location, ..
            } => (event_id, location),
            other => panic!("expected a new event, got {other:?}"),
        };
        assert_eq!(event_id, 0);
        assert_eq!(
            location,
            "openpowerlifting/year=2024/month=01/day=06/openpowerlifting-2024-01-06-abc.csv"
        );
        assert_eq!(store.get(&location).await.unwrap(), b"Name,TotalKg\nA,100\n".to_vec());

        let event = log.get(0).await.unwrap().unwrap();
        assert_eq!(event.storage_location(), Some(location.as_str()));
        assert_eq!(event.payload["snapshot_date"], "2024-01-06");

        let second = run_ingest(&settings(), &fetcher, &store, &gate).await.unwrap();
        assert!(matches!(second, IngestOutcome::AlreadyIngested { event_id: 0, .. }));
        assert_eq!(log.latest_event_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_content_under_an_undated_name_points_at_its_own_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let log = Arc::new(MemoryEventLog::new());
        let gate = IngestionGate::new(log.clone());
        let fetcher = Fixed {
            body: Mutex::new(build_zip(&[("openpowerlifting-latest.csv", b"Name\nA\n")])),
        };

        run_ingest(&settings(), &fetcher, &store, &gate).await.unwrap();
        *fetcher.body.lock().unwrap() =
            build_zip(&[("openpowerlifting-latest.csv", b"Name\nB\n")]);
        let second = run_ingest(&settings(), &fetcher, &store, &gate).await.unwrap();
        assert!(matches!(second, IngestOutcome::Ingested { event_id: 1, .. }));

        for (event_id, body) in [(0, b"Name\nA\n"), (1, b"Name\nB\n")] {
            let event = log.get(event_id).await.unwrap().unwrap();
            let location = event.storage_location().unwrap();
            assert_eq!(store.get(location).await.unwrap(), body.to_vec());
        }
    }

    #[tokio::test]
    async fn archive_without_csv_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let log = Arc::new(MemoryEventLog::new());
        let gate = IngestionGate::new(log.clone());
        let fetcher = Fixed {
            body: Mutex::new(build_zip(&[("README.txt", b"nothing here")])),
        };

        let err = run_ingest(&settings(), &fetcher, &store, &gate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(log.latest_event_id().await.unwrap(), -1);
        assert!(store.list("").await.unwrap().is_empty());
    }
}
