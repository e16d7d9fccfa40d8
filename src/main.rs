use anyhow::{Context, Result};
use oplscraper::{pipeline::IngestOutcome, telemetry, Config, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "pipeline.yaml";

/// Scheduled run: ingest the current export, then process every new event.
#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let (config, origin) =
        Config::load_with_origin(&path).with_context(|| format!("loading {}", path))?;
    telemetry::init(&config.log);
    origin.log();
    info!(config = %path, "startup");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            ctrl_c.cancel();
        }
    });

    let pipeline = Pipeline::from_config(config, cancel)
        .await
        .context("building pipeline")?;

    match pipeline.ingest().await.context("ingest run")? {
        IngestOutcome::AlreadyIngested { .. } => info!("no new data downloaded"),
        IngestOutcome::Ingested { event_id, .. } => info!(event_id, "new export recorded"),
    }

    // Processing also picks up events an earlier failed run left behind.
    let summary = pipeline.process().await.context("process run")?;
    info!(summary = %summary.describe(), "done");
    Ok(())
}
