use anyhow::{Context, Result};
use oplscraper::{telemetry, Config, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconcile every event past the consumer's watermark into the target table.
#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pipeline.yaml".to_string());
    let (config, origin) =
        Config::load_with_origin(&path).with_context(|| format!("loading {}", path))?;
    telemetry::init(&config.log);
    origin.log();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping before the next event");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::from_config(config, cancel).await?;
    let summary = pipeline.process().await?;
    info!(summary = %summary.describe(), "process finished");
    Ok(())
}
