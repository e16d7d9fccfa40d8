use anyhow::{Context, Result};
use oplscraper::{telemetry, Config, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Download the export and record it if its content is new.
#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pipeline.yaml".to_string());
    let (config, origin) =
        Config::load_with_origin(&path).with_context(|| format!("loading {}", path))?;
    telemetry::init(&config.log);
    origin.log();

    let pipeline = Pipeline::from_config(config, CancellationToken::new()).await?;
    let outcome = pipeline.ingest().await?;
    info!(outcome = %outcome.describe(), "ingest finished");
    Ok(())
}
