use anyhow::{Context, Result};
use oplscraper::{telemetry, Config, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// List staged objects whose content is duplicated by a newer object and
/// that no recorded event points at.
/// `--apply` deletes them.
///
/// Usage: prune_duplicates [config.yaml] [--apply]
#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let apply = args.iter().any(|a| a == "--apply");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "pipeline.yaml".to_string());

    let (config, origin) =
        Config::load_with_origin(&path).with_context(|| format!("loading {}", path))?;
    telemetry::init(&config.log);
    origin.log();

    let pipeline = Pipeline::from_config(config, CancellationToken::new()).await?;
    let duplicates = pipeline.prune_duplicates(apply).await?;
    for key in &duplicates {
        println!("{}", key);
    }
    info!(count = duplicates.len(), applied = apply, "duplicate scan finished");
    Ok(())
}
