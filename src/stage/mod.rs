//! Stage the extracted dataset in object storage under a date partition.

pub mod archive;
pub mod columnar;

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::gate::content_hash;
use crate::storage::{ObjectStore, Overwrite, PutOutcome};

pub use archive::{first_csv, ExtractedFile};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageFormat {
    #[default]
    Csv,
    Parquet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedObject {
    pub location: String,
    pub outcome: PutOutcome,
    pub size_bytes: u64,
    pub snapshot_date: NaiveDate,
}

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-_]?(\d{2})[-_]?(\d{2})").expect("date regex"));

/// Date embedded in an export file name, e.g.
/// `openpowerlifting-2024-01-06-4c732975.csv` -> 2024-01-06.
pub fn snapshot_date(file_name: &str) -> Option<NaiveDate> {
    DATE_RE.captures_iter(file_name).find_map(|caps| {
        let y: i32 = caps[1].parse().ok()?;
        let m: u32 = caps[2].parse().ok()?;
        let d: u32 = caps[3].parse().ok()?;
        if !(1990..=2100).contains(&y) {
            return None;
        }
        NaiveDate::from_ymd_opt(y, m, d)
    })
}

/// `<prefix>/year=YYYY/month=MM/day=DD/<file_name>`
pub fn staging_key(prefix: &str, date: NaiveDate, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let partition = format!(
        "year={:04}/month={:02}/day={:02}/{}",
        date.year(),
        date.month(),
        date.day(),
        file_name
    );
    if prefix.is_empty() {
        partition
    } else {
        format!("{}/{}", prefix, partition)
    }
}

/// `name` with the first 8 hex digits of `hash` before the extension:
/// `openpowerlifting-latest.csv` -> `openpowerlifting-latest-1a2b3c4d.csv`.
pub fn revision_name(name: &str, hash: &str) -> String {
    let tag = &hash[..hash.len().min(8)];
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, tag, ext),
        None => format!("{}-{}", name, tag),
    }
}

/// Put without overwriting. A skipped put only counts when the object already
/// there holds exactly `bytes`.
async fn put_unless_different(
    store: &dyn ObjectStore,
    location: &str,
    bytes: &[u8],
) -> Result<Option<PutOutcome>> {
    let outcome = store.put(location, bytes, Overwrite::Skip).await?;
    if outcome == PutOutcome::Skipped && store.get(location).await? != bytes {
        return Ok(None);
    }
    Ok(Some(outcome))
}

/// Upload `file` (optionally re-encoded as Parquet). An identical object
/// already at the key is reused; different content under the same name and
/// date is staged beside it under [`revision_name`].
#[instrument(skip(store, file), fields(file = %file.name))]
pub async fn stage_file(
    store: &dyn ObjectStore,
    prefix: &str,
    format: StageFormat,
    file: ExtractedFile,
    fallback_date: NaiveDate,
) -> Result<StagedObject> {
    let date = snapshot_date(&file.name).unwrap_or(fallback_date);

    let (name, bytes) = match format {
        StageFormat::Csv => (file.name, file.bytes),
        StageFormat::Parquet => {
            let stem = file
                .name
                .rsplit_once('.')
                .map(|(stem, _)| stem.to_string())
                .unwrap_or_else(|| file.name.clone());
            let csv = file.bytes;
            let parquet =
                tokio::task::spawn_blocking(move || columnar::csv_to_parquet(&csv)).await??;
            (format!("{}.parquet", stem), parquet)
        }
    };

    let mut location = staging_key(prefix, date, &name);
    let outcome = match put_unless_different(store, &location, &bytes).await? {
        Some(outcome) => outcome,
        None => {
            let revised = staging_key(prefix, date, &revision_name(&name, &content_hash(&bytes)));
            warn!(taken = %location, %revised, "different content already staged under this name");
            location = revised;
            put_unless_different(store, &location, &bytes)
                .await?
                .ok_or_else(|| {
                    Error::Validation(format!("{} holds different content", location))
                })?
        }
    };
    info!(%location, size = bytes.len(), ?outcome, "staged");

    Ok(StagedObject {
        location,
        outcome,
        size_bytes: bytes.len() as u64,
        snapshot_date: date,
    })
}
