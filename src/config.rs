//! Pipeline configuration: YAML file, then `OPL_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::query::{ident, PollPolicy};
use crate::reconcile::{ReconcileContext, DEFAULT_SAMPLE_ROWS};
use crate::schema::Naming;
use crate::stage::StageFormat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    /// Producer name recorded on ingest events.
    pub producer: String,
    /// Consumer id owning a watermark.
    pub consumer: String,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub columns: ColumnsConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Archive URL, or an HTML page linking to it.
    pub url: String,
    pub system: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub prefix: String,
    pub format: StageFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    /// Directory of the SQLite databases; `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
    pub metadata_db: String,
    pub target_db: String,
    pub target_table: String,
    /// Recorded in the `source_table` audit column.
    pub source_table: String,
    pub sample_rows: usize,
    pub poll: PollConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub timeout_secs: u64,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnsConfig {
    /// Raw header -> column name, applied before snake_case conversion.
    pub rename: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub topic: String,
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// The path did not exist.
    Defaults(PathBuf),
}

impl ConfigOrigin {
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!(path = %path.display(), "loaded config"),
            ConfigOrigin::Defaults(path) => {
                warn!(path = %path.display(), "config file not found, using defaults")
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            producer: "opl-ingest".into(),
            consumer: "opl-cleanse".into(),
            storage: StorageConfig::default(),
            warehouse: WarehouseConfig::default(),
            columns: ColumnsConfig {
                rename: BTreeMap::from([("WeightClassKg".to_string(), "weightclass_kg".to_string())]),
            },
            notify: NotifyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "https://openpowerlifting.gitlab.io/opl-csv/files/openpowerlifting-latest.zip".into(),
            system: "Openpowerlifting.org".into(),
            timeout_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/storage"),
            prefix: "openpowerlifting".into(),
            format: StageFormat::Csv,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("data/warehouse")),
            metadata_db: "metadata".into(),
            target_db: "cleansed".into(),
            target_table: "openpowerlifting".into(),
            source_table: "raw.openpowerlifting".into(),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            poll: PollConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            initial_ms: policy.initial_interval.as_millis() as u64,
            max_ms: policy.max_interval.as_millis() as u64,
            timeout_secs: policy.timeout.as_secs(),
            page_size: policy.page_size,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            topic: "opl-pipeline".into(),
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read `path` (defaults when it does not exist), apply environment
    /// overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_origin(path).map(|(config, _)| config)
    }

    /// [`Config::load`], also reporting whether the file was found. Logs
    /// nothing; call [`ConfigOrigin::log`] after the subscriber is installed.
    pub fn load_with_origin(path: impl AsRef<Path>) -> Result<(Self, ConfigOrigin)> {
        let path = path.as_ref();
        let (mut config, origin) = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let config = Self::from_yaml_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            (config, ConfigOrigin::File(path.to_path_buf()))
        } else {
            (Self::default(), ConfigOrigin::Defaults(path.to_path_buf()))
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok((config, origin))
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OPL_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(root) = lookup("OPL_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("OPL_WAREHOUSE") {
            self.warehouse.dir = (dir != ":memory:").then(|| PathBuf::from(dir));
        }
        if let Some(hook) = lookup("OPL_WEBHOOK_URL") {
            self.notify.webhook_url = (!hook.is_empty()).then_some(hook);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.source.url)
            .map_err(|e| Error::Config(format!("source.url `{}`: {}", self.source.url, e)))?;
        if let Some(hook) = &self.notify.webhook_url {
            Url::parse(hook)
                .map_err(|e| Error::Config(format!("notify.webhook_url `{}`: {}", hook, e)))?;
        }
        for (field, value) in [
            ("producer", &self.producer),
            ("consumer", &self.consumer),
            ("source.system", &self.source.system),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", field)));
            }
        }
        for (field, value) in [
            ("warehouse.metadata_db", &self.warehouse.metadata_db),
            ("warehouse.target_db", &self.warehouse.target_db),
            ("warehouse.target_table", &self.warehouse.target_table),
        ] {
            ident(value).map_err(|_| Error::Config(format!("{} `{}` is not a valid identifier", field, value)))?;
        }
        for (raw, name) in &self.columns.rename {
            ident(name).map_err(|_| {
                Error::Config(format!("columns.rename `{}` -> `{}` is not a valid identifier", raw, name))
            })?;
        }
        if self.warehouse.sample_rows == 0 {
            return Err(Error::Config("warehouse.sample_rows must be positive".into()));
        }
        let poll = &self.warehouse.poll;
        if poll.initial_ms == 0 || poll.initial_ms > poll.max_ms || poll.page_size == 0 {
            return Err(Error::Config(
                "warehouse.poll needs 0 < initial_ms <= max_ms and a positive page_size".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let poll = &self.warehouse.poll;
        PollPolicy {
            initial_interval: Duration::from_millis(poll.initial_ms),
            max_interval: Duration::from_millis(poll.max_ms),
            timeout: Duration::from_secs(poll.timeout_secs),
            page_size: poll.page_size,
        }
    }

    pub fn naming(&self) -> Naming {
        Naming::new(self.columns.rename.clone())
    }

    pub fn reconcile_context(&self) -> ReconcileContext {
        ReconcileContext {
            consumer_id: self.consumer.clone(),
            source_system: self.source.system.clone(),
            source_table: self.warehouse.source_table.clone(),
            naming: self.naming(),
            sample_rows: self.warehouse.sample_rows,
        }
    }

    /// Databases the warehouse engine must expose.
    pub fn databases(&self) -> Vec<&str> {
        let mut dbs = vec![self.warehouse.metadata_db.as_str()];
        if self.warehouse.target_db != self.warehouse.metadata_db {
            dbs.push(self.warehouse.target_db.as_str());
        }
        dbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.databases(), vec!["metadata", "cleansed"]);
        assert_eq!(config.poll_policy(), PollPolicy::default());
        assert_eq!(config.naming().canonical("WeightClassKg"), "weightclass_kg");
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml_str(
            r#"
producer: nightly
storage:
  prefix: raw/opl
  format: parquet
warehouse:
  dir: ~
  poll:
    timeout_secs: 60
"#,
        )
        .unwrap();
        assert_eq!(config.producer, "nightly");
        assert_eq!(config.storage.format, StageFormat::Parquet);
        assert_eq!(config.storage.root, PathBuf::from("data/storage"));
        assert_eq!(config.warehouse.dir, None);
        assert_eq!(config.poll_policy().timeout, Duration::from_secs(60));
        assert_eq!(config.warehouse.poll.page_size, 1000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_yaml_str("producr: typo\n").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPL_SOURCE_URL", "https://example.org/index.html"),
            ("OPL_WAREHOUSE", ":memory:"),
            ("OPL_WEBHOOK_URL", "https://hooks.example.org/x"),
            ("LOG_LEVEL", "debug"),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.source.url, "https://example.org/index.html");
        assert_eq!(config.warehouse.dir, None);
        assert_eq!(config.notify.webhook_url.as_deref(), Some("https://hooks.example.org/x"));
        assert_eq!(config.log.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn invalid_identifiers_fail_validation() {
        let mut config = Config::default();
        config.warehouse.target_table = "open powerlifting".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.yaml");
        let (config, origin) = Config::load_with_origin(&absent).unwrap();
        assert_eq!(config.producer, Config::default().producer);
        assert_eq!(origin, ConfigOrigin::Defaults(absent.clone()));
        assert_eq!(Config::load(&absent).unwrap().producer, config.producer);
    }

    #[test]
    fn existing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "producer: nightly\n").unwrap();
        let (config, origin) = Config::load_with_origin(&path).unwrap();
        assert_eq!(config.producer, "nightly");
        assert_eq!(origin, ConfigOrigin::File(path));
    }
}
