use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::{glob, Pattern};
use tokio::fs;
use tracing::{debug, warn};

use super::{ObjectMeta, ObjectStore, Overwrite, PutOutcome};
use crate::error::{Error, Result};

/// Object store on a local directory. Keys are `/`-separated paths relative
/// to the root. Writes go to `<key>.tmp` and are renamed into place.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(".tmp")
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::Validation(format!("invalid object key `{}`", key)));
        }
        Ok(self.root.join(rel))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

fn io_error(key: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::ObjectNotFound(key.to_string())
    } else {
        Error::storage(key, e)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        fs::try_exists(&full).await.map_err(|e| Error::storage(path, e))
    }

    async fn put(&self, path: &str, bytes: &[u8], overwrite: Overwrite) -> Result<PutOutcome> {
        let full = self.resolve(path)?;
        if overwrite == Overwrite::Skip && self.exists(path).await? {
            debug!(key = path, "object exists, skipping put");
            return Ok(PutOutcome::Skipped);
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(path, e))?;
        }

        let mut tmp = full.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::storage(path, e))?;
        if let Err(e) = fs::rename(&tmp, &full).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::storage(path, e));
        }
        debug!(key = path, size = bytes.len(), "object written");
        Ok(PutOutcome::Written)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).await.map_err(|e| io_error(path, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}/**/*", Pattern::escape(&self.root.to_string_lossy()));
        let entries = glob(&pattern)
            .map_err(|e| Error::storage(self.root.display().to_string(), e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("cannot read glob entry: {:?}", e);
                    continue;
                }
            };
            if !path.is_file() || path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            if let Some(key) = self.key_of(&path) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn head(&self, path: &str) -> Result<ObjectMeta> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await.map_err(|e| io_error(path, e))?;
        let modified = meta.modified().map_err(|e| Error::storage(path, e))?;
        Ok(ObjectMeta {
            path: path.to_string(),
            size: meta.len(),
            last_modified: DateTime::<Utc>::from(modified),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).await.map_err(|e| io_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::find_duplicates;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn put_get_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let key = "openpowerlifting/year=2024/month=01/day=06/a.csv";

        assert!(!store.exists(key).await.unwrap());
        assert_eq!(
            store.put(key, b"v1", Overwrite::Skip).await.unwrap(),
            PutOutcome::Written
        );
        assert_eq!(
            store.put(key, b"v2", Overwrite::Skip).await.unwrap(),
            PutOutcome::Skipped
        );
        assert_eq!(store.get(key).await.unwrap(), b"v1".to_vec());

        store.put(key, b"v3", Overwrite::Replace).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), b"v3".to_vec());
        assert_eq!(store.head(key).await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn missing_object_and_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.get("nope.csv").await,
            Err(Error::ObjectNotFound(_))
        ));
        for bad in ["", "../escape.csv", "/abs.csv", "a/../b.csv", "x.tmp"] {
            assert!(matches!(
                store.put(bad, b"x", Overwrite::Replace).await,
                Err(Error::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["opl/b.csv", "opl/a/c.csv", "other/d.csv"] {
            store.put(key, b"x", Overwrite::Replace).await.unwrap();
        }
        std::fs::write(dir.path().join("opl/partial.csv.tmp"), b"x").unwrap();
        assert_eq!(
            store.list("opl/").await.unwrap(),
            vec!["opl/a/c.csv".to_string(), "opl/b.csv".to_string()]
        );
    }

    #[tokio::test]
    async fn duplicates_keep_most_recent_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("raw/old.zip", b"same", Overwrite::Replace).await.unwrap();
        store.put("raw/new.zip", b"same", Overwrite::Replace).await.unwrap();
        store.put("raw/unique.zip", b"other", Overwrite::Replace).await.unwrap();
        store.put("raw/notes.txt", b"same", Overwrite::Replace).await.unwrap();

        let old = std::fs::File::options()
            .write(true)
            .open(dir.path().join("raw/old.zip"))
            .unwrap();
        old.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let dups = find_duplicates(&store, "raw/", ".zip").await.unwrap();
        assert_eq!(dups, vec!["raw/old.zip".to_string()]);

        store.delete("raw/old.zip").await.unwrap();
        assert!(!store.exists("raw/old.zip").await.unwrap());
        assert!(find_duplicates(&store, "raw/", ".zip").await.unwrap().is_empty());
    }
}
