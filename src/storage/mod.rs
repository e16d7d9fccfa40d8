//! Object storage capability and the duplicate-object finder.

pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::gate::content_hash;

pub use local::LocalObjectStore;

/// What `put` does when the key is already taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overwrite {
    Replace,
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Key existed and `Overwrite::Skip` was requested.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn put(&self, path: &str, bytes: &[u8], overwrite: Overwrite) -> Result<PutOutcome>;
    /// `Error::ObjectNotFound` when missing.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn head(&self, path: &str) -> Result<ObjectMeta>;
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Objects under `prefix` ending in `suffix` whose content duplicates another
/// object's. Within each group of identical content the most recently
/// modified copy is kept (ties go to the greater key); the rest are returned,
/// sorted.
pub async fn find_duplicates(
    store: &dyn ObjectStore,
    prefix: &str,
    suffix: &str,
) -> Result<Vec<String>> {
    let mut groups: BTreeMap<String, Vec<ObjectMeta>> = BTreeMap::new();
    for key in store.list(prefix).await? {
        if !key.ends_with(suffix) {
            continue;
        }
        let hash = content_hash(&store.get(&key).await?);
        let meta = store.head(&key).await?;
        groups.entry(hash).or_default().push(meta);
    }

    let mut duplicates = Vec::new();
    for (hash, mut copies) in groups {
        if copies.len() < 2 {
            continue;
        }
        copies.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.path.cmp(&a.path))
        });
        info!(%hash, keep = %copies[0].path, dropped = copies.len() - 1, "duplicate content");
        duplicates.extend(copies.into_iter().skip(1).map(|m| m.path));
    }
    duplicates.sort();
    Ok(duplicates)
}
