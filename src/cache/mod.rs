//! On-disk HTTP cache store
//!
//! One file per URL under the configured cache directory, named by the hex
//! SHA-256 of the normalized URL. Contents are a versioned JSON record.
//! Writes go through a temporary sibling and an atomic rename so a crashed
//! run never leaves a half-written record; corrupt or unknown-version files
//! read as misses and are overwritten on the next write. Without a cache
//! directory every operation is a no-op.
//!
//! Cache trouble is never fatal: I/O errors are logged and degrade to
//! cache-miss behavior.

mod record;

pub use record::{CacheRecord, SCHEMA_VERSION};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use url::Url;

/// File-per-URL cache store with per-key write serialization
pub struct CacheStore {
    dir: Option<PathBuf>,

    /// Lazily-created per-key locks so concurrent tasks never interleave a
    /// read-modify-write on the same record. Keys for distinct URLs stay
    /// independent.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Creates a store rooted at `dir`; `None` disables persistence
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns true when a cache directory is configured
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Stable file name for a normalized URL
    fn key_for(url: &Url) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(key))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("cache lock map poisoned");
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Looks up the record for a URL
    ///
    /// Missing files, unreadable files, unparseable contents and records
    /// written by another format version all read as `None`.
    pub async fn get(&self, url: &Url) -> Option<CacheRecord> {
        let key = Self::key_for(url);
        let path = self.path_for(&key)?;

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!("Cache read failed for {}: {}", url, err);
                return None;
            }
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) if record.is_current_schema() => Some(record),
            Ok(record) => {
                tracing::debug!(
                    "Cache record for {} has schema {}, wanted {}",
                    url,
                    record.schema,
                    SCHEMA_VERSION
                );
                None
            }
            Err(err) => {
                tracing::warn!("Corrupt cache record for {}: {}", url, err);
                None
            }
        }
    }

    /// Stores the record for a URL
    pub async fn put(&self, url: &Url, record: &CacheRecord) {
        let key = Self::key_for(url);
        let Some(path) = self.path_for(&key) else {
            return;
        };

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Err(err) = self.write_record(&path, record).await {
            tracing::warn!("Cache write failed for {}: {}", url, err);
        }
    }

    async fn write_record(&self, path: &Path, record: &CacheRecord) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec(record).map_err(std::io::Error::other)?;

        // Temp sibling + rename keeps readers from ever seeing a torn write.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Bumps `fetched_at` on an existing record, if any
    ///
    /// Used after a failed refetch to throttle immediate retries without
    /// discarding the last good body.
    pub async fn touch(&self, url: &Url) {
        let key = Self::key_for(url);
        let Some(path) = self.path_for(&key) else {
            return;
        };

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let Ok(bytes) = tokio::fs::read(&path).await else {
            return;
        };
        let Ok(mut record) = serde_json::from_slice::<CacheRecord>(&bytes) else {
            return;
        };
        if !record.is_current_schema() {
            return;
        }

        record.fetched_at = Utc::now();
        if let Err(err) = self.write_record(&path, &record).await {
            tracing::warn!("Cache touch failed for {}: {}", url, err);
        }
    }

    /// Replaces the stored link set for a URL
    ///
    /// No-op when the URL has no record yet; the fetcher writes the record
    /// before processors derive links from it.
    pub async fn set_links(&self, url: &Url, links: BTreeSet<String>) {
        let key = Self::key_for(url);
        let Some(path) = self.path_for(&key) else {
            return;
        };

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let Ok(bytes) = tokio::fs::read(&path).await else {
            return;
        };
        let Ok(mut record) = serde_json::from_slice::<CacheRecord>(&bytes) else {
            return;
        };
        if !record.is_current_schema() {
            return;
        }

        record.links = links;
        if let Err(err) = self.write_record(&path, &record).await {
            tracing::warn!("Cache link update failed for {}: {}", url, err);
        }
    }
}
