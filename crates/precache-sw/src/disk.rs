//! On-disk storage: one directory per named store, one file per entry.
//!
//! ```text
//! root/
//!   <base64url(store name)>/
//!     <base64url(cache key)>.json
//! ```
//!
//! Any version tag or URL maps to a safe file name. A lookup reads only the
//! entry it asks for. Every entry write goes through a temporary file and a
//! rename, so a crash never leaves a half-written entry. Deleting a store
//! removes its directory as a unit.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheKey};
use crate::storage::{CacheStorage, StorageError};

const EXTENSION: &str = "json";

/// Storage rooted at a directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskCacheStorage {
    /// Storage under `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(name.as_bytes()))
    }

    fn entry_path(&self, name: &str, key: &CacheKey) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(key.as_str().as_bytes());
        self.store_dir(name).join(format!("{encoded}.{EXTENSION}"))
    }

    fn decode_name(encoded: &str) -> Option<String> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn read_entry(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry = serde_json::from_slice(&data).map_err(|source| StorageError::Corrupt {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(entry))
    }

    async fn write_entry(&self, name: &str, entry: &CacheEntry) -> Result<(), StorageError> {
        let dir = self.store_dir(name);
        fs::create_dir_all(&dir).await?;

        let key = entry.key();
        let path = self.entry_path(name, &key);
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{n}.tmp"));

        let data = serde_json::to_vec(entry)?;
        fs::write(&tmp, &data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        trace!(store = %name, key = %key, bytes = data.len(), "Entry saved");
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        let dir = self.store_dir(name);
        if !fs::try_exists(&dir).await? {
            debug!(store = %name, root = %self.root.display(), "Creating store");
        }
        fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        match fs::metadata(self.store_dir(name)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let file_name = item.file_name();
            match file_name.to_str().and_then(Self::decode_name) {
                Some(name) => names.push(name),
                None => warn!(
                    path = %item.path().display(),
                    "Ignoring directory with undecodable store name"
                ),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        match fs::remove_dir_all(self.store_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn match_entry(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StorageError> {
        self.read_entry(name, &self.entry_path(name, key)).await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.write_entry(name, &entry).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError> {
        let mut dir = match fs::read_dir(self.store_dir(name)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(entry) = self.read_entry(name, &path).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }
}
