//! Store backends.
//!
//! [`CacheStorage`] is the only way the agent reaches persisted data. Stores
//! are addressed by name (the version tag) and hold [`CacheEntry`] values
//! keyed by [`CacheKey`]. Writing to a store that does not exist creates it.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cache::{Cache, CacheEntry, CacheKey};

/// Errors from a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store {name}: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

/// Named, versioned key→response stores.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a store, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), StorageError>;

    /// Check if a store exists.
    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// All store names, sorted.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a store as a unit. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// Look up `key` in store `name`. A missing store is a miss.
    async fn match_entry(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StorageError>;

    /// Insert or overwrite one entry.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError>;

    /// Insert or overwrite several entries.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        for entry in entries {
            self.put(name, entry).await?;
        }
        Ok(())
    }

    /// All entries of store `name`, sorted by key. A missing store is empty.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError>;
}

/// In-memory storage. Clones share the same stores.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_entry(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, StorageError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .map(Cache::entries)
            .unwrap_or_default())
    }
}
