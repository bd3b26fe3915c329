//! # Precache Service Worker
//!
//! An offline cache agent modelled on the service worker lifecycle.
//!
//! ## Features
//!
//! - **Install**: pre-populate a versioned store from a fixed manifest
//! - **Activate**: drop every store whose tag is not the current version
//! - **Fetch interception**: cache-first or network-first with an offline page
//! - **Storage**: in-memory or on-disk named stores behind [`CacheStorage`]
//! - **Clients**: pages claimed by the active agent
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost (sequencing: install → activate → fetch)
//!     │
//!     ├── OfflineAgent (LifecycleHandler)
//!     │       ├── AgentConfig (version tag, manifest, policy)
//!     │       ├── RequestFilter (reserved paths, safe methods)
//!     │       ├── dyn Fetcher (network)
//!     │       └── dyn CacheStorage
//!     │               └── Cache (version tag)
//!     │                       └── CacheKey → CacheEntry
//!     │
//!     └── ClientRegistry (controlled pages)
//! ```

use precache_net::NetError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod disk;
pub mod host;
pub mod storage;

pub use agent::{
    ActivationReport, FetchOutcome, FetchResponse, InstallReport, LifecycleHandler,
    OfflineAgent, ResponseSource,
};
pub use cache::{Cache, CacheEntry, CacheKey, StoredHeader};
pub use clients::{Client, ClientRegistry};
pub use config::{AgentConfig, PolicyKind};
pub use disk::DiskCacheStorage;
pub use host::{ServiceWorker, ServiceWorkerHost, ServiceWorkerId, ServiceWorkerState};
pub use storage::{CacheStorage, MemoryCacheStorage, StorageError};

// ==================== Errors ====================

/// A manifest resource that could not be cached during install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    /// Resolved resource URL.
    pub url: String,
    /// Why it failed (transport error or HTTP status).
    pub reason: String,
}

/// A stale store that could not be deleted during activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFailure {
    /// Store tag.
    pub store: String,
    /// Storage error message.
    pub reason: String,
}

/// Errors that can occur in agent operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Install failed: {} of {total} manifest resources could not be cached", .failed.len())]
    Install {
        failed: Vec<InstallFailure>,
        total: usize,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(String),

    #[error("No network, cached entry or offline page for {url}")]
    FallbackExhausted {
        url: String,
        #[source]
        source: NetError,
    },
}

// ==================== Events ====================

/// Events emitted by the agent and its host.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Worker state changed.
    StateChange {
        version_tag: String,
        new_state: ServiceWorkerState,
    },
    /// Manifest stored under the current version.
    Installed { store: String, entries: usize },
    /// A stale store was removed during activation.
    StaleStoreDeleted { store: String },
    /// Open pages were claimed by the active worker.
    ClientsClaimed { count: usize },
    /// A network response was written to the store.
    EntryCached { store: String, key: String },
}

/// Events queued for a receiver before new ones are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Queue `event` without waiting. A full or closed queue drops it.
pub(crate) fn send_event(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        trace!(?event, "Event queue full, dropping event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_error_message_counts_failures() {
        let err = AgentError::Install {
            failed: vec![
                InstallFailure {
                    url: "https://example.com/a.css".to_string(),
                    reason: "HTTP 404".to_string(),
                },
                InstallFailure {
                    url: "https://example.com/b.css".to_string(),
                    reason: "HTTP 500".to_string(),
                },
            ],
            total: 5,
        };
        assert_eq!(
            err.to_string(),
            "Install failed: 2 of 5 manifest resources could not be cached"
        );
    }

    #[test]
    fn test_fallback_exhausted_keeps_network_cause() {
        let err = AgentError::FallbackExhausted {
            url: "https://example.com/page".to_string(),
            source: NetError::Offline("connection refused".to_string()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Network unreachable: connection refused")
        );
    }
}
