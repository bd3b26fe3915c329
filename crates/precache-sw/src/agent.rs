//! The offline cache agent: install, activate and fetch handlers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use precache_net::{
    Fetcher, InterceptAction, PassThroughReason, Request, RequestFilter, Response, Url,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheKey};
use crate::config::{AgentConfig, PolicyKind};
use crate::storage::CacheStorage;
use crate::{send_event, AgentError, AgentEvent, InstallFailure, StoreFailure};

// ==================== Handler Interface ====================

/// One method per lifecycle phase. The host awaits each before moving on.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Populate the current store from the manifest.
    async fn install(&self) -> Result<InstallReport, AgentError>;

    /// Delete every store that is not the current version.
    async fn activate(&self) -> Result<ActivationReport, AgentError>;

    /// Decide how an intercepted request is answered.
    async fn fetch(&self, request: Request) -> Result<FetchOutcome, AgentError>;
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Store that was populated.
    pub store: String,
    /// Number of manifest resources written.
    pub cached: usize,
}

/// Result of an activation. Individual deletion failures are not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivationReport {
    /// The store kept as current.
    pub current: String,
    /// Stale stores removed.
    pub deleted: Vec<String>,
    /// Stale stores that could not be removed.
    pub failed: Vec<StoreFailure>,
    /// Whether open pages should be claimed immediately.
    pub claim_clients: bool,
}

impl ActivationReport {
    /// True when every stale store was removed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a response handed to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// The request's own store entry.
    Cache,
    /// A live network response.
    Network,
    /// The offline page entry, as last resort.
    OfflinePage,
    /// The agent was bypassed; the host fetched it untouched.
    Bypass,
}

/// Response produced for an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }

    pub fn from_cache(&self) -> bool {
        matches!(
            self.source,
            ResponseSource::Cache | ResponseSource::OfflinePage
        )
    }
}

/// Outcome of the fetch handler.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The agent does not respond; the request goes out untouched.
    PassThrough(PassThroughReason),
    /// The agent responds.
    Respond(FetchResponse),
}

// ==================== Agent ====================

/// Offline cache agent.
///
/// Holds an immutable config, the store backend and the network. Cheap to
/// share behind an `Arc`; concurrent fetches are independent.
pub struct OfflineAgent {
    config: Arc<AgentConfig>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
    filter: RequestFilter,
    manifest: Vec<Url>,
    offline_key: Option<CacheKey>,
    event_tx: Option<mpsc::Sender<AgentEvent>>,
}

impl OfflineAgent {
    /// Create an agent. The config is validated and resolved once here.
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetcher>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let manifest = config.resolved_manifest()?;
        let offline_key = config.offline_page_url()?.map(|url| CacheKey::get(&url));
        let filter = config.request_filter();

        Ok(Self {
            config: Arc::new(config),
            storage,
            network,
            filter,
            manifest,
            offline_key,
            event_tx: None,
        })
    }

    /// Send events to `tx`. Events that find the queue full are dropped.
    pub fn with_events(mut self, tx: mpsc::Sender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current store name.
    pub fn version_tag(&self) -> &str {
        &self.config.version_tag
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Manifest resources absent from the current store.
    ///
    /// Empty after a completed install.
    pub async fn missing_resources(&self) -> Result<Vec<Url>, AgentError> {
        let store = self.version_tag();
        let mut missing = Vec::new();
        for url in &self.manifest {
            if self
                .storage
                .match_entry(store, &CacheKey::get(url))
                .await?
                .is_none()
            {
                missing.push(url.clone());
            }
        }
        Ok(missing)
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            send_event(tx, event);
        }
    }

    /// Look `key` up in the current store. Storage trouble counts as a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<Response> {
        let entry = match self.storage.match_entry(self.version_tag(), key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(key = %key, error = %e, "Store lookup failed, treating as miss");
                return None;
            }
        };
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable store entry, treating as miss");
                None
            }
        }
    }

    /// Write a successful network response under the request's key.
    ///
    /// The write runs as its own task so it completes even if the caller
    /// stops waiting for the response.
    async fn store_response(&self, request: &Request, response: &Response) {
        if !response.ok() {
            debug!(url = %request.url, status = %response.status, "Not caching error response");
            return;
        }

        let entry = CacheEntry::from_response(request, response);
        let key = entry.key();
        let store = self.version_tag().to_string();
        let storage = Arc::clone(&self.storage);
        let write_store = store.clone();
        let write = tokio::spawn(async move { storage.put(&write_store, entry).await });

        match write.await {
            Ok(Ok(())) => {
                debug!(key = %key, store = %store, "Cached network response");
                self.emit(AgentEvent::EntryCached {
                    store,
                    key: key.to_string(),
                });
            }
            Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to cache response"),
            Err(e) => warn!(key = %key, error = %e, "Cache write task failed"),
        }
    }

    async fn cache_first(&self, request: Request) -> Result<FetchOutcome, AgentError> {
        let key = CacheKey::from_request(&request);

        if let Some(response) = self.lookup(&key).await {
            debug!(url = %request.url, "Serving from cache");
            return Ok(FetchOutcome::Respond(FetchResponse::new(
                response,
                ResponseSource::Cache,
            )));
        }

        debug!(url = %request.url, "Cache miss, fetching from network");
        match self.network.fetch(request.clone()).await {
            Ok(response) => {
                self.store_response(&request, &response).await;
                Ok(FetchOutcome::Respond(FetchResponse::new(
                    response,
                    ResponseSource::Network,
                )))
            }
            Err(e) => {
                error!(url = %request.url, error = %e, "Request failed and no cached copy");
                Err(AgentError::Network(e))
            }
        }
    }

    async fn network_first(&self, request: Request) -> Result<FetchOutcome, AgentError> {
        let e = match self.network.fetch(request.clone()).await {
            Ok(response) => {
                self.store_response(&request, &response).await;
                return Ok(FetchOutcome::Respond(FetchResponse::new(
                    response,
                    ResponseSource::Network,
                )));
            }
            Err(e) => e,
        };

        warn!(url = %request.url, error = %e, "Network failed, falling back to cache");
        let key = CacheKey::from_request(&request);
        if let Some(response) = self.lookup(&key).await {
            debug!(url = %request.url, "Serving from cache");
            return Ok(FetchOutcome::Respond(FetchResponse::new(
                response,
                ResponseSource::Cache,
            )));
        }

        if let Some(offline_key) = &self.offline_key {
            if let Some(response) = self.lookup(offline_key).await {
                info!(url = %request.url, "Serving offline page");
                return Ok(FetchOutcome::Respond(FetchResponse::new(
                    response,
                    ResponseSource::OfflinePage,
                )));
            }
        }

        error!(url = %request.url, "No network, no cached copy and no offline page");
        Err(AgentError::FallbackExhausted {
            url: request.url.to_string(),
            source: e,
        })
    }
}

#[async_trait]
impl LifecycleHandler for OfflineAgent {
    async fn install(&self) -> Result<InstallReport, AgentError> {
        let store = self.version_tag().to_string();
        info!(store = %store, resources = self.manifest.len(), "Installing");

        self.storage.open(&store).await?;

        let fetches = self.manifest.iter().map(|url| async move {
            let request = Request::get(url.clone());
            match self.network.fetch(request.clone()).await {
                Ok(response) if response.ok() => Ok(CacheEntry::from_response(&request, &response)),
                Ok(response) => Err(InstallFailure {
                    url: url.to_string(),
                    reason: format!("HTTP {}", response.status),
                }),
                Err(e) => Err(InstallFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                }),
            }
        });

        let mut entries = Vec::with_capacity(self.manifest.len());
        let mut failed = Vec::new();
        for result in join_all(fetches).await {
            match result {
                Ok(entry) => entries.push(entry),
                Err(failure) => failed.push(failure),
            }
        }

        if !failed.is_empty() {
            for failure in &failed {
                error!(url = %failure.url, reason = %failure.reason, "Failed to cache manifest resource");
            }
            return Err(AgentError::Install {
                failed,
                total: self.manifest.len(),
            });
        }

        let cached = entries.len();
        self.storage.put_all(&store, entries).await?;
        info!(store = %store, cached, "Manifest cached");
        self.emit(AgentEvent::Installed {
            store: store.clone(),
            entries: cached,
        });

        Ok(InstallReport { store, cached })
    }

    async fn activate(&self) -> Result<ActivationReport, AgentError> {
        let current = self.version_tag().to_string();
        info!(store = %current, "Activating");

        let names = self.storage.keys().await?;
        let deletions = names
            .into_iter()
            .filter(|name| *name != current)
            .map(|name| async move {
                let result = self.storage.delete(&name).await;
                (name, result)
            });

        let mut report = ActivationReport {
            current: current.clone(),
            claim_clients: true,
            ..Default::default()
        };
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(true) => {
                    info!(store = %name, "Deleted stale store");
                    self.emit(AgentEvent::StaleStoreDeleted {
                        store: name.clone(),
                    });
                    report.deleted.push(name);
                }
                Ok(false) => debug!(store = %name, "Stale store already gone"),
                Err(e) => {
                    error!(store = %name, error = %e, "Failed to delete stale store");
                    report.failed.push(StoreFailure {
                        store: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            store = %current,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Stale stores cleaned"
        );
        Ok(report)
    }

    async fn fetch(&self, request: Request) -> Result<FetchOutcome, AgentError> {
        if let InterceptAction::PassThrough(reason) = self.filter.classify(&request) {
            debug!(url = %request.url, method = %request.method, ?reason, "Passing through");
            return Ok(FetchOutcome::PassThrough(reason));
        }

        match self.config.policy {
            PolicyKind::CacheFirst => self.cache_first(request).await,
            PolicyKind::NetworkFirst => self.network_first(request).await,
        }
    }
}
