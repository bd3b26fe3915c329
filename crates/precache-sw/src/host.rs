//! Host side of the agent: phase ordering, worker state and clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use precache_net::{Fetcher, Request};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::agent::{
    ActivationReport, FetchOutcome, FetchResponse, InstallReport, LifecycleHandler, OfflineAgent,
    ResponseSource,
};
use crate::clients::{Client, ClientRegistry};
use crate::config::AgentConfig;
use crate::storage::CacheStorage;
use crate::{send_event, AgentError, AgentEvent, EVENT_CAPACITY};

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceWorkerState {
    /// Created, nothing run yet.
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and intercepting requests.
    Activated,
    /// Install failed; this worker will never activate.
    Redundant,
}

impl Default for ServiceWorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

/// A worker instance for one version tag.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Store generation this worker owns.
    pub version_tag: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(version_tag: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version_tag: version_tag.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }
}

/// Runs the agent's phases in order and routes page requests through it.
///
/// Install must succeed before activate runs, and fetches are only handed
/// to the agent once it is active. Until then, and for every request the
/// agent passes through, the host goes straight to the network.
pub struct ServiceWorkerHost {
    agent: Arc<OfflineAgent>,
    network: Arc<dyn Fetcher>,
    worker: RwLock<ServiceWorker>,
    clients: RwLock<ClientRegistry>,
    event_tx: mpsc::Sender<AgentEvent>,
}

impl ServiceWorkerHost {
    /// Create a host and the receiver for its events.
    ///
    /// The queue holds [`EVENT_CAPACITY`] events; later ones are dropped
    /// until the receiver catches up.
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::Receiver<AgentEvent>), AgentError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let worker = ServiceWorker::new(config.version_tag.clone());
        let agent =
            OfflineAgent::new(config, storage, Arc::clone(&network))?.with_events(event_tx.clone());

        info!(version_tag = %worker.version_tag, policy = ?agent.config().policy, "Worker registered");

        let host = Self {
            agent: Arc::new(agent),
            network,
            worker: RwLock::new(worker),
            clients: RwLock::new(ClientRegistry::new()),
            event_tx,
        };
        Ok((host, event_rx))
    }

    pub fn agent(&self) -> &OfflineAgent {
        &self.agent
    }

    /// Snapshot of the worker.
    pub async fn worker(&self) -> ServiceWorker {
        self.worker.read().await.clone()
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.worker.read().await.state
    }

    async fn transition(&self, state: ServiceWorkerState, error: Option<String>) {
        let version_tag = {
            let mut worker = self.worker.write().await;
            worker.set_state(state);
            if error.is_some() {
                worker.error = error;
            }
            worker.version_tag.clone()
        };
        debug!(version_tag = %version_tag, ?state, "Worker state changed");
        send_event(
            &self.event_tx,
            AgentEvent::StateChange {
                version_tag,
                new_state: state,
            },
        );
    }

    async fn expect_state(
        &self,
        expected: ServiceWorkerState,
        phase: &str,
    ) -> Result<(), AgentError> {
        let state = self.state().await;
        if state != expected {
            return Err(AgentError::State(format!(
                "cannot {phase} a worker in state {state:?}"
            )));
        }
        Ok(())
    }

    /// Run the install phase.
    ///
    /// On failure the worker becomes redundant and can never be activated.
    pub async fn install(&self) -> Result<InstallReport, AgentError> {
        self.expect_state(ServiceWorkerState::Parsed, "install").await?;
        self.transition(ServiceWorkerState::Installing, None).await;

        match self.agent.install().await {
            Ok(report) => {
                self.transition(ServiceWorkerState::Installed, None).await;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Install failed, worker is redundant");
                self.transition(ServiceWorkerState::Redundant, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Run the activate phase and claim open pages.
    ///
    /// Cleanup trouble never blocks activation.
    pub async fn activate(&self) -> Result<ActivationReport, AgentError> {
        self.expect_state(ServiceWorkerState::Installed, "activate").await?;
        self.transition(ServiceWorkerState::Activating, None).await;

        let report = match self.agent.activate().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Could not enumerate stores, skipping cleanup");
                ActivationReport {
                    current: self.agent.version_tag().to_string(),
                    claim_clients: true,
                    ..Default::default()
                }
            }
        };

        self.transition(ServiceWorkerState::Activated, None).await;
        if report.claim_clients {
            self.claim_clients().await;
        }
        Ok(report)
    }

    /// Install then activate.
    pub async fn start(&self) -> Result<(InstallReport, ActivationReport), AgentError> {
        let installed = self.install().await?;
        let activated = self.activate().await?;
        Ok((installed, activated))
    }

    /// Take over an existing store without installing again.
    ///
    /// Used when the agent restarts with a version whose store was fully
    /// populated by an earlier run. A store missing any manifest resource
    /// (absent, or left empty by a failed install) is refused.
    pub async fn resume(&self) -> Result<(), AgentError> {
        self.expect_state(ServiceWorkerState::Parsed, "resume").await?;
        let tag = self.agent.version_tag();
        if !self.agent.storage().has(tag).await? {
            return Err(AgentError::State(format!(
                "no store for version {tag}, install first"
            )));
        }
        let missing = self.agent.missing_resources().await?;
        if !missing.is_empty() {
            warn!(version_tag = %tag, missing = missing.len(), "Store is incomplete");
            return Err(AgentError::State(format!(
                "store for version {tag} is missing {} manifest resources, install first",
                missing.len()
            )));
        }

        info!(version_tag = %tag, "Resuming with existing store");
        self.transition(ServiceWorkerState::Activated, None).await;
        self.claim_clients().await;
        Ok(())
    }

    async fn claim_clients(&self) {
        let count = self
            .clients
            .write()
            .await
            .claim(self.agent.version_tag());
        info!(count, "Clients claimed");
        send_event(&self.event_tx, AgentEvent::ClientsClaimed { count });
    }

    /// Answer a page request.
    pub async fn fetch(&self, request: Request) -> Result<FetchResponse, AgentError> {
        if !self.worker.read().await.is_active() {
            debug!(url = %request.url, "Worker not active, fetching directly");
            return self.bypass(request).await;
        }

        match self.agent.fetch(request.clone()).await? {
            FetchOutcome::Respond(response) => Ok(response),
            FetchOutcome::PassThrough(_) => self.bypass(request).await,
        }
    }

    async fn bypass(&self, request: Request) -> Result<FetchResponse, AgentError> {
        let response = self.network.fetch(request).await?;
        Ok(FetchResponse::new(response, ResponseSource::Bypass))
    }

    /// Open a page. Pages opened under an active worker are controlled by it.
    pub async fn open_window(&self, url: &str) -> Result<Client, AgentError> {
        let active = self.worker.read().await.is_active();
        let mut clients = self.clients.write().await;
        let mut client = clients.open_window(url)?;
        if active {
            clients.claim(self.agent.version_tag());
            client.controller = Some(self.agent.version_tag().to_string());
        }
        Ok(client)
    }

    /// Every known page, controlled or not.
    pub async fn clients(&self) -> Vec<Client> {
        self.clients
            .read()
            .await
            .match_all(true)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{config, online_network, url, ScriptedNetwork};
    use crate::cache::CacheKey;
    use crate::config::PolicyKind;
    use crate::storage::MemoryCacheStorage;
    use http::Method;

    fn host(
        storage: &MemoryCacheStorage,
        network: &Arc<ScriptedNetwork>,
        policy: PolicyKind,
    ) -> (ServiceWorkerHost, mpsc::Receiver<AgentEvent>) {
        ServiceWorkerHost::new(
            config("v7", policy),
            Arc::new(storage.clone()),
            network.clone(),
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[AgentEvent]) -> Vec<ServiceWorkerState> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StateChange { new_state, .. } => Some(*new_state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_worker_defaults() {
        let worker = ServiceWorker::new("v7");
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
        assert_ne!(worker.id, ServiceWorker::new("v7").id);
    }

    #[tokio::test]
    async fn test_start_walks_every_state() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        let (host, mut rx) = host(&storage, &network, PolicyKind::CacheFirst);

        let (installed, activated) = host.start().await.unwrap();
        assert_eq!(installed.cached, 3);
        assert_eq!(activated.current, "v7");
        assert_eq!(host.state().await, ServiceWorkerState::Activated);

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
        assert!(events.contains(&AgentEvent::ClientsClaimed { count: 0 }));
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        let (host, _rx) = host(&storage, &network, PolicyKind::CacheFirst);

        assert!(matches!(host.activate().await, Err(AgentError::State(_))));
        assert_eq!(host.state().await, ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_failed_install_makes_worker_redundant() {
        let storage = MemoryCacheStorage::new();
        storage.open("v6").await.unwrap();
        let network = online_network();
        network.route(url("/").as_str(), 503, "");
        let (host, _rx) = host(&storage, &network, PolicyKind::CacheFirst);

        assert!(matches!(host.install().await, Err(AgentError::Install { .. })));

        let worker = host.worker().await;
        assert_eq!(worker.state, ServiceWorkerState::Redundant);
        assert!(worker.error.is_some());
        assert!(matches!(host.activate().await, Err(AgentError::State(_))));
        // The previous generation is left alone.
        assert!(storage.has("v6").await.unwrap());
    }

    #[tokio::test]
    async fn test_requests_before_activation_go_to_network() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        let (host, _rx) = host(&storage, &network, PolicyKind::CacheFirst);

        let response = host.fetch(Request::get(url("/"))).await.unwrap();
        assert_eq!(response.source, ResponseSource::Bypass);
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pass_through_is_fetched_untouched() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        network.route(url("/api/progress").as_str(), 200, "[]");
        let (host, _rx) = host(&storage, &network, PolicyKind::NetworkFirst);
        host.start().await.unwrap();

        let response = host.fetch(Request::get(url("/api/progress"))).await.unwrap();
        assert_eq!(response.source, ResponseSource::Bypass);
        assert_eq!(response.response.text().unwrap(), "[]");

        let post = host
            .fetch(Request::new(Method::POST, url("/auth/login")))
            .await
            .unwrap();
        assert_eq!(post.source, ResponseSource::Bypass);
        assert_eq!(storage.entries("v7").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_activation_claims_open_pages() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        let (host, mut rx) = host(&storage, &network, PolicyKind::CacheFirst);

        let early = host.open_window("https://leiseca.example/").await.unwrap();
        assert!(!early.is_controlled());

        host.start().await.unwrap();
        assert!(drain(&mut rx).contains(&AgentEvent::ClientsClaimed { count: 1 }));

        let late = host
            .open_window("https://leiseca.example/auth/login")
            .await
            .unwrap();
        assert_eq!(late.controller.as_deref(), Some("v7"));
        assert!(host.clients().await.iter().all(Client::is_controlled));
    }

    #[tokio::test]
    async fn test_resume_needs_existing_store() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();

        let (host_a, _rx) = host(&storage, &network, PolicyKind::NetworkFirst);
        assert!(matches!(host_a.resume().await, Err(AgentError::State(_))));
        assert_eq!(host_a.state().await, ServiceWorkerState::Parsed);

        host_a.start().await.unwrap();

        network.set_offline(true);
        let (host_b, _rx) = host(&storage, &network, PolicyKind::NetworkFirst);
        host_b.resume().await.unwrap();
        assert_eq!(host_b.state().await, ServiceWorkerState::Activated);

        let response = host_b.fetch(Request::get(url("/auth/signup"))).await.unwrap();
        assert_eq!(response.source, ResponseSource::OfflinePage);
    }

    #[tokio::test]
    async fn test_resume_refuses_store_left_by_failed_install() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        network.route(url("/").as_str(), 500, "");

        let (host_a, _rx) = host(&storage, &network, PolicyKind::NetworkFirst);
        assert!(matches!(host_a.install().await, Err(AgentError::Install { .. })));
        assert!(storage.has("v7").await.unwrap());

        network.set_offline(true);
        let (host_b, _rx) = host(&storage, &network, PolicyKind::NetworkFirst);
        assert_eq!(host_b.agent().missing_resources().await.unwrap().len(), 3);
        assert!(matches!(host_b.resume().await, Err(AgentError::State(_))));
        assert_eq!(host_b.state().await, ServiceWorkerState::Parsed);

        let response = host_b.fetch(Request::get(url("/"))).await;
        assert!(matches!(response, Err(AgentError::Network(_))));
    }

    #[tokio::test]
    async fn test_resume_refuses_partial_store() {
        let storage = MemoryCacheStorage::new();
        let network = online_network();
        let (host_a, _rx) = host(&storage, &network, PolicyKind::CacheFirst);
        host_a.start().await.unwrap();

        let offline = CacheKey::get(&url("/offline.html"));
        let mut remaining = storage.entries("v7").await.unwrap();
        remaining.retain(|e| e.key() != offline);
        storage.delete("v7").await.unwrap();
        storage.put_all("v7", remaining).await.unwrap();

        let (host_b, _rx) = host(&storage, &network, PolicyKind::CacheFirst);
        assert_eq!(
            host_b.agent().missing_resources().await.unwrap(),
            vec![url("/offline.html")]
        );
        assert!(matches!(host_b.resume().await, Err(AgentError::State(_))));
    }
}
