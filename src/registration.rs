//! Registration: installs worker versions and routes fetches to the active one.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::http::{CachedResponse, FetchRequest};
use crate::network::Network;
use crate::stats::{FetchStatsSnapshot, ResponseSource};
use crate::worker::{FetchOutcome, ServiceWorker, WorkerState};

/// Snapshot of a registration for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
    /// Version of the active worker.
    pub active: Option<String>,
    /// State of the active worker.
    pub state: Option<WorkerState>,
    /// Version of the installed worker waiting to activate.
    pub waiting: Option<String>,
    /// Cache store names in creation order.
    pub caches: Vec<String>,
    /// Number of known clients.
    pub clients: usize,
    /// Fetch counters of the active worker.
    pub stats: FetchStatsSnapshot,
}

/// Owns the shared storage, network and clients of an origin and the
/// active/waiting worker slots.
pub struct Registration {
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    active: RwLock<Option<Arc<ServiceWorker>>>,
    waiting: RwLock<Option<Arc<ServiceWorker>>>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Creates a registration with no worker.
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
        Self {
            storage,
            network,
            clients: Arc::new(Clients::new()),
            active: RwLock::new(None),
            waiting: RwLock::new(None),
        }
    }

    /// Returns the shared cache storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Returns the client registry.
    #[must_use]
    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// Returns the active worker.
    #[must_use]
    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the installed worker waiting to activate.
    #[must_use]
    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.waiting
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a worker for `config` and activates it when it asked to skip
    /// waiting or nothing is active yet.
    ///
    /// If install fails, the previously active worker stays in control.
    ///
    /// # Errors
    ///
    /// Returns the install or activation error.
    pub async fn register(&self, config: WorkerConfig) -> Result<Arc<ServiceWorker>> {
        let worker = Arc::new(ServiceWorker::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.network),
            Arc::clone(&self.clients),
        )?);

        if let Err(e) = worker.install().await {
            if let Some(active) = self.active() {
                log::warn!("Keeping {} active", active.version());
            }
            return Err(e);
        }

        if worker.skip_waiting_requested() || self.active().is_none() {
            self.promote(Arc::clone(&worker)).await?;
        } else {
            let previous = self
                .waiting
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(Arc::clone(&worker));
            if let Some(previous) = previous {
                previous.set_state(WorkerState::Redundant);
            }
            log::info!("Worker {} is waiting", worker.version());
        }
        Ok(worker)
    }

    /// Activates the waiting worker, if any.
    ///
    /// Returns true if a worker was activated.
    ///
    /// # Errors
    ///
    /// Returns the activation error.
    pub async fn activate_waiting(&self) -> Result<bool> {
        let waiting = self
            .waiting
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match waiting {
            Some(worker) => {
                self.promote(worker).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Activates `worker` and makes it the active one.
    ///
    /// The current worker stops writing back and its pending writes finish
    /// before the purge runs, so no stale store survives activation. If
    /// activation fails it resumes writing and stays active.
    async fn promote(&self, worker: Arc<ServiceWorker>) -> Result<()> {
        let current = self.active();
        if let Some(current) = &current {
            current.retire(true);
            current.settle().await;
        }

        if let Err(e) = worker.activate().await {
            if let Some(current) = &current {
                current.retire(false);
                log::warn!("Keeping {} active", current.version());
            }
            return Err(e);
        }

        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(worker);
        if let Some(previous) = previous {
            previous.settle().await;
            previous.set_state(WorkerState::Redundant);
        }
        Ok(())
    }

    /// Registers a client page controlled by the active worker.
    pub fn register_client(&self, url: Url) -> Uuid {
        let controller = self.active().map(|w| w.version().to_string());
        self.clients.register(url, controller)
    }

    /// Routes `request` to the active worker, or straight to the network when
    /// none is active.
    pub async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
        if let Some(worker) = self.active() {
            return worker.fetch(request).await;
        }
        match self.network.fetch(&request).await {
            Ok(response) => FetchOutcome {
                response,
                source: ResponseSource::Network,
            },
            Err(e) => {
                log::info!("No active worker and network failed for {}: {e}", request.url);
                FetchOutcome {
                    response: CachedResponse::offline(request.url),
                    source: ResponseSource::Offline,
                }
            }
        }
    }

    /// Waits for pending background cache writes of the active worker.
    pub async fn settle(&self) {
        if let Some(worker) = self.active() {
            worker.settle().await;
        }
    }

    /// Reports the current registration state.
    ///
    /// # Errors
    ///
    /// Returns an error if cache store names cannot be listed.
    pub async fn status(&self) -> Result<RegistrationStatus> {
        let active = self.active();
        Ok(RegistrationStatus {
            active: active.as_ref().map(|w| w.version().to_string()),
            state: active.as_ref().map(|w| w.state()),
            waiting: self.waiting().map(|w| w.version().to_string()),
            caches: self.storage.keys().await?,
            clients: self.clients.len(),
            stats: active.map(|w| w.stats()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::http::RequestKey;
    use crate::config::Strategy;
    use crate::testing::{FaultyStorage, MockNetwork, config, url};

    fn registration() -> (Registration, Arc<MockNetwork>) {
        let network = Arc::new(MockNetwork::site());
        let registration = Registration::new(
            Arc::new(MemoryCacheStorage::new()),
            Arc::clone(&network) as Arc<dyn Network>,
        );
        (registration, network)
    }

    #[tokio::test]
    async fn register_installs_and_activates() {
        let (reg, _) = registration();
        let worker = reg.register(config("site-v1")).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
        assert_eq!(reg.active().unwrap().version(), "site-v1");
        assert!(reg.waiting().is_none());
    }

    #[tokio::test]
    async fn new_version_replaces_old_and_purges_its_cache() {
        let (reg, _) = registration();
        let old = reg.register(config("site-v1")).await.unwrap();
        reg.register(config("site-v2")).await.unwrap();

        assert_eq!(old.state(), WorkerState::Redundant);
        assert_eq!(reg.active().unwrap().version(), "site-v2");
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v2"]);
    }

    #[tokio::test]
    async fn failed_install_keeps_previous_version() {
        let (reg, network) = registration();
        reg.register(config("site-v1")).await.unwrap();

        network.serve("/app.js", 404, "gone");
        let result = reg.register(config("site-v2")).await;
        assert!(result.is_err());
        assert_eq!(reg.active().unwrap().version(), "site-v1");
        assert_eq!(reg.active().unwrap().state(), WorkerState::Activated);
        assert!(reg.storage().has("site-v1").await.unwrap());
    }

    #[tokio::test]
    async fn fetch_without_active_worker_passes_through() {
        let (reg, network) = registration();
        let outcome = reg.fetch(FetchRequest::get(url("/blog"))).await;
        assert_eq!(outcome.source, ResponseSource::Network);
        assert!(reg.storage().keys().await.unwrap().is_empty());

        network.set_online(false);
        let offline = reg.fetch(FetchRequest::get(url("/blog"))).await;
        assert_eq!(offline.source, ResponseSource::Offline);
    }

    #[tokio::test]
    async fn fetch_routes_through_active_worker() {
        let (reg, network) = registration();
        reg.register(config("site-v1")).await.unwrap();

        reg.fetch(FetchRequest::get(url("/blog"))).await;
        reg.settle().await;
        network.set_online(false);

        let outcome = reg.fetch(FetchRequest::get(url("/blog"))).await;
        assert_eq!(outcome.source, ResponseSource::Cache);
        let stored = reg
            .storage()
            .get("site-v1", &RequestKey::get(&url("/blog")))
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn clients_follow_active_version() {
        let (reg, _) = registration();
        let early = reg.register_client(url("/"));
        assert_eq!(reg.clients().get(early).unwrap().controller, None);

        reg.register(config("site-v1")).await.unwrap();
        assert_eq!(
            reg.clients().get(early).unwrap().controller.as_deref(),
            Some("site-v1")
        );
        let late = reg.register_client(url("/blog"));
        assert_eq!(
            reg.clients().get(late).unwrap().controller.as_deref(),
            Some("site-v1")
        );
    }

    #[tokio::test]
    async fn worker_without_skip_waiting_waits() {
        let (reg, _) = registration();
        reg.register(config("site-v1")).await.unwrap();
        let next = reg
            .register(config("site-v2").with_skip_waiting(false))
            .await
            .unwrap();

        assert_eq!(next.state(), WorkerState::Installed);
        assert_eq!(reg.active().unwrap().version(), "site-v1");
        assert_eq!(reg.waiting().unwrap().version(), "site-v2");
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v1", "site-v2"]);

        assert!(reg.activate_waiting().await.unwrap());
        assert_eq!(next.state(), WorkerState::Activated);
        assert!(reg.waiting().is_none());
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v2"]);
    }

    #[tokio::test]
    async fn first_worker_activates_even_without_skip_waiting() {
        let (reg, _) = registration();
        let worker = reg
            .register(config("site-v1").with_skip_waiting(false))
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn activate_waiting_without_worker_is_noop() {
        let (reg, _) = registration();
        assert!(!reg.activate_waiting().await.unwrap());
    }

    #[tokio::test]
    async fn status_reports_active_worker() {
        let (reg, _) = registration();
        reg.register(config("site-v1")).await.unwrap();
        reg.fetch(FetchRequest::get(url("/"))).await;

        let status = reg.status().await.unwrap();
        assert_eq!(status.active.as_deref(), Some("site-v1"));
        assert_eq!(status.state, Some(WorkerState::Activated));
        assert_eq!(status.caches, vec!["site-v1"]);
        assert_eq!(status.stats.cache_hits, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "activated");
    }

    #[tokio::test]
    async fn pending_write_back_does_not_revive_purged_store() {
        let (reg, _) = registration();
        reg.register(config("site-v1")).await.unwrap();

        // Miss goes to the network; its write-back is still queued.
        let outcome = reg.fetch(FetchRequest::get(url("/blog"))).await;
        assert_eq!(outcome.source, ResponseSource::Network);
        reg.register(config("site-v2")).await.unwrap();

        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v2"]);
        reg.settle().await;
        tokio::task::yield_now().await;
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v2"]);
    }

    #[tokio::test]
    async fn pending_refresh_does_not_revive_purged_store() {
        let (reg, _) = registration();
        reg.register(config("site-v1").with_strategy(Strategy::StaleWhileRevalidate))
            .await
            .unwrap();

        let outcome = reg.fetch(FetchRequest::get(url("/app.js"))).await;
        assert_eq!(outcome.source, ResponseSource::Cache);
        reg.register(config("site-v2")).await.unwrap();
        reg.settle().await;

        assert_eq!(reg.storage().keys().await.unwrap(), vec!["site-v2"]);
    }

    #[tokio::test]
    async fn failed_activation_keeps_previous_worker_writing() {
        let storage = Arc::new(FaultyStorage::default());
        let reg = Registration::new(
            Arc::clone(&storage) as Arc<dyn CacheStorage>,
            Arc::new(MockNetwork::site()),
        );
        let v1 = reg.register(config("site-v1")).await.unwrap();

        storage.fail_deletes(true);
        assert!(reg.register(config("site-v2")).await.is_err());
        assert_eq!(reg.active().unwrap().version(), "site-v1");
        assert_eq!(v1.state(), WorkerState::Activated);

        reg.fetch(FetchRequest::get(url("/blog"))).await;
        reg.settle().await;
        let stored = storage
            .inner
            .get("site-v1", &RequestKey::get(&url("/blog")))
            .await
            .unwrap();
        assert!(stored.is_some());
    }
}
