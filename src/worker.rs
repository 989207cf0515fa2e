//! The worker itself: install, activate and fetch handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Method;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::{FallbackPolicy, Strategy, WorkerConfig};
use crate::error::{Error, Result};
use crate::format::format_bytes;
use crate::http::{CachedResponse, FetchRequest, RequestKey};
use crate::network::Network;
use crate::stats::{FetchStats, FetchStatsSnapshot, ResponseSource};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, install not yet started.
    Parsed,
    /// Pre-caching assets.
    Installing,
    /// Installed, waiting to activate.
    Installed,
    /// Purging stale caches.
    Activating,
    /// Controlling clients and handling fetches.
    Activated,
    /// Failed or replaced.
    Redundant,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parsed => write!(f, "parsed"),
            Self::Installing => write!(f, "installing"),
            Self::Installed => write!(f, "installed"),
            Self::Activating => write!(f, "activating"),
            Self::Activated => write!(f, "activated"),
            Self::Redundant => write!(f, "redundant"),
        }
    }
}

/// The response to an intercepted request and where it came from.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Response handed back to the client.
    pub response: CachedResponse,
    /// Where the response came from.
    pub source: ResponseSource,
}

impl FetchOutcome {
    const fn new(response: CachedResponse, source: ResponseSource) -> Self {
        Self { response, source }
    }

    fn offline(url: Url) -> Self {
        Self::new(CachedResponse::offline(url), ResponseSource::Offline)
    }
}

/// Whether a network response may be written back to the cache.
fn is_cacheable(config: &WorkerConfig, request: &FetchRequest, response: &CachedResponse) -> bool {
    request.method == Method::GET && response.ok() && config.is_same_origin(&response.url)
}

/// One version of the offline worker.
///
/// Shares cache storage, network and clients with every other version of the
/// same registration; owns its configuration and counters.
pub struct ServiceWorker {
    config: Arc<WorkerConfig>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    stats: Arc<FetchStats>,
    state: watch::Sender<WorkerState>,
    skip_waiting: AtomicBool,
    /// Set once the worker may no longer write to its store.
    retired: Arc<AtomicBool>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    /// Creates a worker in the [`WorkerState::Parsed`] state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<Clients>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(WorkerState::Parsed);
        Ok(Self {
            config: Arc::new(config),
            storage,
            network,
            clients,
            stats: Arc::new(FetchStats::new()),
            state,
            skip_waiting: AtomicBool::new(false),
            retired: Arc::new(AtomicBool::new(false)),
            tasks: TaskTracker::new(),
        })
    }

    /// Returns the worker configuration.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the cache version tag.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Returns the fetch counters.
    #[must_use]
    pub fn stats(&self) -> FetchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns true once a successful install asked to skip the waiting phase.
    ///
    /// Always false before install and after a failed install.
    #[must_use]
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        if state == WorkerState::Redundant {
            self.retire(true);
        }
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Worker {} {previous} -> {state}", self.config.version);
        }
    }

    /// Stops (or resumes) background write-backs. Writes already running are
    /// not interrupted; use [`settle`](Self::settle) to wait for them.
    pub(crate) fn retire(&self, retired: bool) {
        self.retired.store(retired, Ordering::Release);
    }

    fn expect_state(&self, expected: WorkerState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { expected, actual })
        }
    }

    /// Pre-caches every configured asset into the current version's store.
    ///
    /// All-or-nothing: if any asset fails to fetch or answers with a
    /// non-2xx status, nothing is written, the worker becomes
    /// [`WorkerState::Redundant`] and the error is returned. Assets already
    /// present in the store are not fetched again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precache`] for a failed asset, [`Error::InvalidState`]
    /// if the worker was not freshly created, or a storage error.
    pub async fn install(&self) -> Result<()> {
        self.expect_state(WorkerState::Parsed)?;
        self.set_state(WorkerState::Installing);

        match self.precache().await {
            Ok(fetched) => {
                log::info!(
                    "Installed {} ({fetched} fetched, {} listed)",
                    self.config.version,
                    self.config.precache.len()
                );
                self.skip_waiting
                    .store(self.config.skip_waiting, Ordering::Release);
                self.set_state(WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                log::warn!("Install of {} failed: {e}", self.config.version);
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize> {
        let version = self.config.version.as_str();
        self.storage.open(version).await?;

        let mut missing: Vec<(RequestKey, Url)> = Vec::new();
        for url in self.config.precache_urls()? {
            let key = RequestKey::get(&url);
            if missing.iter().any(|(k, _)| *k == key) {
                continue;
            }
            if self.storage.get(version, &key).await?.is_none() {
                missing.push((key, url));
            }
        }

        let fetched: Vec<(RequestKey, CachedResponse)> = stream::iter(missing)
            .map(|(key, url)| async move {
                let response = self
                    .network
                    .fetch(&FetchRequest::get(url.clone()))
                    .await
                    .map_err(|e| Error::Precache {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                if !response.ok() {
                    return Err(Error::Precache {
                        url: url.to_string(),
                        reason: format!("status {}", response.status),
                    });
                }
                Ok((key, response))
            })
            .buffer_unordered(self.config.install_concurrency)
            .try_collect()
            .await?;

        let bytes: u64 = fetched.iter().map(|(_, r)| r.body.len() as u64).sum();
        self.storage.put_all(version, &fetched).await?;
        if !fetched.is_empty() {
            log::info!(
                "Pre-cached {} assets ({}) into {version}",
                fetched.len(),
                format_bytes(bytes)
            );
        }
        Ok(fetched.len())
    }

    /// Deletes every cache store except the current version's, then claims
    /// all clients.
    ///
    /// Every deletion finishes before this returns. A failed deletion is
    /// returned as the activation error and the worker becomes
    /// [`WorkerState::Redundant`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the worker is not installed, or the
    /// storage error that stopped the purge.
    pub async fn activate(&self) -> Result<()> {
        self.expect_state(WorkerState::Installed)?;
        self.set_state(WorkerState::Activating);

        match self.purge().await {
            Ok(deleted) => {
                let claimed = self.clients.claim(&self.config.version);
                log::info!(
                    "Activated {} (purged {}, claimed {claimed} clients)",
                    self.config.version,
                    deleted.len()
                );
                self.set_state(WorkerState::Activated);
                Ok(())
            }
            Err(e) => {
                log::warn!("Activation of {} failed: {e}", self.config.version);
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn purge(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| *name != self.config.version)
            .collect();

        futures::future::try_join_all(stale.iter().map(|name| async move {
            self.storage.delete(name).await?;
            log::info!("Deleted stale cache {name}");
            Ok::<_, Error>(())
        }))
        .await?;
        Ok(stale)
    }

    /// Answers an intercepted request. Never fails: network errors degrade
    /// to the fallback document or an offline response.
    pub async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
        let outcome = self.respond(request).await;
        self.stats
            .record(outcome.source, outcome.response.body.len() as u64);
        outcome
    }

    async fn respond(&self, request: FetchRequest) -> FetchOutcome {
        if self.config.is_network_only(&request.url) {
            return match self.network.fetch(&request).await {
                Ok(response) => FetchOutcome::new(response, ResponseSource::Network),
                Err(e) => {
                    log::debug!("Network-only {} failed: {e}", request.url);
                    FetchOutcome::offline(request.url)
                }
            };
        }

        let key = request.key();
        if let Some(cached) = self.lookup(&key).await {
            log::debug!("Cache hit {key}");
            if self.config.strategy == Strategy::StaleWhileRevalidate {
                self.revalidate(request);
            }
            return FetchOutcome::new(cached, ResponseSource::Cache);
        }

        match self.network.fetch(&request).await {
            Ok(response) => {
                if is_cacheable(&self.config, &request, &response) {
                    self.store_in_background(key, response.clone());
                }
                FetchOutcome::new(response, ResponseSource::Network)
            }
            Err(e) => {
                log::info!("Network unavailable for {key}: {e}");
                self.fallback(&request).await
            }
        }
    }

    async fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
        match self.storage.match_any(key).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Cache lookup for {key} failed, treating as miss: {e}");
                None
            }
        }
    }

    async fn fallback(&self, request: &FetchRequest) -> FetchOutcome {
        let eligible = match self.config.fallback_policy {
            FallbackPolicy::All => true,
            FallbackPolicy::Navigation => request.is_navigation(),
            FallbackPolicy::Never => false,
        };
        if eligible {
            match self.config.fallback_url() {
                Ok(url) => {
                    if let Some(document) = self.lookup(&RequestKey::get(&url)).await {
                        return FetchOutcome::new(document, ResponseSource::Fallback);
                    }
                    log::debug!("Fallback {url} is not cached");
                }
                Err(e) => log::warn!("Bad fallback path: {e}"),
            }
        }
        FetchOutcome::offline(request.url.clone())
    }

    fn store_in_background(&self, key: RequestKey, response: CachedResponse) {
        let storage = Arc::clone(&self.storage);
        let stats = Arc::clone(&self.stats);
        let retired = Arc::clone(&self.retired);
        let version = self.config.version.clone();
        self.tasks.spawn(async move {
            if retired.load(Ordering::Acquire) {
                log::debug!("Dropping write-back of {key} from retired {version}");
                return;
            }
            match storage.put(&version, &key, &response).await {
                Ok(()) => {
                    stats.record_stored();
                    log::debug!("Cached {key} in {version}");
                }
                Err(e) => log::debug!("Ignoring cache write failure for {key}: {e}"),
            }
        });
    }

    fn revalidate(&self, request: FetchRequest) {
        let config = Arc::clone(&self.config);
        let network = Arc::clone(&self.network);
        let storage = Arc::clone(&self.storage);
        let stats = Arc::clone(&self.stats);
        let retired = Arc::clone(&self.retired);
        self.tasks.spawn(async move {
            let response = match network.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("Revalidation of {} failed: {e}", request.url);
                    return;
                }
            };
            if retired.load(Ordering::Acquire) {
                log::debug!("Dropping refresh of {} from retired {}", request.url, config.version);
                return;
            }
            if is_cacheable(&config, &request, &response) {
                let key = request.key();
                match storage.put(&config.version, &key, &response).await {
                    Ok(()) => {
                        stats.record_stored();
                        log::debug!("Refreshed {key}");
                    }
                    Err(e) => log::debug!("Ignoring cache write failure for {key}: {e}"),
                }
            }
        });
    }

    /// Waits for every background cache write started so far.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
