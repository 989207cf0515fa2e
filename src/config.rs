//! Configuration types for the worker, its cache storage and the proxy server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Cache version tag used when none is configured.
pub const DEFAULT_VERSION: &str = "octo-sw-v1";

/// Origin of the site served when none is configured.
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080";

/// Assets that must be available offline after install.
pub const DEFAULT_PRECACHE: &[&str] = &["/", "/index.html", "/manifest.json", "/icon-192.svg"];

/// Document served in place of a failed request.
pub const DEFAULT_FALLBACK: &str = "/";

/// Request-serving policy used by the fetch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve from cache when present; cached entries are never refreshed
    /// short of a version bump.
    #[default]
    CacheFirst,
    /// Serve from cache when present and refresh the entry in the background.
    StaleWhileRevalidate,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CacheFirst => write!(f, "cache-first"),
            Self::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
        }
    }
}

/// Which failed requests receive the cached fallback document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Every failed request gets the fallback document.
    #[default]
    All,
    /// Only navigation requests get the fallback document; others get the
    /// offline response.
    Navigation,
    /// No request gets the fallback document.
    Never,
}

/// True for an absolute path on the same origin. Protocol-relative paths
/// (`//host/x`) resolve to another host and are rejected.
fn is_origin_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//")
}

/// Immutable configuration of one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache version tag. Bumping it invalidates every older cache store on
    /// the next activation.
    pub version: String,
    /// Origin of the site this worker controls.
    pub origin: Url,
    /// Absolute paths to pre-cache on install.
    pub precache: Vec<String>,
    /// Absolute path of the document served when the network is unreachable.
    pub fallback: String,
    /// Path prefixes that always go to the network and are never cached.
    pub network_only: Vec<String>,
    /// Request-serving policy.
    pub strategy: Strategy,
    /// Which failed requests receive the fallback document.
    pub fallback_policy: FallbackPolicy,
    /// Maximum number of concurrent pre-cache fetches.
    pub install_concurrency: usize,
    /// Activate as soon as install succeeds instead of waiting for the
    /// previous version to be released.
    pub skip_waiting: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            origin: Url::parse(DEFAULT_ORIGIN).unwrap_or_else(|_| unreachable!("default origin parses")),
            precache: DEFAULT_PRECACHE.iter().map(ToString::to_string).collect(),
            fallback: DEFAULT_FALLBACK.to_string(),
            network_only: Vec::new(),
            strategy: Strategy::default(),
            fallback_policy: FallbackPolicy::default(),
            install_concurrency: 4,
            skip_waiting: true,
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the controlled origin.
    #[must_use]
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the pre-cache asset list.
    #[must_use]
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the fallback document path.
    #[must_use]
    pub fn with_fallback(mut self, path: impl Into<String>) -> Self {
        self.fallback = path.into();
        self
    }

    /// Sets the network-only path prefixes.
    #[must_use]
    pub fn with_network_only<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network_only = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the request-serving strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the fallback policy.
    #[must_use]
    pub const fn with_fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback_policy = policy;
        self
    }

    /// Sets the number of concurrent pre-cache fetches.
    #[must_use]
    pub const fn with_install_concurrency(mut self, concurrency: usize) -> Self {
        self.install_concurrency = concurrency;
        self
    }

    /// Sets whether a freshly installed worker skips the waiting phase.
    #[must_use]
    pub const fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting = skip;
        self
    }

    /// Checks that the configuration can drive a worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Config("version must not be empty".to_string()));
        }
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(Error::Config(format!(
                "origin must be an http(s) URL with a host, got {}",
                self.origin
            )));
        }
        if let Some(bad) = self.precache.iter().find(|p| !is_origin_path(p)) {
            return Err(Error::Config(format!(
                "precache path must be an absolute path on the origin: {bad}"
            )));
        }
        if !is_origin_path(&self.fallback) {
            return Err(Error::Config(format!(
                "fallback path must be an absolute path on the origin: {}",
                self.fallback
            )));
        }
        if self.install_concurrency == 0 {
            return Err(Error::Config(
                "install_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves an absolute path against the origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not form a valid URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        Ok(self.origin.join(path)?)
    }

    /// Resolves every pre-cache path, preserving order.
    ///
    /// # Errors
    ///
    /// Returns an error if any path does not form a valid URL.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Resolves the fallback document path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not form a valid URL.
    pub fn fallback_url(&self) -> Result<Url> {
        self.resolve(&self.fallback)
    }

    /// Returns true if `url` shares this worker's origin.
    #[must_use]
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Returns true if `url` is same-origin and under a network-only prefix.
    #[must_use]
    pub fn is_network_only(&self, url: &Url) -> bool {
        self.is_same_origin(url)
            && self
                .network_only
                .iter()
                .any(|prefix| url.path().starts_with(prefix.as_str()))
    }
}

/// Which cache storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// In-process storage, lost on exit.
    Memory,
    /// JSON files under [`StorageConfig::path`].
    #[default]
    Disk,
}

/// Cache storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind.
    pub kind: StorageKind,
    /// Root directory of the disk backend.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            kind: StorageKind::default(),
            path: cache_dir.join("octo-sw"),
        }
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Largest request body accepted, in bytes.
    pub body_limit: usize,
    /// Connect timeout for upstream requests, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9724,
            body_limit: 16 * 1024 * 1024,
            connect_timeout_secs: 10,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker configuration.
    pub worker: WorkerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Server configuration.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("octo-sw")
            .join("config.toml")
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.worker.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                log::info!("Loaded config from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
