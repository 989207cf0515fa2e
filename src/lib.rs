//! octo-sw - an offline-first cache for a single web origin.
//!
//! A [`ServiceWorker`] pre-caches an origin's core assets on install, purges
//! stale cache versions on activation, and answers requests cache-first,
//! falling back to the network and then to a cached fallback document when
//! the network is unreachable. A [`Registration`] owns the worker versions of
//! an origin and routes requests to the active one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use octo_sw::{FetchRequest, HttpNetwork, MemoryCacheStorage, Registration, WorkerConfig};
//!
//! # async fn example() -> octo_sw::Result<()> {
//! let origin = url::Url::parse("http://127.0.0.1:8080")?;
//! let registration = Registration::new(
//!     Arc::new(MemoryCacheStorage::new()),
//!     Arc::new(HttpNetwork::new(reqwest::Client::new())),
//! );
//!
//! // Pre-cache the shell and take control
//! let config = WorkerConfig::new()
//!     .with_origin(origin.clone())
//!     .with_version("site-v2")
//!     .with_precache(["/", "/app.js"]);
//! registration.register(config).await?;
//!
//! // Served from cache even when the origin is down
//! let outcome = registration.fetch(FetchRequest::get(origin.join("/app.js")?)).await;
//! println!("{} from {}", outcome.response.status, outcome.source);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod format;
pub mod http;
pub mod network;
pub mod registration;
pub mod script;
pub mod stats;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use cache::{CacheStorage, DiskCacheStorage, MemoryCacheStorage, open_storage};
pub use clients::{ClientInfo, Clients};
pub use config::{
    AppConfig, FallbackPolicy, ServerConfig, StorageConfig, StorageKind, Strategy, WorkerConfig,
};
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration, format_percent};
pub use http::{CachedResponse, FetchRequest, RequestKey, RequestMode};
pub use network::{HttpNetwork, Network};
pub use registration::{Registration, RegistrationStatus};
pub use stats::{FetchStats, FetchStatsSnapshot, ResponseSource};
pub use worker::{FetchOutcome, ServiceWorker, WorkerState};
