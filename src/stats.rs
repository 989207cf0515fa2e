//! Fetch outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    /// Served from a cache store without touching the network.
    Cache,
    /// Served from the network.
    Network,
    /// The network failed and the cached fallback document was served.
    Fallback,
    /// The network failed and no fallback was available.
    Offline,
}

impl ResponseSource {
    /// Returns the lowercase name used in logs and response headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Fallback => "fallback",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of [`FetchStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStatsSnapshot {
    /// Responses served from cache.
    pub cache_hits: u64,
    /// Responses served from the network.
    pub network: u64,
    /// Fallback documents served.
    pub fallbacks: u64,
    /// Offline responses served.
    pub offline: u64,
    /// Network responses written to the cache.
    pub stored: u64,
    /// Body bytes served in total.
    pub bytes_served: u64,
    /// Seconds since the counters were created.
    pub uptime_secs: u64,
}

impl FetchStatsSnapshot {
    /// Total number of fetches handled.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.cache_hits + self.network + self.fallbacks + self.offline
    }

    /// Fraction of fetches answered without the network, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn offline_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.cache_hits + self.fallbacks + self.offline) as f64 / total as f64
        }
    }
}

/// Lock-free counters updated by concurrent fetches.
#[derive(Debug)]
pub struct FetchStats {
    started: Instant,
    cache_hits: AtomicU64,
    network: AtomicU64,
    fallbacks: AtomicU64,
    offline: AtomicU64,
    stored: AtomicU64,
    bytes_served: AtomicU64,
}

impl Default for FetchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cache_hits: AtomicU64::new(0),
            network: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            offline: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
        }
    }

    /// Records one served response.
    pub fn record(&self, source: ResponseSource, bytes: u64) {
        let counter = match source {
            ResponseSource::Cache => &self.cache_hits,
            ResponseSource::Network => &self.network,
            ResponseSource::Fallback => &self.fallbacks,
            ResponseSource::Offline => &self.offline,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one response written to the cache.
    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network: self.network.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_stats_default() {
        let stats = FetchStats::default().snapshot();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.stored, 0);
        assert!(stats.offline_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn record_counts_by_source() {
        let stats = FetchStats::new();
        stats.record(ResponseSource::Cache, 100);
        stats.record(ResponseSource::Cache, 50);
        stats.record(ResponseSource::Network, 10);
        stats.record(ResponseSource::Fallback, 1);
        stats.record_stored();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.network, 1);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.offline, 0);
        assert_eq!(snap.stored, 1);
        assert_eq!(snap.bytes_served, 161);
        assert_eq!(snap.total(), 4);
        assert!((snap.offline_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn response_source_names() {
        assert_eq!(ResponseSource::Cache.to_string(), "cache");
        assert_eq!(ResponseSource::Offline.as_str(), "offline");
        assert_eq!(
            serde_json::to_string(&ResponseSource::Fallback).unwrap(),
            "\"fallback\""
        );
    }

    #[test]
    fn concurrent_records() {
        let stats = std::sync::Arc::new(FetchStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = std::sync::Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record(ResponseSource::Network, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().network, 1000);
    }
}
