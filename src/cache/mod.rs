//! Named, versioned cache stores of request/response pairs.

mod disk;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageConfig, StorageKind};
use crate::error::Result;
use crate::http::{CachedResponse, RequestKey};

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

/// Abstraction over the storage holding every cache store of an origin.
///
/// Individual reads and writes are atomic per entry; callers need no extra
/// locking. Store names are kept in creation order.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the store `name` if it does not exist yet.
    async fn open(&self, name: &str) -> Result<()>;

    /// Returns true if the store `name` exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Lists every store name in creation order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Deletes the store `name` and all of its entries.
    ///
    /// Returns false if there was no such store.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Looks up `key` in the store `name`.
    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

    /// Stores `response` under `key` in the store `name`, creating the store
    /// if needed and replacing any previous entry.
    async fn put(&self, name: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

    /// Lists the keys of the store `name`.
    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>>;

    /// Stores every pair in `batch` into the store `name`.
    async fn put_all(&self, name: &str, batch: &[(RequestKey, CachedResponse)]) -> Result<()> {
        self.open(name).await?;
        for (key, response) in batch {
            self.put(name, key, response).await?;
        }
        Ok(())
    }

    /// Looks up `key` across every store in creation order.
    ///
    /// Only `GET` keys ever match.
    async fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
        if !key.is_get() {
            return Ok(None);
        }
        for name in self.keys().await? {
            if let Some(response) = self.get(&name, key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Opens the storage backend described by `config`.
///
/// # Errors
///
/// Returns an error if the disk backend's root cannot be created.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn CacheStorage>> {
    Ok(match config.kind {
        StorageKind::Memory => Arc::new(MemoryCacheStorage::new()),
        StorageKind::Disk => {
            log::debug!("Opening cache storage at {}", config.path.display());
            Arc::new(DiskCacheStorage::open_at(&config.path).await?)
        }
    })
}
