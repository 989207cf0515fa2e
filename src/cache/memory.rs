//! In-process cache storage.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::http::{CachedResponse, RequestKey};

type Store = HashMap<RequestKey, CachedResponse>;

/// Cache storage held entirely in memory and lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    stores: RwLock<Vec<(String, Store)>>,
}

impl MemoryCacheStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("cache storage lock poisoned".to_string())
}

fn find<'a>(stores: &'a [(String, Store)], name: &str) -> Option<&'a Store> {
    stores.iter().find(|(n, _)| n == name).map(|(_, s)| s)
}

fn find_or_create<'a>(stores: &'a mut Vec<(String, Store)>, name: &str) -> &'a mut Store {
    let index = match stores.iter().position(|(n, _)| n == name) {
        Some(index) => index,
        None => {
            stores.push((name.to_string(), Store::new()));
            stores.len() - 1
        }
    };
    &mut stores[index].1
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let mut stores = self.stores.write().map_err(poisoned)?;
        find_or_create(&mut stores, name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        let stores = self.stores.read().map_err(poisoned)?;
        Ok(find(&stores, name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let stores = self.stores.read().map_err(poisoned)?;
        Ok(stores.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut stores = self.stores.write().map_err(poisoned)?;
        let before = stores.len();
        stores.retain(|(n, _)| n != name);
        Ok(stores.len() != before)
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        let stores = self.stores.read().map_err(poisoned)?;
        Ok(find(&stores, name).and_then(|s| s.get(key)).cloned())
    }

    async fn put(&self, name: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
        let mut stores = self.stores.write().map_err(poisoned)?;
        find_or_create(&mut stores, name).insert(key.clone(), response.clone());
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        let stores = self.stores.read().map_err(poisoned)?;
        let mut keys: Vec<_> = find(&stores, name)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn put_all(&self, name: &str, batch: &[(RequestKey, CachedResponse)]) -> Result<()> {
        let mut stores = self.stores.write().map_err(poisoned)?;
        let store = find_or_create(&mut stores, name);
        for (key, response) in batch {
            store.insert(key.clone(), response.clone());
        }
        Ok(())
    }
}
