//! Registry of pages (clients) a worker may control.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

/// A page that has been seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Stable client id.
    pub id: Uuid,
    /// URL the client was created for.
    pub url: Url,
    /// Version of the worker controlling this client, if any.
    pub controller: Option<String>,
    /// When the client was first seen.
    pub created: DateTime<Utc>,
}

/// Shared registry of clients.
#[derive(Debug, Default)]
pub struct Clients {
    inner: RwLock<Vec<ClientInfo>>,
}

impl Clients {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client for `url`, controlled by `controller` if given.
    pub fn register(&self, url: Url, controller: Option<String>) -> Uuid {
        let info = ClientInfo {
            id: Uuid::new_v4(),
            url,
            controller,
            created: Utc::now(),
        };
        let id = info.id;
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(info);
        id
    }

    /// Makes `version` the controller of every known client.
    ///
    /// Returns how many clients changed controller.
    pub fn claim(&self, version: &str) -> usize {
        let mut clients = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for client in clients.iter_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                changed += 1;
            }
        }
        changed
    }

    /// Returns the client with `id`.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ClientInfo> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Removes the client with `id`, returning whether it existed.
    pub fn forget(&self, id: Uuid) -> bool {
        let mut clients = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != before
    }

    /// Snapshot of every client.
    #[must_use]
    pub fn list(&self) -> Vec<ClientInfo> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of known clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no client is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
