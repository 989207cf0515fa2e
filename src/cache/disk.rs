//! Cache storage persisted as JSON files.
//!
//! Layout under the root directory:
//!
//! ```text
//! caches.json                      store names in creation order
//! <base64url(name)>/<sha256>.json  one file per entry
//! ```
//!
//! Every file is written to a unique `.part` sibling and renamed into place,
//! so a reader never observes a half-written entry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use url::Url;

use super::CacheStorage;
use crate::error::{Error, Result};
use crate::http::{CachedResponse, RequestKey};

const MANIFEST: &str = "caches.json";

/// On-disk form of one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    url: Url,
    status: u16,
    headers: Vec<(String, String)>,
    /// Base64 encoded body.
    body: String,
    stored_at: DateTime<Utc>,
}

impl StoredEntry {
    fn new(key: &RequestKey, response: &CachedResponse) -> Self {
        Self {
            key: key.clone(),
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
            stored_at: Utc::now(),
        }
    }

    fn into_response(self) -> Result<CachedResponse> {
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|e| Error::Storage(format!("corrupt body for {}: {e}", self.key)))?;
        Ok(CachedResponse {
            url: self.url,
            status: self.status,
            headers: self.headers,
            body: body.into(),
        })
    }
}

/// Cache storage rooted at a directory, surviving process restarts.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    /// Serializes manifest read-modify-write cycles.
    manifest: Mutex<()>,
}

impl DiskCacheStorage {
    /// Opens (creating if needed) the storage rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            manifest: Mutex::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(name))
    }

    fn entry_path(&self, name: &str, key: &RequestKey) -> PathBuf {
        let digest = Sha256::digest(key.to_string().as_bytes());
        self.store_dir(name).join(format!("{digest:x}.json"))
    }

    async fn read_manifest(&self) -> Result<Vec<String>> {
        match tokio::fs::read(self.root.join(MANIFEST)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, names: &[String]) -> Result<()> {
        write_atomic(&self.root.join(MANIFEST), &serde_json::to_vec_pretty(names)?).await
    }
}

/// Writes `bytes` to a unique `.part` sibling of `path`, then renames it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    let part = PathBuf::from(part);

    if let Err(e) = tokio::fs::write(&part, bytes).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&part, path).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let _guard = self.manifest.lock().await;
        let mut names = self.read_manifest().await?;
        if !names.iter().any(|n| n == name) {
            tokio::fs::create_dir_all(self.store_dir(name)).await?;
            names.push(name.to_string());
            self.write_manifest(&names).await?;
            log::debug!("Created cache store {name}");
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.read_manifest().await?.iter().any(|n| n == name))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.read_manifest().await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.manifest.lock().await;
        let mut names = self.read_manifest().await?;
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Ok(false);
        }
        self.write_manifest(&names).await?;
        match tokio::fs::remove_dir_all(self.store_dir(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        match tokio::fs::read(self.entry_path(name, key)).await {
            Ok(bytes) => {
                let entry: StoredEntry = serde_json::from_slice(&bytes)?;
                // sha256 collisions aside, guard against a file from another key
                if entry.key != *key {
                    return Ok(None);
                }
                entry.into_response().map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
        self.open(name).await?;
        let bytes = serde_json::to_vec(&StoredEntry::new(key, response))?;
        write_atomic(&self.entry_path(name, key), &bytes).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        let mut dir = match tokio::fs::read_dir(self.store_dir(name)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let entry: StoredEntry = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
            keys.push(entry.key);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests as shared;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, DiskCacheStorage) {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::open_at(dir.path().join("caches")).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn open_is_idempotent_and_ordered() {
        let (_dir, storage) = storage().await;
        shared::open_is_idempotent_and_ordered(&storage).await;
    }

    #[tokio::test]
    async fn put_get_replace() {
        let (_dir, storage) = storage().await;
        shared::put_get_replace(&storage).await;
    }

    #[tokio::test]
    async fn delete_removes_entries() {
        let (_dir, storage) = storage().await;
        shared::delete_removes_entries(&storage).await;
    }

    #[tokio::test]
    async fn match_any_searches_in_order() {
        let (_dir, storage) = storage().await;
        shared::match_any_searches_in_order(&storage).await;
    }

    #[tokio::test]
    async fn match_any_ignores_non_get() {
        let (_dir, storage) = storage().await;
        shared::match_any_ignores_non_get(&storage).await;
    }

    #[tokio::test]
    async fn put_all_stores_batch() {
        let (_dir, storage) = storage().await;
        shared::put_all_stores_batch(&storage).await;
    }

    #[tokio::test]
    async fn survives_reopen() {
        let (dir, storage) = storage().await;
        let (key, resp) = shared::response("https://a.test/", "<html>");
        storage.put("site-v1", &key, &resp).await.unwrap();
        drop(storage);

        let reopened = DiskCacheStorage::open_at(dir.path().join("caches")).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["site-v1"]);
        assert_eq!(reopened.get("site-v1", &key).await.unwrap(), Some(resp));
    }

    #[tokio::test]
    async fn store_names_with_slashes_stay_inside_root() {
        let (_dir, storage) = storage().await;
        storage.open("../escape/v1").await.unwrap();
        let store = storage.store_dir("../escape/v1");
        assert!(store.starts_with(storage.root()));
        assert!(store.is_dir());
    }

    #[tokio::test]
    async fn no_part_files_left_behind() {
        let (_dir, storage) = storage().await;
        let (key, resp) = shared::response("https://a.test/app.js", "js");
        storage.put("v1", &key, &resp).await.unwrap();

        let mut dir = std::fs::read_dir(storage.store_dir("v1")).unwrap();
        assert!(dir.all(|e| !e.unwrap().path().to_string_lossy().ends_with(".part")));
    }
}
