//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use url::Url;

use crate::cache::{CacheStorage, MemoryCacheStorage};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::http::{CachedResponse, FetchRequest, RequestKey};
use crate::network::Network;

pub const ORIGIN: &str = "https://site.test";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn config(version: &str) -> WorkerConfig {
    WorkerConfig::new()
        .with_origin(Url::parse(ORIGIN).unwrap())
        .with_version(version)
        .with_precache(["/", "/app.js", "/style.css"])
}

/// A scripted network that records every request it sees.
pub struct MockNetwork {
    routes: Mutex<HashMap<String, CachedResponse>>,
    online: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A network serving the default pre-cache assets plus `/blog`.
    pub fn site() -> Self {
        let network = Self::new();
        network.serve("/", 200, "<html>home</html>");
        network.serve("/app.js", 200, "console.log(1)");
        network.serve("/style.css", 200, "body{}");
        network.serve("/blog", 200, "<html>blog</html>");
        network
    }

    pub fn serve(&self, path: &str, status: u16, body: &'static str) {
        self.serve_url(url(path), status, body);
    }

    pub fn serve_url(&self, url: Url, status: u16, body: &'static str) {
        let response = CachedResponse::new(url.clone(), status, body)
            .with_header("content-type", "text/plain");
        self.routes.lock().unwrap().insert(url.into(), response);
    }

    /// Makes `from` answer as if redirected to `to`.
    pub fn redirect(&self, from: Url, to: Url, body: &'static str) {
        let response = CachedResponse::new(to, 200, body);
        self.routes.lock().unwrap().insert(from.into(), response);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, request.url));
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            )));
        }
        let found = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        Ok(found.unwrap_or_else(|| CachedResponse::new(request.url.clone(), 404, "not found")))
    }
}

/// Storage whose writes always fail; reads go to an inner memory store.
#[derive(Default)]
pub struct ReadOnlyStorage {
    pub inner: MemoryCacheStorage,
}

#[async_trait]
impl CacheStorage for ReadOnlyStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn delete(&self, _name: &str) -> Result<bool> {
        Err(Error::Storage("read-only".to_string()))
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        self.inner.get(name, key).await
    }

    async fn put(&self, _name: &str, _key: &RequestKey, _response: &CachedResponse) -> Result<()> {
        Err(Error::Storage("read-only".to_string()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        self.inner.entries(name).await
    }
}

/// Storage whose reads or deletions can be switched to fail; everything else
/// goes to an inner memory store.
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryCacheStorage,
    reads: AtomicBool,
    deletes: AtomicBool,
}

impl FaultyStorage {
    pub fn fail_reads(&self, fail: bool) {
        self.reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.deletes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Storage(format!("{what} unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStorage for FaultyStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Self::check(&self.reads, "read")?;
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Self::check(&self.reads, "read")?;
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Self::check(&self.deletes, "delete")?;
        self.inner.delete(name).await
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        Self::check(&self.reads, "read")?;
        self.inner.get(name, key).await
    }

    async fn put(&self, name: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
        self.inner.put(name, key, response).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
        Self::check(&self.reads, "read")?;
        self.inner.entries(name).await
    }
}
