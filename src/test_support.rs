//! In-memory doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;
use crate::store::{CacheStorage, EntryInfo, MemoryStorage};

pub const ORIGIN: &str = "https://presentes.example.com/";

pub fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
    origin().join(path).unwrap()
}

/// Scripted origin server. Unknown paths answer 404.
pub struct StubNetwork {
    routes: Mutex<HashMap<String, Response>>,
    online: AtomicBool,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, path: &str, content_type: &str, body: &str) -> Self {
        self.set(path, content_type, body);
        self
    }

    pub fn set(&self, path: &str, content_type: &str, body: &str) {
        let response = Response::new(200, body.to_string()).with_header("content-type", content_type);
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), response);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every URL fetched so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    /// Body currently served for `path`.
    pub fn body(&self, path: &str) -> Bytes {
        self.routes.lock().unwrap()[url(path).as_str()].body.clone()
    }
}

#[async_trait]
impl Network for StubNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(request.url.to_string());
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Offline);
        }
        let mut key = request.url.clone();
        key.set_fragment(None);
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(key.as_str())
            .cloned()
            .unwrap_or_else(|| Response::new(404, "not found")))
    }
}

/// The gift-list site: precache entries plus a few pages and assets.
pub fn site() -> StubNetwork {
    StubNetwork::new()
        .with("/", "text/html; charset=utf-8", "<h1>Lista de Presentes</h1>")
        .with(
            "/static/manifest.json",
            "application/manifest+json",
            r#"{"name":"Lista de Presentes","start_url":"/"}"#,
        )
        .with("/static/icons/icon-192x192.svg", "image/svg+xml", "<svg width=\"192\"/>")
        .with("/static/icons/icon-512x512.svg", "image/svg+xml", "<svg width=\"512\"/>")
        .with("/static/css/app.css", "text/css", "body { margin: 0 }")
        .with("/static/js/app.js", "text/javascript", "console.log('ok')")
        .with("/presentes/", "text/html", "<ul><li>Bicicleta</li></ul>")
}

/// Memory storage whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        self.inner.has(cache).await
    }

    async fn open(&self, cache: &str) -> Result<()> {
        self.inner.open(cache).await
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        self.inner.delete(cache).await
    }

    async fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
        self.check()?;
        self.inner.put(cache, key, response).await
    }

    async fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
        self.check()?;
        self.inner.put_all(cache, entries).await
    }

    async fn match_key(&self, cache: &str, key: &RequestKey) -> Result<Option<Response>> {
        self.inner.match_key(cache, key).await
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryInfo>> {
        self.inner.entries(cache).await
    }
}
