//! Cache lifecycle and fetch-policy logic for one cache version.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Url;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::config::{CacheConfig, Strategy};
use crate::error::{Error, Result};
use crate::http::{Request, RequestKey, Response};
use crate::network::Network;
use crate::stats::CacheStats;
use crate::store::CacheStorage;
use crate::url::{Exclusions, has_extension, is_http, same_origin};
use crate::version::CacheVersion;

/// Trait for receiving precache progress updates.
///
/// All methods have default no-op implementations for convenience.
pub trait InstallProgress: Send + Sync {
    /// Called once before any fetch starts.
    fn on_install_start(&self, _cache: &str, _total: usize) {}

    /// Called when one precache entry was fetched successfully.
    fn on_fetched(&self, _url: &str, _bytes: u64) {}

    /// Called when a precache entry failed; the install will abort.
    fn on_error(&self, _url: &str, _error: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl InstallProgress for NoProgress {}

/// Result of a successful install or `CACHE_URLS` batch.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub cache_name: String,
    pub entries: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub cache_name: String,
    /// Stale caches removed.
    pub deleted: Vec<String>,
    /// Stale caches that could not be removed; retried on the next activation.
    pub failed: Vec<String>,
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
    Unavailable,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Cache => f.write_str("cache"),
            Self::OfflineFallback => f.write_str("offline-fallback"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Decision for one fetch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted: the request goes to the network untouched.
    Passthrough,
    /// Answered by the cache manager.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchOutcome {
    const fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond { response, source }
    }

    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Passthrough => None,
            Self::Respond { response, .. } => Some(response),
        }
    }

    #[must_use]
    pub const fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Passthrough => None,
            Self::Respond { source, .. } => Some(*source),
        }
    }
}

/// Owns one versioned named cache and answers fetch events for it.
pub struct CacheManager<S, N> {
    storage: Arc<S>,
    network: Arc<N>,
    config: Arc<CacheConfig>,
    exclusions: Arc<Exclusions>,
    origin: Url,
    version: CacheVersion,
    cache_name: String,
    stats: Arc<CacheStats>,
    tasks: TaskTracker,
    /// Writes into this version's cache, drained by [`CacheManager::retire`].
    stores: TaskTracker,
    retired: Arc<AtomicBool>,
}

impl<S, N> Clone for CacheManager<S, N> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            network: Arc::clone(&self.network),
            config: Arc::clone(&self.config),
            exclusions: Arc::clone(&self.exclusions),
            origin: self.origin.clone(),
            version: self.version.clone(),
            cache_name: self.cache_name.clone(),
            stats: Arc::clone(&self.stats),
            tasks: self.tasks.clone(),
            stores: self.stores.clone(),
            retired: Arc::clone(&self.retired),
        }
    }
}

impl<S, N> CacheManager<S, N>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    /// Creates a manager for the configured version.
    ///
    /// # Errors
    ///
    /// Returns an error if a bypass pattern does not compile.
    pub fn new(
        storage: Arc<S>,
        network: Arc<N>,
        config: CacheConfig,
        origin: Url,
    ) -> Result<Self> {
        let exclusions = Exclusions::new(&config.bypass)?;
        let version = config.version.clone();
        let cache_name = config.cache_name();
        Ok(Self {
            storage,
            network,
            config: Arc::new(config),
            exclusions: Arc::new(exclusions),
            origin,
            version,
            cache_name,
            stats: Arc::new(CacheStats::new()),
            tasks: TaskTracker::new(),
            stores: TaskTracker::new(),
            retired: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a manager for another version sharing storage, network and counters.
    ///
    /// The new manager retires independently of this one.
    #[must_use]
    pub fn with_version(&self, version: CacheVersion) -> Self {
        let mut manager = self.clone();
        manager.cache_name = version.cache_name(&self.config.prefix);
        manager.version = version;
        manager.stores = TaskTracker::new();
        manager.retired = Arc::new(AtomicBool::new(false));
        manager
    }

    /// Shares a pending-work tracker with the host.
    #[must_use]
    pub fn with_tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = tasks;
        self
    }

    /// Shares counters with the host.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    #[must_use]
    pub const fn version(&self) -> &CacheVersion {
        &self.version
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub fn network(&self) -> &N {
        &self.network
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Waits until every background cache write has finished.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stops writing into this version's cache and waits for writes in flight.
    ///
    /// Once this returns, deleting the cache cannot be undone by a late write.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.stores.close();
        self.stores.wait().await;
        log::debug!("Retired {}", self.cache_name);
    }

    /// Undoes [`Self::retire`] when the replacement could not take over.
    pub fn reinstate(&self) {
        self.retired.store(false, Ordering::SeqCst);
        self.stores.reopen();
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Install / activate
    // ========================================================================

    /// Fetches every precache URL and stores them all, or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first fetch, status or storage failure. When the cache did
    /// not exist before, it is removed again so no partial cache survives.
    pub async fn install(&self, progress: &dyn InstallProgress) -> Result<InstallReport> {
        log::info!(
            "Installing {} ({} precache entries)",
            self.cache_name,
            self.config.precache.len()
        );
        let result = self.add_all(&self.config.precache, progress).await;
        match &result {
            Ok(report) => log::info!(
                "Installed {}: {} entries, {} bytes",
                report.cache_name,
                report.entries,
                report.bytes
            ),
            Err(e) => log::error!("Install of {} failed: {e}", self.cache_name),
        }
        result
    }

    /// Fetches and stores a list of URLs into this cache, all-or-nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Self::install`].
    pub async fn add_all(
        &self,
        urls: &[String],
        progress: &dyn InstallProgress,
    ) -> Result<InstallReport> {
        let start = Instant::now();
        let requests = urls
            .iter()
            .map(|raw| crate::url::resolve(&self.origin, raw).map(Request::get))
            .collect::<Result<Vec<_>>>()?;

        progress.on_install_start(&self.cache_name, requests.len());

        let entries: Vec<(RequestKey, Response)> = stream::iter(requests)
            .map(|request| async move {
                let result = self.fetch_for_precache(&request).await;
                match &result {
                    Ok((_, response)) => {
                        progress.on_fetched(request.url.as_str(), response.body.len() as u64);
                    }
                    Err(e) => progress.on_error(request.url.as_str(), &e.to_string()),
                }
                result
            })
            .buffered(self.config.install_concurrency.max(1))
            .try_collect()
            .await?;

        self.stores.track_future(self.commit(&entries)).await?;

        Ok(InstallReport {
            cache_name: self.cache_name.clone(),
            entries: entries.len(),
            bytes: entries.iter().map(|(_, r)| r.body.len() as u64).sum(),
            elapsed: start.elapsed(),
        })
    }

    async fn fetch_for_precache(&self, request: &Request) -> Result<(RequestKey, Response)> {
        let response = self.network.fetch(request).await?;
        if !response.ok() {
            return Err(Error::Precache {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        Ok((request.key(), response))
    }

    /// Writes a fetched batch. A cache this call created is removed again on failure.
    async fn commit(&self, entries: &[(RequestKey, Response)]) -> Result<()> {
        if self.is_retired() {
            return Err(Error::Worker(format!(
                "{} was replaced by a newer version",
                self.cache_name
            )));
        }
        let existed = self.storage.has(&self.cache_name).await?;
        let written = match self.storage.open(&self.cache_name).await {
            Ok(()) => self.storage.put_all(&self.cache_name, entries).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            if !existed {
                if let Err(cleanup) = self.storage.delete(&self.cache_name).await {
                    log::warn!("Could not remove partial cache {}: {cleanup}", self.cache_name);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Deletes every cache whose name is not this version's cache name.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache names cannot be listed.
    pub async fn activate(&self) -> Result<ActivationReport> {
        log::info!("Activating {}", self.cache_name);
        let mut report = ActivationReport {
            cache_name: self.cache_name.clone(),
            ..ActivationReport::default()
        };

        for name in self.storage.keys().await? {
            if name == self.cache_name {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(_) => {
                    log::info!("Removed stale cache {name}");
                    report.deleted.push(name);
                }
                Err(e) => {
                    log::warn!("Could not remove stale cache {name}: {e}");
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Fetch handling
    // ========================================================================

    /// True for requests the cache must never touch.
    #[must_use]
    pub fn should_bypass(&self, request: &Request) -> bool {
        !is_http(&request.url)
            || !request.is_cacheable_method()
            || self.exclusions.matches(&request.url)
    }

    /// Whether a network response may be stored under the cache-first policy.
    #[must_use]
    pub fn is_cacheable(&self, request: &Request, response: &Response) -> bool {
        if response.status != 200 || !same_origin(&request.url, &self.origin) {
            return false;
        }
        let by_type = response.content_type().is_some_and(|ct| {
            self.config
                .cacheable_content_types
                .iter()
                .any(|prefix| ct.starts_with(&prefix.to_ascii_lowercase()))
        });
        by_type || has_extension(&request.url, &self.config.cacheable_extensions)
    }

    /// Answers a fetch event. Never fails: errors degrade to the best available response.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        if self.should_bypass(request) {
            self.stats.record_bypass();
            log::trace!("Bypassing {} {}", request.method, request.url);
            return FetchOutcome::Passthrough;
        }
        match self.config.strategy {
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: &Request) -> FetchOutcome {
        match self.network.fetch(request).await {
            Ok(response) => {
                self.stats.record_network();
                if response.status == 200 {
                    self.store_in_background(request.key(), response.clone());
                }
                FetchOutcome::respond(response, ResponseSource::Network)
            }
            Err(e) => {
                self.stats.record_network_failure();
                log::debug!("Network failed for {}: {e}", request.url);
                if let Some(cached) = self.lookup(&request.key()).await {
                    log::info!("Serving from cache: {}", request.url);
                    return FetchOutcome::respond(cached, ResponseSource::Cache);
                }
                self.fallback(request).await
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> FetchOutcome {
        let key = request.key();
        if let Some(cached) = self.lookup(&key).await {
            return FetchOutcome::respond(cached, ResponseSource::Cache);
        }
        match self.network.fetch(request).await {
            Ok(response) => {
                self.stats.record_network();
                if self.is_cacheable(request, &response) {
                    self.stores
                        .track_future(self.store(&key, &response))
                        .await;
                }
                FetchOutcome::respond(response, ResponseSource::Network)
            }
            Err(e) => {
                self.stats.record_network_failure();
                log::debug!("Network failed for {}: {e}", request.url);
                self.fallback(request).await
            }
        }
    }

    /// Offline page for navigations, otherwise the synthesized 503.
    async fn fallback(&self, request: &Request) -> FetchOutcome {
        if request.is_navigation() {
            match crate::url::resolve(&self.origin, &self.config.offline_url) {
                Ok(url) => {
                    if let Some(page) = self.read(&RequestKey::get(&url)).await {
                        self.stats.record_offline_fallback();
                        log::info!("Serving offline page for {}", request.url);
                        return FetchOutcome::respond(page, ResponseSource::OfflineFallback);
                    }
                }
                Err(e) => log::warn!("Offline page URL is invalid: {e}"),
            }
        }
        self.stats.record_unavailable();
        FetchOutcome::respond(Response::unavailable(), ResponseSource::Unavailable)
    }

    /// Cache read counted as a hit or miss.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let found = self.read(key).await;
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        found
    }

    async fn read(&self, key: &RequestKey) -> Option<Response> {
        match self.storage.match_key(&self.cache_name, key).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Cache read failed for {}: {e}", key.url);
                None
            }
        }
    }

    fn store_in_background(&self, key: RequestKey, response: Response) {
        let manager = self.clone();
        let write = async move { manager.store(&key, &response).await };
        self.tasks.spawn(self.stores.track_future(write));
    }

    /// Writes one entry; failures are logged and counted, never returned.
    async fn store(&self, key: &RequestKey, response: &Response) {
        if self.is_retired() {
            log::debug!("Not caching {}: {} is retired", key.url, self.cache_name);
            return;
        }
        match self.storage.put(&self.cache_name, key, response).await {
            Ok(()) => self.stats.record_store(),
            Err(e) => {
                self.stats.record_store_failure();
                log::warn!("Failed to cache {}: {e}", key.url);
            }
        }
    }
}
