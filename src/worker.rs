//! The worker host: lifecycle of cache versions and event dispatch.
//!
//! A host owns at most one *active* version, which answers fetch events, and
//! at most one *waiting* version, installed but not yet in control. Installing
//! a new version never disturbs the active one; activation swaps them and
//! deletes every stale cache.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::manager::{
    ActivationReport, CacheManager, FetchOutcome, InstallProgress, InstallReport, NoProgress,
};
use crate::message::ControlMessage;
use crate::network::Network;
use crate::state::{Registration, WorkerRecord, WorkerState};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::store::{CacheStorage, EntryInfo};

/// An event delivered to the worker.
#[derive(Debug, Clone)]
pub enum Event {
    Install,
    Activate,
    Fetch(Request),
    Message(ControlMessage),
}

/// What handling an [`Event`] produced.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed(InstallOutcome),
    /// `None` when nothing was waiting.
    Activated(Option<ActivationReport>),
    Fetch(FetchOutcome),
    Message(MessageOutcome),
}

/// Result of installing the configured version.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub report: InstallReport,
    /// Set when the new version took control right away.
    pub activation: Option<ActivationReport>,
}

/// Result of a control message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum MessageOutcome {
    Activated(ActivationReport),
    /// No version was waiting; a running install will skip waiting instead.
    NothingWaiting,
    Cached(InstallReport),
}

/// Handle to an event running on the host's task tracker.
#[derive(Debug)]
pub struct Completion {
    handle: JoinHandle<Result<EventOutcome>>,
}

impl Completion {
    /// Waits for the event to finish.
    ///
    /// # Errors
    ///
    /// Returns the event's own error, or [`Error::Worker`] if its task panicked.
    pub async fn wait(self) -> Result<EventOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Worker(e.to_string())),
        }
    }
}

/// One cache listing for status output.
#[derive(Debug, Clone, Serialize)]
pub struct CacheListing {
    pub name: String,
    /// True for the active version's cache.
    pub current: bool,
    pub entries: Vec<EntryInfo>,
}

struct Slot<S, N> {
    manager: CacheManager<S, N>,
    record: WorkerRecord,
}

struct Slots<S, N> {
    active: Option<Slot<S, N>>,
    waiting: Option<Slot<S, N>>,
    controlling: bool,
    /// Installs still running.
    installing: usize,
    installing_record: Option<WorkerRecord>,
    redundant: Option<WorkerRecord>,
    skip_waiting: bool,
    updated_at: Option<chrono::DateTime<Utc>>,
}

impl<S, N> Default for Slots<S, N> {
    fn default() -> Self {
        Self {
            active: None,
            waiting: None,
            controlling: false,
            installing: 0,
            installing_record: None,
            redundant: None,
            skip_waiting: false,
            updated_at: None,
        }
    }
}

impl<S, N> Slots<S, N> {
    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    fn retire_record(&mut self, mut record: WorkerRecord) {
        record.state = WorkerState::Redundant;
        self.redundant = Some(record);
    }
}

/// Hosts versioned cache managers the way a browser hosts a service worker.
pub struct ServiceWorker<S, N> {
    base: CacheManager<S, N>,
    slots: RwLock<Slots<S, N>>,
    stats: Arc<CacheStats>,
    tasks: TaskTracker,
}

impl<S, N> ServiceWorker<S, N>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    /// Creates a host with nothing installed.
    ///
    /// # Errors
    ///
    /// Returns an error if a bypass pattern does not compile.
    pub fn new(storage: Arc<S>, network: Arc<N>, config: CacheConfig, origin: Url) -> Result<Self> {
        let stats = Arc::new(CacheStats::new());
        let tasks = TaskTracker::new();
        let base = CacheManager::new(storage, network, config, origin)?
            .with_stats(Arc::clone(&stats))
            .with_tracker(tasks.clone());
        Ok(Self {
            base,
            slots: RwLock::new(Slots::default()),
            stats,
            tasks,
        })
    }

    /// Re-attaches the versions of a persisted registration.
    ///
    /// A recorded version whose cache no longer exists is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be queried.
    pub async fn restore(&self, registration: &Registration) -> Result<()> {
        let active = self.restore_slot(registration.active.as_ref()).await?;
        let waiting = self.restore_slot(registration.waiting.as_ref()).await?;

        let mut slots = self.slots.write().await;
        slots.controlling = registration.controlling && active.is_some();
        slots.active = active;
        slots.waiting = waiting;
        slots.redundant.clone_from(&registration.redundant);
        slots.updated_at = registration.updated_at;
        Ok(())
    }

    async fn restore_slot(&self, record: Option<&WorkerRecord>) -> Result<Option<Slot<S, N>>> {
        let Some(record) = record else {
            return Ok(None);
        };
        let manager = self.base.with_version(record.version.clone());
        if !self.base.storage().has(manager.cache_name()).await? {
            log::warn!(
                "Cache {} for worker {} is gone, dropping it",
                manager.cache_name(),
                record.version
            );
            return Ok(None);
        }
        Ok(Some(Slot {
            manager,
            record: record.clone(),
        }))
    }

    /// Snapshot of the current registration for persistence.
    pub async fn registration(&self) -> Registration {
        let slots = self.slots.read().await;
        Registration {
            controlling: slots.controlling,
            updated_at: slots.updated_at,
            active: slots.active.as_ref().map(|s| s.record.clone()),
            waiting: slots.waiting.as_ref().map(|s| s.record.clone()),
            installing: slots.installing_record.clone(),
            redundant: slots.redundant.clone(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        self.base.config()
    }

    #[must_use]
    pub fn origin(&self) -> &Url {
        self.base.origin()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of events and background writes still running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Installs the configured version.
    ///
    /// The new version becomes waiting, or takes control right away when
    /// nothing is active or skip-waiting was requested. Reinstalling the active
    /// version refreshes its cache in place.
    ///
    /// # Errors
    ///
    /// Returns the install failure; the previously active version keeps serving.
    pub async fn install(&self, progress: &dyn InstallProgress) -> Result<InstallOutcome> {
        let manager = self.base.with_version(self.base.version().clone());
        let record = WorkerRecord::new(
            manager.version().clone(),
            manager.cache_name().to_string(),
            WorkerState::Installing,
        );
        {
            let mut slots = self.slots.write().await;
            slots.installing += 1;
            slots.installing_record = Some(record.clone());
            slots.touch();
        }

        let result = manager.install(progress).await;

        let mut slots = self.slots.write().await;
        slots.installing = slots.installing.saturating_sub(1);
        if slots.installing == 0 {
            slots.installing_record = None;
        }
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if slots.installing == 0 {
                    slots.skip_waiting = false;
                }
                log::error!(
                    "Worker {} became redundant, keeping the current one",
                    manager.version()
                );
                slots.retire_record(record);
                slots.touch();
                return Err(e);
            }
        };

        let refreshes_active = slots
            .active
            .as_ref()
            .is_some_and(|active| active.record.version == *manager.version());
        if refreshes_active {
            log::info!("Refreshed active worker {}", manager.version());
            slots.skip_waiting = false;
            slots.touch();
            return Ok(InstallOutcome {
                report,
                activation: None,
            });
        }

        let record = WorkerRecord {
            state: WorkerState::Installed,
            ..record
        };
        if let Some(previous) = slots.waiting.replace(Slot { manager, record }) {
            log::info!("Waiting worker {} became redundant", previous.record.version);
            slots.retire_record(previous.record);
        }

        let activate_now =
            self.config().skip_waiting_on_install || slots.skip_waiting || slots.active.is_none();
        slots.skip_waiting = false;
        slots.touch();

        let activation = if activate_now {
            Self::activate_locked(&mut slots).await?
        } else {
            log::info!("Worker installed and waiting for clients to close");
            None
        };
        Ok(InstallOutcome { report, activation })
    }

    /// Promotes the waiting version, deleting every other cache.
    ///
    /// Returns `None` when nothing is waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache names cannot be listed; the version stays waiting.
    pub async fn activate_waiting(&self) -> Result<Option<ActivationReport>> {
        let mut slots = self.slots.write().await;
        Self::activate_locked(&mut slots).await
    }

    async fn activate_locked(slots: &mut Slots<S, N>) -> Result<Option<ActivationReport>> {
        let Some(mut next) = slots.waiting.take() else {
            return Ok(None);
        };

        next.record.state = WorkerState::Activating;
        // No write from the outgoing version may land after its cache is deleted.
        if let Some(active) = &slots.active {
            active.manager.retire().await;
        }
        let report = match next.manager.activate().await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Activation of {} failed: {e}", next.record.version);
                if let Some(active) = &slots.active {
                    active.manager.reinstate();
                }
                next.record.state = WorkerState::Installed;
                slots.waiting = Some(next);
                return Err(e);
            }
        };

        next.record.state = WorkerState::Activated;
        log::info!(
            "Worker {} activated and controlling clients",
            next.record.version
        );
        if let Some(previous) = slots.active.replace(next) {
            log::info!("Worker {} became redundant", previous.record.version);
            slots.retire_record(previous.record);
        }
        slots.controlling = true;
        slots.touch();
        Ok(Some(report))
    }

    // ========================================================================
    // Fetch and messages
    // ========================================================================

    fn controller(slots: &Slots<S, N>) -> Option<CacheManager<S, N>> {
        slots
            .active
            .as_ref()
            .filter(|_| slots.controlling)
            .map(|slot| slot.manager.clone())
    }

    /// Routes a fetch to the active version. Uncontrolled requests pass through.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let controller = Self::controller(&*self.slots.read().await);
        match controller {
            Some(manager) => manager.handle_fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Produces the response a page would see, sending pass-through requests
    /// to the network.
    pub async fn respond(&self, request: &Request) -> Response {
        match self.handle_fetch(request).await {
            FetchOutcome::Respond { response, .. } => response,
            FetchOutcome::Passthrough => self.passthrough(request).await,
        }
    }

    /// Sends a request straight to the network. A transport failure becomes a 502.
    pub async fn passthrough(&self, request: &Request) -> Response {
        match self.base.network().fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{} {} failed: {e}", request.method, request.url);
                Response::bad_gateway()
            }
        }
    }

    /// Handles a control message.
    ///
    /// # Errors
    ///
    /// `CACHE_URLS` fails with [`Error::NotInstalled`] when no version exists,
    /// or with the batch's fetch or storage error.
    pub async fn post_message(&self, message: ControlMessage) -> Result<MessageOutcome> {
        match message {
            ControlMessage::SkipWaiting => {
                let mut slots = self.slots.write().await;
                if let Some(report) = Self::activate_locked(&mut slots).await? {
                    return Ok(MessageOutcome::Activated(report));
                }
                if slots.installing > 0 {
                    slots.skip_waiting = true;
                }
                Ok(MessageOutcome::NothingWaiting)
            }
            ControlMessage::CacheUrls(urls) => {
                let target = {
                    let slots = self.slots.read().await;
                    slots
                        .active
                        .as_ref()
                        .or(slots.waiting.as_ref())
                        .map(|slot| slot.manager.clone())
                };
                let manager = target.ok_or(Error::NotInstalled)?;
                let report = manager.add_all(&urls, &NoProgress).await?;
                log::info!("Cached {} URLs into {}", report.entries, report.cache_name);
                Ok(MessageOutcome::Cached(report))
            }
        }
    }

    /// Lists every cache in storage with its entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub async fn caches(&self) -> Result<Vec<CacheListing>> {
        let current = {
            let slots = self.slots.read().await;
            slots
                .active
                .as_ref()
                .map(|slot| slot.manager.cache_name().to_string())
        };
        let storage = self.base.storage();
        let mut listings = Vec::new();
        for name in storage.keys().await? {
            let entries = storage.entries(&name).await?;
            listings.push(CacheListing {
                current: current.as_deref() == Some(name.as_str()),
                name,
                entries,
            });
        }
        Ok(listings)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Runs an event concurrently; the returned handle reports when it is done.
    pub fn dispatch(self: &Arc<Self>, event: Event) -> Completion {
        let worker = Arc::clone(self);
        let handle = self
            .tasks
            .spawn(async move { worker.handle_event(event).await });
        Completion { handle }
    }

    async fn handle_event(&self, event: Event) -> Result<EventOutcome> {
        match event {
            Event::Install => self.install(&NoProgress).await.map(EventOutcome::Installed),
            Event::Activate => self.activate_waiting().await.map(EventOutcome::Activated),
            Event::Fetch(request) => Ok(EventOutcome::Fetch(self.handle_fetch(&request).await)),
            Event::Message(message) => self.post_message(message).await.map(EventOutcome::Message),
        }
    }

    /// Waits for every dispatched event and background write to finish.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stops accepting events and waits for pending work.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        log::info!("Worker host stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, RequestKey};
    use crate::manager::ResponseSource;
    use crate::store::MemoryStorage;
    use crate::test_support::{StubNetwork, origin, site, url};
    use crate::version::CacheVersion;

    type Host = ServiceWorker<MemoryStorage, StubNetwork>;

    fn host_with(storage: &Arc<MemoryStorage>, network: &Arc<StubNetwork>, config: CacheConfig) -> Host {
        ServiceWorker::new(Arc::clone(storage), Arc::clone(network), config, origin()).unwrap()
    }

    fn version(v: &str) -> CacheVersion {
        CacheVersion::new(v).unwrap()
    }

    #[tokio::test]
    async fn fetch_before_install_passes_through() {
        let host = host_with(
            &Arc::new(MemoryStorage::new()),
            &Arc::new(site()),
            CacheConfig::default(),
        );
        assert_eq!(
            host.handle_fetch(&Request::get(url("/"))).await,
            FetchOutcome::Passthrough
        );
    }

    #[tokio::test]
    async fn first_install_takes_control() {
        let storage = Arc::new(MemoryStorage::new());
        let host = host_with(&storage, &Arc::new(site()), CacheConfig::default());

        let outcome = host.install(&NoProgress).await.unwrap();
        assert!(outcome.activation.is_some());

        let reg = host.registration().await;
        assert!(reg.controlling);
        assert_eq!(reg.active.unwrap().state, WorkerState::Activated);
        assert!(reg.waiting.is_none());
    }

    #[tokio::test]
    async fn upgrade_deletes_previous_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());

        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default().with_version(version("v1.0.1")),
        );
        v2.restore(&v1.registration().await).await.unwrap();
        let outcome = v2.install(&NoProgress).await.unwrap();

        assert_eq!(
            outcome.activation.unwrap().deleted,
            vec!["lista-presentes-v1.0.0".to_string()]
        );
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["lista-presentes-v1.0.1".to_string()]
        );

        let reg = v2.registration().await;
        let redundant = reg.redundant.unwrap();
        assert_eq!(redundant.version, version("v1.0.0"));
        assert_eq!(redundant.state, WorkerState::Redundant);
        assert!(reg.installing.is_none());
    }

    #[tokio::test]
    async fn activation_drops_late_writes_from_previous_version() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default().with_version(version("v2.0.0")),
        );
        v2.restore(&v1.registration().await).await.unwrap();

        // Answered by v1, which queues a write into its own cache.
        let outcome = v2.handle_fetch(&Request::get(url("/static/css/app.css"))).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Network));

        let activation = v2.install(&NoProgress).await.unwrap().activation.unwrap();
        assert_eq!(activation.deleted, vec!["lista-presentes-v1.0.0".to_string()]);

        v2.settle().await;
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["lista-presentes-v2.0.0".to_string()]
        );
    }

    #[tokio::test]
    async fn new_version_waits_without_skip_waiting() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default()
                .with_version(version("v2.0.0"))
                .with_skip_waiting_on_install(false),
        );
        v2.restore(&v1.registration().await).await.unwrap();
        let outcome = v2.install(&NoProgress).await.unwrap();
        assert!(outcome.activation.is_none());

        let reg = v2.registration().await;
        assert_eq!(reg.active_version(), Some(&version("v1.0.0")));
        assert_eq!(reg.waiting_version(), Some(&version("v2.0.0")));
        assert_eq!(storage.keys().await.unwrap().len(), 2);

        // The old version still answers while the new one waits.
        network.set_online(false);
        let outcome = v2.handle_fetch(&Request::get(url("/static/manifest.json"))).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Cache));

        let msg = v2.post_message(ControlMessage::SkipWaiting).await.unwrap();
        assert!(matches!(msg, MessageOutcome::Activated(_)));
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["lista-presentes-v2.0.0".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_upgrade_keeps_old_version_serving() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default()
                .with_version(version("v2.0.0"))
                .with_precache(["/", "/static/removed.js"]),
        );
        v2.restore(&v1.registration().await).await.unwrap();
        assert!(v2.install(&NoProgress).await.is_err());

        let reg = v2.registration().await;
        assert_eq!(reg.active_version(), Some(&version("v1.0.0")));
        assert!(reg.waiting.is_none());
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["lista-presentes-v1.0.0".to_string()]
        );
    }

    #[tokio::test]
    async fn reinstall_of_active_version_refreshes_in_place() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let host = host_with(&storage, &network, CacheConfig::default());
        host.install(&NoProgress).await.unwrap();

        network.set("/", "text/html", "<h1>Nova lista</h1>");
        let outcome = host.install(&NoProgress).await.unwrap();
        assert!(outcome.activation.is_none());

        let cached = storage
            .match_key("lista-presentes-v1.0.0", &RequestKey::get(&url("/")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body.as_ref(), b"<h1>Nova lista</h1>");
        assert!(host.registration().await.waiting.is_none());
    }

    #[tokio::test]
    async fn restore_drops_versions_with_missing_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let host = host_with(&storage, &Arc::new(site()), CacheConfig::default());
        let record = WorkerRecord::new(
            version("v0.1.0"),
            "lista-presentes-v0.1.0".to_string(),
            WorkerState::Activated,
        );
        let reg = Registration {
            controlling: true,
            updated_at: None,
            active: Some(record),
            ..Registration::default()
        };

        host.restore(&reg).await.unwrap();
        let restored = host.registration().await;
        assert!(restored.active.is_none());
        assert!(!restored.controlling);
    }

    struct InstallingPeek {
        host: Arc<Host>,
        seen: std::sync::Mutex<Option<WorkerRecord>>,
    }

    impl InstallProgress for InstallingPeek {
        fn on_install_start(&self, _cache: &str, _total: usize) {
            if let Ok(slots) = self.host.slots.try_read() {
                self.seen.lock().unwrap().clone_from(&slots.installing_record);
            }
        }
    }

    #[tokio::test]
    async fn running_install_is_reported() {
        let host = Arc::new(host_with(
            &Arc::new(MemoryStorage::new()),
            &Arc::new(site()),
            CacheConfig::default(),
        ));
        let peek = InstallingPeek {
            host: Arc::clone(&host),
            seen: std::sync::Mutex::new(None),
        };
        host.install(&peek).await.unwrap();

        let seen = peek.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.state, WorkerState::Installing);
        assert_eq!(seen.cache_name, "lista-presentes-v1.0.0");
        assert!(host.registration().await.installing.is_none());
    }

    #[tokio::test]
    async fn replaced_waiting_version_is_redundant() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default()
                .with_version(version("v2.0.0"))
                .with_skip_waiting_on_install(false),
        );
        let mut reg = v1.registration().await;
        reg.waiting = Some(WorkerRecord::new(
            version("v1.5.0"),
            "lista-presentes-v1.5.0".to_string(),
            WorkerState::Installed,
        ));
        storage.open("lista-presentes-v1.5.0").await.unwrap();
        v2.restore(&reg).await.unwrap();

        v2.install(&NoProgress).await.unwrap();
        let reg = v2.registration().await;
        assert_eq!(reg.waiting_version(), Some(&version("v2.0.0")));
        let redundant = reg.redundant.unwrap();
        assert_eq!(redundant.version, version("v1.5.0"));
        assert_eq!(redundant.state, WorkerState::Redundant);
    }

    #[tokio::test]
    async fn skip_waiting_survives_a_failed_overlapping_install() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let v1 = host_with(&storage, &network, CacheConfig::default());
        v1.install(&NoProgress).await.unwrap();

        let v2 = host_with(
            &storage,
            &network,
            CacheConfig::default()
                .with_version(version("v2.0.0"))
                .with_skip_waiting_on_install(false),
        );
        v2.restore(&v1.registration().await).await.unwrap();

        // Another install of v2 is still running while this one fails.
        v2.slots.write().await.installing += 1;
        network.set_online(false);
        assert!(v2.install(&NoProgress).await.is_err());

        let reg = v2.registration().await;
        assert_eq!(reg.redundant.unwrap().state, WorkerState::Redundant);
        assert_eq!(reg.installing.unwrap().state, WorkerState::Installing);

        let outcome = v2.post_message(ControlMessage::SkipWaiting).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::NothingWaiting));

        // The other install completes and takes over.
        network.set_online(true);
        v2.slots.write().await.installing -= 1;
        let outcome = v2.install(&NoProgress).await.unwrap();
        assert!(outcome.activation.is_some());
        assert_eq!(
            v2.registration().await.active_version(),
            Some(&version("v2.0.0"))
        );
    }

    #[tokio::test]
    async fn skip_waiting_with_nothing_waiting() {
        let host = host_with(
            &Arc::new(MemoryStorage::new()),
            &Arc::new(site()),
            CacheConfig::default(),
        );
        let outcome = host.post_message(ControlMessage::SkipWaiting).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::NothingWaiting));
    }

    #[tokio::test]
    async fn cache_urls_requires_an_installed_version() {
        let host = host_with(
            &Arc::new(MemoryStorage::new()),
            &Arc::new(site()),
            CacheConfig::default(),
        );
        let err = host
            .post_message(ControlMessage::CacheUrls(vec!["/presentes/".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInstalled));
    }

    #[tokio::test]
    async fn cache_urls_adds_to_active_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let network = Arc::new(site());
        let host = host_with(&storage, &network, CacheConfig::default());
        host.install(&NoProgress).await.unwrap();

        let outcome = host
            .post_message(ControlMessage::CacheUrls(vec!["/presentes/".into()]))
            .await
            .unwrap();
        assert!(matches!(outcome, MessageOutcome::Cached(ref r) if r.entries == 1));

        network.set_online(false);
        let response = host.respond(&Request::get(url("/presentes/"))).await;
        assert_eq!(response.body, network.body("/presentes/"));
    }

    #[tokio::test]
    async fn respond_passes_bypassed_requests_to_network() {
        let network = Arc::new(site());
        let host = host_with(
            &Arc::new(MemoryStorage::new()),
            &network,
            CacheConfig::default(),
        );
        host.install(&NoProgress).await.unwrap();

        let post = Request::new(Method::POST, url("/presentes/"));
        assert_eq!(host.respond(&post).await.status, 200);

        network.set_online(false);
        assert_eq!(host.respond(&post).await.status, 502);
    }

    #[tokio::test]
    async fn dispatch_runs_events_concurrently() {
        let host = Arc::new(host_with(
            &Arc::new(MemoryStorage::new()),
            &Arc::new(site()),
            CacheConfig::default(),
        ));
        let install = host.dispatch(Event::Install).wait().await.unwrap();
        assert!(matches!(install, EventOutcome::Installed(_)));

        let fetches: Vec<_> = ["/", "/static/manifest.json", "/static/css/app.css"]
            .into_iter()
            .map(|p| host.dispatch(Event::Fetch(Request::get(url(p)))))
            .collect();
        for completion in fetches {
            match completion.wait().await.unwrap() {
                EventOutcome::Fetch(outcome) => {
                    assert_eq!(outcome.source(), Some(ResponseSource::Network));
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        host.shutdown().await;
        assert_eq!(host.pending(), 0);
        assert_eq!(host.stats().stores, 3);
    }

    #[tokio::test]
    async fn caches_marks_current() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("lista-presentes-v0.9.0").await.unwrap();
        let host = host_with(
            &storage,
            &Arc::new(site()),
            CacheConfig::default().with_skip_waiting_on_install(false),
        );
        host.install(&NoProgress).await.unwrap();

        let listings = host.caches().await.unwrap();
        assert_eq!(listings.len(), 1);
        assert!(listings[0].current);
        assert_eq!(listings[0].entries.len(), 4);
    }
}
