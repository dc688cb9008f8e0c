//! giftcache - offline asset cache for the gift-list web app.
//!
//! Keeps a versioned named cache of the app shell, answers requests
//! network-first or cache-first, and falls back to a cached page or a
//! synthesized 503 when the origin is unreachable.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use giftcache::{CacheConfig, DiskStorage, HttpNetwork, NoProgress, OriginConfig, Request, ServiceWorker};
//!
//! # async fn example() -> giftcache::Result<()> {
//! let origin = OriginConfig::default();
//! let worker = ServiceWorker::new(
//!     Arc::new(DiskStorage::new("/var/cache/giftcache")),
//!     Arc::new(HttpNetwork::new(&origin)?),
//!     CacheConfig::default(),
//!     origin.base_url()?,
//! )?;
//!
//! // Precache the app shell and take control.
//! worker.install(&NoProgress).await?;
//!
//! // Answer a request, from the cache if the origin is down.
//! let url = origin.base_url()?.join("/static/manifest.json").expect("valid path");
//! let response = worker.respond(&Request::get(url)).await;
//! println!("{} ({} bytes)", response.status, response.body.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod format;
pub mod http;
pub mod manager;
pub mod message;
pub mod network;
pub mod state;
pub mod stats;
pub mod store;
pub mod url;
pub mod version;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "proxy")]
pub mod proxy;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use config::{AppConfig, CacheConfig, OriginConfig, PathConfig, ProxyConfig, Strategy};
pub use error::{Error, Result};
pub use format::{format_age, format_bytes, format_duration};
pub use http::{Method, Request, RequestKey, RequestMode, Response};
pub use manager::{
    ActivationReport, CacheManager, FetchOutcome, InstallProgress, InstallReport, NoProgress,
    ResponseSource,
};
pub use message::ControlMessage;
pub use network::{HttpNetwork, Network, OfflineNetwork};
pub use state::{Registration, WorkerRecord, WorkerState};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{CacheStorage, DiskStorage, EntryInfo, MemoryStorage};
pub use version::CacheVersion;
pub use worker::{
    CacheListing, Completion, Event, EventOutcome, InstallOutcome, MessageOutcome, ServiceWorker,
};
