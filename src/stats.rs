//! Counters describing how fetch events were answered.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by every cache manager of a worker host.
#[derive(Debug, Default)]
pub struct CacheStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_responses: AtomicU64,
    network_failures: AtomicU64,
    offline_fallbacks: AtomicU64,
    unavailable: AtomicU64,
    bypassed: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub network_responses: u64,
    pub network_failures: u64,
    pub offline_fallbacks: u64,
    pub unavailable: u64,
    pub bypassed: u64,
    pub stores: u64,
    pub store_failures: u64,
}

impl StatsSnapshot {
    /// Fraction of cache lookups that hit, or `None` before the first lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }
}

impl CacheStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network(&self) {
        self.network_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_failure(&self) {
        self.network_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline_fallback(&self) {
        self.offline_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a consistent-enough copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            network_responses: self.network_responses.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            offline_fallbacks: self.offline_fallbacks.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_default_is_zero() {
        assert_eq!(CacheStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_network_failure();
        stats.record_store_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.network_failures, 1);
        assert_eq!(snap.store_failures, 1);
        assert_eq!(snap.bypassed, 0);
    }

    #[test]
    fn hit_ratio_needs_lookups() {
        let stats = CacheStats::new();
        assert!(stats.snapshot().hit_ratio().is_none());
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        let ratio = stats.snapshot().hit_ratio().unwrap();
        assert!((ratio - 0.75).abs() < f64::EPSILON);
    }
}
