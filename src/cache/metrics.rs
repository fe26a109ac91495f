//! Cache Metrics Collection
//!
//! Lock-free counters for every reliability decision the engine makes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::store::CacheTier;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    null_hits: AtomicU64,
    misses: AtomicU64,

    // Loads
    loads: AtomicU64,
    load_failures: AtomicU64,
    coalesced: AtomicU64,

    // Distributed lock
    lock_acquired: AtomicU64,
    lock_timeouts: AtomicU64,

    // Store failures
    local_store_failures: AtomicU64,
    remote_store_failures: AtomicU64,
    short_circuits: AtomicU64,
    fail_open_degradations: AtomicU64,

    // Invalidation
    invalidations: AtomicU64,
    invalidation_retries: AtomicU64,
    invalidation_failures: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: CacheTier) {
        match tier {
            CacheTier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A hit on the null sentinel (counted in addition to the tier hit)
    pub fn record_null_hit(&self) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller that joined an in-flight load instead of starting one
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_acquired(&self) {
        self.lock_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self, tier: CacheTier) {
        match tier {
            CacheTier::Local => self.local_store_failures.fetch_add(1, Ordering::Relaxed),
            CacheTier::Remote => self.remote_store_failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_short_circuit(&self) {
        self.short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_degradations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_retry(&self) {
        self.invalidation_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_failure(&self) {
        self.invalidation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed) + self.remote_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Get overall cache hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            null_hits: self.null_hits.load(Ordering::Relaxed),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),

            loads: self.loads(),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),

            lock_acquired: self.lock_acquired.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),

            local_store_failures: self.local_store_failures.load(Ordering::Relaxed),
            remote_store_failures: self.remote_store_failures.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            fail_open_degradations: self.fail_open_degradations.load(Ordering::Relaxed),

            invalidations: self.invalidations.load(Ordering::Relaxed),
            invalidation_retries: self.invalidation_retries.load(Ordering::Relaxed),
            invalidation_failures: self.invalidation_failures.load(Ordering::Relaxed),

            local_entries: 0,
            local_weight_bytes: 0,
            local_evictions: 0,
            in_flight_loads: 0,
            pending_invalidations: 0,
            dead_letters: 0,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.local_hits,
            &self.remote_hits,
            &self.null_hits,
            &self.misses,
            &self.loads,
            &self.load_failures,
            &self.coalesced,
            &self.lock_acquired,
            &self.lock_timeouts,
            &self.local_store_failures,
            &self.remote_store_failures,
            &self.short_circuits,
            &self.fail_open_degradations,
            &self.invalidations,
            &self.invalidation_retries,
            &self.invalidation_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
///
/// Gauge fields (`local_*`, `in_flight_loads`, `pending_invalidations`,
/// `dead_letters`) are filled in by the engine, which owns those structures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Lookups
    pub local_hits: u64,
    pub remote_hits: u64,
    pub null_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,

    // Loads
    pub loads: u64,
    pub load_failures: u64,
    pub coalesced: u64,

    // Distributed lock
    pub lock_acquired: u64,
    pub lock_timeouts: u64,

    // Store failures
    pub local_store_failures: u64,
    pub remote_store_failures: u64,
    pub short_circuits: u64,
    pub fail_open_degradations: u64,

    // Invalidation
    pub invalidations: u64,
    pub invalidation_retries: u64,
    pub invalidation_failures: u64,

    // Gauges
    pub local_entries: u64,
    pub local_weight_bytes: u64,
    pub local_evictions: u64,
    pub in_flight_loads: u64,
    pub pending_invalidations: u64,
    pub dead_letters: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hits(), 0);
        assert_eq!(metrics.misses(), 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(CacheTier::Local);
        metrics.record_hit(CacheTier::Remote);
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.local_hits, 1);
        assert_eq!(snapshot.remote_hits, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CacheMetrics::new();
        metrics.record_load();
        metrics.record_store_failure(CacheTier::Remote);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["loads"], 1);
        assert_eq!(json["remote_store_failures"], 1);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_invalidation();
        metrics.record_lock_timeout();
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invalidations, 0);
        assert_eq!(snapshot.lock_timeouts, 0);
    }
}
