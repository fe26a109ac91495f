//! Store Call Guarding
//!
//! [`StoreGuard`] wraps each call to a tier in a timeout and that tier's
//! circuit breaker. [`GuardedStore`] sits on top and is the only place where
//! store failures are turned into misses (fail-open) or re-raised
//! (fail-closed).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerState};
use crate::cache::{CacheEntry, CacheMetrics, CacheStore, CacheTier, CachedValue, KeyPattern};
use crate::config::{BreakerConfig, FailureMode};
use crate::error::{Error, Result};

/// Timeout + breaker around every call to one tier
pub struct StoreGuard {
    tier: CacheTier,
    breaker: CircuitBreaker,
    timeout: Duration,
    metrics: Arc<CacheMetrics>,
}

impl StoreGuard {
    pub fn new(
        tier: CacheTier,
        timeout: Duration,
        breaker: &BreakerConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            tier,
            breaker: CircuitBreaker::new(tier, breaker),
            timeout,
            metrics,
        }
    }

    /// Run one store call. While the breaker is open this returns
    /// [`Error::StoreUnavailable`] without polling `call`.
    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                self.metrics.record_short_circuit();
                return Err(err);
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) if err.counts_against_breaker() => {
                permit.failure();
                self.metrics.record_store_failure(self.tier);
                Err(err)
            }
            Ok(Err(err)) => {
                // The store answered; a bad payload says nothing about its health
                permit.success();
                Err(err)
            }
            Err(_) => {
                permit.failure();
                self.metrics.record_store_failure(self.tier);
                Err(Error::StoreTimeout {
                    tier: self.tier,
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }
}

/// A tier as the engine sees it: guarded, with the failure mode applied
pub struct GuardedStore {
    store: Arc<dyn CacheStore>,
    guard: StoreGuard,
    mode: FailureMode,
    metrics: Arc<CacheMetrics>,
}

impl GuardedStore {
    pub fn new(
        store: Arc<dyn CacheStore>,
        timeout: Duration,
        breaker: &BreakerConfig,
        mode: FailureMode,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let tier = store.tier();
        Self {
            guard: StoreGuard::new(tier, timeout, breaker, Arc::clone(&metrics)),
            store,
            mode,
            metrics,
        }
    }

    pub fn tier(&self) -> CacheTier {
        self.guard.tier()
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.guard.breaker_state()
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.guard.breaker_status()
    }

    /// Raw guarded call, for callers that handle failures themselves
    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard.run(operation, call).await
    }

    /// Read a key. Under fail-open a store failure is a miss.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        match self.guard.run("get", self.store.get(key)).await {
            Ok(entry) => Ok(entry),
            Err(err @ Error::Codec(_)) => {
                warn!(key, tier = %self.tier(), error = %err, "undecodable entry treated as miss");
                Ok(None)
            }
            Err(err) => self.degrade(key, "get", err).map(|()| None),
        }
    }

    /// Write a key. Under fail-open a store failure is logged and dropped.
    pub async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        let result = self
            .guard
            .run("set", self.store.set(key, value, ttl))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.degrade(key, "set", err),
        }
    }

    /// Delete a key. Failures always propagate so invalidation can retry.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.guard.run("delete", self.store.delete(key)).await
    }

    /// Delete by pattern. Failures always propagate so invalidation can retry.
    pub async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        self.guard
            .run("delete_matching", self.store.delete_matching(pattern))
            .await
    }

    fn degrade(&self, key: &str, operation: &'static str, err: Error) -> Result<()> {
        if !err.is_store_failure() || self.mode == FailureMode::FailClosed {
            return Err(err);
        }
        self.metrics.record_fail_open();
        match err {
            Error::StoreUnavailable { .. } => {
                debug!(key, tier = %self.tier(), operation, "breaker open, treating as miss");
            }
            _ => {
                warn!(key, tier = %self.tier(), operation, error = %err, "store failure, continuing without cache");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryRemoteBackend, RemoteStore};
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(30),
        }
    }

    fn guarded(mode: FailureMode) -> (GuardedStore, Arc<InMemoryRemoteBackend>, Arc<CacheMetrics>) {
        let backend = Arc::new(InMemoryRemoteBackend::new());
        let metrics = Arc::new(CacheMetrics::new());
        let store = GuardedStore::new(
            Arc::new(RemoteStore::new(backend.clone())),
            Duration::from_millis(100),
            &breaker_config(),
            mode,
            Arc::clone(&metrics),
        );
        (store, backend, metrics)
    }

    #[tokio::test]
    async fn test_fail_open_turns_outage_into_miss() {
        let (store, backend, metrics) = guarded(FailureMode::FailOpen);
        backend.set_unavailable(true);

        assert!(store.get("Order:id:1").await.unwrap().is_none());
        store
            .set("Order:id:1", CachedValue::Absent, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(metrics.snapshot().fail_open_degradations, 2);
    }

    #[tokio::test]
    async fn test_fail_closed_reraises() {
        let (store, backend, _) = guarded(FailureMode::FailClosed);
        backend.set_unavailable(true);

        assert_matches!(
            store.get("Order:id:1").await,
            Err(Error::StoreTransport { tier: CacheTier::Remote, .. })
        );
    }

    #[tokio::test]
    async fn test_delete_always_propagates() {
        let (store, backend, _) = guarded(FailureMode::FailOpen);
        backend.set_unavailable(true);
        assert!(store.delete("Order:id:1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_against_breaker() {
        let (store, backend, metrics) = guarded(FailureMode::FailClosed);
        backend.set_latency(Some(Duration::from_secs(1)));

        assert_matches!(
            store.get("k").await,
            Err(Error::StoreTimeout { operation: "get", .. })
        );
        assert_matches!(store.get("k").await, Err(Error::StoreTimeout { .. }));
        assert_eq!(store.breaker_status(), BreakerStatus::Open);

        // Short-circuited: the backend is not called again
        let calls = backend.call_count();
        assert_matches!(store.get("k").await, Err(Error::StoreUnavailable { .. }));
        assert_eq!(backend.call_count(), calls);
        assert_eq!(metrics.snapshot().short_circuits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recloses_after_recovery() {
        let (store, backend, _) = guarded(FailureMode::FailOpen);
        backend.set_unavailable(true);
        store.get("k").await.unwrap();
        store.get("k").await.unwrap();
        assert_eq!(store.breaker_status(), BreakerStatus::Open);

        backend.set_unavailable(false);
        tokio::time::advance(Duration::from_secs(30)).await;
        store
            .set("k", CachedValue::Present(Bytes::from_static(b"v")), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.breaker_status(), BreakerStatus::Closed);
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let (store, backend, _) = guarded(FailureMode::FailClosed);
        use crate::cache::RemoteBackend;
        backend
            .set("k", Bytes::from_static(b"\x7fjunk"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.breaker_status(), BreakerStatus::Closed);
    }
}
