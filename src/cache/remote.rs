//! Remote Tier - Shared Key-Value Service
//!
//! The remote tier is an opaque atomic key-value service shared by every
//! process. [`RemoteBackend`] is the narrow surface the engine needs from
//! it; [`RemoteStore`] adapts a backend to the [`CacheStore`] contract and
//! owns the value encoding.
//!
//! # Design
//!
//! - Pluggable backend (Redis, Memcached-with-CAS, ...), supplied by the host
//! - Pattern deletes list by literal prefix and filter through
//!   [`KeyPattern::matches`], so both tiers agree on what a pattern means
//! - [`InMemoryRemoteBackend`] doubles as the test backend, with fault
//!   injection for outage and latency scenarios

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::entry::{CacheEntry, CachedValue, ENTRY_OVERHEAD};
use super::pattern::KeyPattern;
use super::store::{CacheStore, CacheTier};
use crate::error::{Error, Result};

/// Value read from the remote service
#[derive(Debug, Clone)]
pub struct RemoteValue {
    /// Raw stored bytes
    pub data: Bytes,
    /// Time left before the service expires the key
    pub ttl_remaining: Duration,
}

/// Remote storage backend trait
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>>;

    /// Write a key with expiry
    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Atomically write a key only if it does not exist; true if written
    async fn set_if_absent(&self, key: &str, data: Bytes, ttl: Duration) -> Result<bool>;

    /// Delete a key; true if it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically delete a key only if it still holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// List live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Remote backend statistics
#[derive(Debug, Clone, Default)]
pub struct RemoteBackendStats {
    /// Live keys
    pub keys: u64,
    /// Total calls received (including failed ones)
    pub calls: u64,
    /// Calls that failed by injection
    pub failed_calls: u64,
}

/// In-memory remote backend for testing and single-node deployments
/// Uses DashMap for lock-free concurrent access instead of single RwLock
pub struct InMemoryRemoteBackend {
    entries: DashMap<String, (Bytes, Instant)>,
    calls: AtomicU64,
    failed_calls: AtomicU64,
    unavailable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl Default for InMemoryRemoteBackend {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            latency: RwLock::new(None),
        }
    }
}

impl InMemoryRemoteBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transport error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of calls that reached the backend
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Get backend statistics
    pub fn stats(&self) -> RemoteBackendStats {
        let now = Instant::now();
        RemoteBackendStats {
            keys: self.entries.iter().filter(|e| e.value().1 > now).count() as u64,
            calls: self.calls.load(Ordering::SeqCst),
            failed_calls: self.failed_calls.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(Error::StoreTransport {
                tier: CacheTier::Remote,
                reason: format!("injected failure during {}", operation),
            });
        }
        Ok(())
    }

    fn live(&self, key: &str, now: Instant) -> Option<(Bytes, Instant)> {
        let found = self.entries.get(key).map(|e| e.value().clone());
        match found {
            Some((data, expires_at)) if expires_at > now => Some((data, expires_at)),
            Some(_) => {
                self.entries.remove_if(key, |_, (_, exp)| *exp <= now);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryRemoteBackend {
    async fn get(&self, key: &str) -> Result<Option<RemoteValue>> {
        self.enter("get").await?;
        let now = Instant::now();
        Ok(self.live(key, now).map(|(data, expires_at)| RemoteValue {
            data,
            ttl_remaining: expires_at.saturating_duration_since(now),
        }))
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.enter("set").await?;
        self.entries
            .insert(key.to_string(), (data, Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, data: Bytes, ttl: Duration) -> Result<bool> {
        self.enter("set_if_absent").await?;
        let now = Instant::now();
        // The entry guard holds the shard lock, making check-and-set atomic
        let mut slot = self.entries.entry(key.to_string()).or_insert((Bytes::new(), now));
        if slot.value().1 > now {
            return Ok(false);
        }
        *slot.value_mut() = (data, now + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter("delete").await?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, (_, expires_at))| expires_at > now)
            .unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.enter("delete_if_equals").await?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, (data, expires_at)| {
                *expires_at > now && data.as_ref() == expected
            })
            .is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.enter("scan_prefix").await?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().1 > now)
            .map(|e| e.key().clone())
            .collect())
    }
}

/// Remote tier - adapts a [`RemoteBackend`] to [`CacheStore`]
pub struct RemoteStore {
    backend: Arc<dyn RemoteBackend>,
}

impl RemoteStore {
    /// Create a remote store over a backend
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self { backend }
    }

    /// Create with in-memory backend (for testing)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRemoteBackend::new()))
    }

    /// Shared backend handle (used by the distributed lock)
    pub fn backend(&self) -> Arc<dyn RemoteBackend> {
        Arc::clone(&self.backend)
    }
}

#[async_trait]
impl CacheStore for RemoteStore {
    fn tier(&self) -> CacheTier {
        CacheTier::Remote
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(remote) = self.backend.get(key).await? else {
            return Ok(None);
        };
        if remote.ttl_remaining.is_zero() {
            return Ok(None);
        }
        let weight = key.len() as u64 + remote.data.len() as u64 + ENTRY_OVERHEAD;
        let value = CachedValue::decode(remote.data)?;
        let now = Instant::now();
        Ok(Some(CacheEntry {
            value,
            expires_at: now + remote.ttl_remaining,
            inserted_at: now,
            weight,
        }))
    }

    async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        self.backend.set(key, value.encode(), ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        if pattern.is_exact() {
            return Ok(usize::from(self.backend.delete(pattern.as_str()).await?));
        }
        let candidates = self.backend.scan_prefix(&pattern.literal_prefix()).await?;
        let mut removed = 0;
        for key in candidates.iter().filter(|k| pattern.matches(k)) {
            if self.backend.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_backend_expiry() {
        let backend = InMemoryRemoteBackend::new();
        backend
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await
            .unwrap();

        let value = backend.get("k").await.unwrap().unwrap();
        assert_eq!(value.ttl_remaining, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_live_holder() {
        let backend = InMemoryRemoteBackend::new();
        let lease = Duration::from_secs(10);

        assert!(backend.set_if_absent("lock:k", Bytes::from_static(b"a"), lease).await.unwrap());
        assert!(!backend.set_if_absent("lock:k", Bytes::from_static(b"b"), lease).await.unwrap());

        // Lease expiry frees the lock
        tokio::time::advance(lease).await;
        assert!(backend.set_if_absent("lock:k", Bytes::from_static(b"b"), lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let backend = InMemoryRemoteBackend::new();
        backend
            .set("lock:k", Bytes::from_static(b"token-a"), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!backend.delete_if_equals("lock:k", b"token-b").await.unwrap());
        assert!(backend.delete_if_equals("lock:k", b"token-a").await.unwrap());
        assert!(backend.get("lock:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = InMemoryRemoteBackend::new();
        backend.set_unavailable(true);

        let err = backend.get("k").await.unwrap_err();
        assert_matches!(err, Error::StoreTransport { tier: CacheTier::Remote, .. });
        assert_eq!(backend.stats().failed_calls, 1);

        backend.set_unavailable(false);
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_remote_store_round_trip_and_sentinel() {
        let store = RemoteStore::in_memory();
        store
            .set("Order:id:1", CachedValue::Present(Bytes::from_static(b"{}")), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("Order:id:2", CachedValue::Absent, Duration::from_secs(10))
            .await
            .unwrap();

        let one = store.get("Order:id:1").await.unwrap().unwrap();
        assert_eq!(one.value, CachedValue::Present(Bytes::from_static(b"{}")));
        let two = store.get("Order:id:2").await.unwrap().unwrap();
        assert!(two.value.is_absent());
        assert!(two.remaining_ttl() <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_remote_delete_matching_agrees_with_local_grammar() {
        let store = RemoteStore::in_memory();
        let ttl = Duration::from_secs(60);
        for key in [
            "Order:agg:sum:total:none",
            "Order:agg:count:none",
            "Order:list:none",
            "OrderItem:agg:sum:qty:none",
        ] {
            store.set(key, CachedValue::Absent, ttl).await.unwrap();
        }

        let pattern = KeyPattern::parse("Order:agg:*").unwrap();
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 2);
        assert!(store.get("Order:list:none").await.unwrap().is_some());
        assert!(store.get("OrderItem:agg:sum:qty:none").await.unwrap().is_some());

        // Deleting again is a no-op
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 0);
    }
}
