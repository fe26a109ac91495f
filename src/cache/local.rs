//! Local Tier - In-Process Bounded Cache
//!
//! Keys are routed by hash across a power-of-two number of [`Shard`]s. The
//! entry and weight budget belongs to the whole tier: shards share one
//! [`Usage`] and an insert evicts least-recently-used entries, starting in its
//! own shard and moving on to the others, until the tier fits again.
//!
//! # Design
//!
//! - Any entry up to `max_weight` is storable, whatever the shard count
//! - The shard count never exceeds `max_entries`
//! - Expired entries are a miss on read and removed lazily
//! - A background sweep ([`LocalStore::sweep_expired`]) reclaims entries
//!   nobody reads again
//! - The local tier never fails; its `Result`s exist for the shared contract

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::entry::{fx_hash, CacheEntry, CachedValue};
use super::pattern::KeyPattern;
use super::shard::{Shard, Usage};
use super::store::{CacheStore, CacheTier};
use crate::config::LocalStoreConfig;
use crate::error::Result;

/// Local tier statistics
#[derive(Debug, Clone, Default)]
pub struct LocalStats {
    /// Number of entries
    pub entries: usize,
    /// Entry capacity
    pub max_entries: usize,
    /// Current weight in bytes
    pub weight: u64,
    /// Capacity in bytes
    pub max_weight: u64,
    /// Entries evicted for capacity
    pub evictions: u64,
    /// Entries dropped on expiry
    pub expirations: u64,
    /// Inserts rejected as larger than the whole tier
    pub rejected: u64,
}

/// Local tier - sharded LRU store
pub struct LocalStore {
    shards: Vec<Shard>,
    mask: usize,
    usage: Arc<Usage>,
    max_entries: usize,
    max_weight: u64,
    evicting: Mutex<()>,
    rejected: AtomicU64,
}

/// Largest power of two not above `n` (`n >= 1`)
fn floor_power_of_two(n: usize) -> usize {
    1 << (usize::BITS - 1 - n.leading_zeros())
}

impl LocalStore {
    /// Create a new local store
    pub fn new(config: &LocalStoreConfig) -> Self {
        let max_entries = config.max_entries.max(1);
        let shard_count = floor_power_of_two(config.shard_count.clamp(1, max_entries));
        let usage = Arc::new(Usage::default());

        let shards = (0..shard_count)
            .map(|_| Shard::new(Arc::clone(&usage)))
            .collect();

        Self {
            shards,
            mask: shard_count - 1,
            usage,
            max_entries,
            max_weight: config.max_weight.max(1),
            evicting: Mutex::new(()),
            rejected: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, key: &str) -> usize {
        (fx_hash(key.as_bytes()) as usize) & self.mask
    }

    #[inline]
    fn shard(&self, key: &str) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn over_budget(&self) -> bool {
        self.usage.weight() > self.max_weight || self.usage.entries() > self.max_entries
    }

    /// Evict LRU entries, home shard first, until the tier fits.
    /// `keep` (the entry just written) is never chosen.
    fn evict_to_fit(&self, home: usize, keep: &str) -> usize {
        if !self.over_budget() {
            return 0;
        }
        let _evicting = self.evicting.lock();
        let mut evicted = 0;
        for offset in 0..self.shards.len() {
            let shard = &self.shards[(home + offset) & self.mask];
            while self.over_budget() {
                if shard.pop_lru(keep).is_none() {
                    break;
                }
                evicted += 1;
            }
            if !self.over_budget() {
                break;
            }
        }
        evicted
    }

    /// Synchronous lookup
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.shard(key).get(key, Instant::now())
    }

    /// Synchronous insert
    pub fn insert(&self, key: &str, value: CachedValue, ttl: Duration) {
        let entry = CacheEntry::new(key, value, ttl);
        if entry.weight > self.max_weight {
            // Never leave an older value behind for a key we were told to overwrite
            self.remove(key);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key, weight = entry.weight, "entry larger than the local tier, not cached");
            return;
        }

        let home = self.shard_index(key);
        self.shards[home].insert(key.to_string(), entry);
        let evicted = self.evict_to_fit(home, key);
        if evicted > 0 {
            debug!(key, evicted, "local tier evicted entries to make room");
        }
    }

    /// Synchronous removal
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key).remove(key).is_some()
    }

    /// Remove every matching key across all shards
    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        if pattern.is_exact() {
            return usize::from(self.remove(pattern.as_str()));
        }
        self.shards.iter().map(|s| s.remove_matching(pattern)).sum()
    }

    /// Drop every expired entry; returns the number removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self.shards.iter().map(|s| s.purge_expired(now)).sum();
        if removed > 0 {
            trace!(removed, "swept expired local entries");
        }
        removed
    }

    /// Clear the store
    pub fn clear(&self) {
        self.shards.iter().for_each(Shard::clear);
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current weight
    pub fn weight(&self) -> u64 {
        self.usage.weight()
    }

    /// Capacity in bytes
    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    /// Number of shards keys are spread over
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get store statistics
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.len(),
            max_entries: self.max_entries,
            weight: self.weight(),
            max_weight: self.max_weight,
            evictions: self.shards.iter().map(Shard::evictions).sum(),
            expirations: self.shards.iter().map(Shard::expirations).sum(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CacheStore for LocalStore {
    fn tier(&self) -> CacheTier {
        CacheTier::Local
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove(key))
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        Ok(self.remove_matching(pattern))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(max_entries: usize, max_weight: u64, shards: usize) -> LocalStoreConfig {
        LocalStoreConfig {
            max_entries,
            max_weight,
            shard_count: shards,
            ..Default::default()
        }
    }

    fn value(data: &'static [u8]) -> CachedValue {
        CachedValue::Present(Bytes::from_static(data))
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_until_ttl() {
        let store = LocalStore::new(&LocalStoreConfig::default());
        store
            .set("Order:id:1", value(b"v"), Duration::from_secs(30))
            .await
            .unwrap();

        let entry = store.get("Order:id:1").await.unwrap().unwrap();
        assert_eq!(entry.value, value(b"v"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.get("Order:id:1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("Order:id:1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_null_sentinel_is_a_hit() {
        let store = LocalStore::new(&LocalStoreConfig::default());
        store
            .set("Product:id:nonexistent-1", CachedValue::Absent, Duration::from_secs(10))
            .await
            .unwrap();

        let entry = store.get("Product:id:nonexistent-1").await.unwrap().unwrap();
        assert!(entry.value.is_absent());
    }

    #[tokio::test]
    async fn test_capacity_bound_holds() {
        let store = LocalStore::new(&config(10_000, 4_096, 4));
        for i in 0..500 {
            let key = format!("Order:id:{}", i);
            store.set(&key, value(&[7u8; 100]), Duration::from_secs(60)).await.unwrap();
            assert!(store.weight() <= store.max_weight());
        }
        let stats = store.stats();
        assert!(stats.evictions > 0);
        assert!(stats.entries < 500);
    }

    #[tokio::test]
    async fn test_entry_bound_holds_with_more_shards_than_entries() {
        let store = LocalStore::new(&config(4, 1 << 20, 16));
        assert_eq!(store.shard_count(), 4);
        for i in 0..64 {
            let key = format!("Order:id:{}", i);
            store.set(&key, value(b"v"), Duration::from_secs(60)).await.unwrap();
            assert!(store.len() <= 4);
            // The entry just written always survives its own insert
            assert!(store.lookup(&key).is_some());
        }
        assert_eq!(store.len(), 4);
        assert_eq!(store.stats().evictions, 60);
    }

    #[tokio::test]
    async fn test_small_weight_budget_still_caches() {
        let store = LocalStore::new(&config(100_000, 1_024, 16));
        store.set("Order:id:1", value(b"v"), Duration::from_secs(60)).await.unwrap();

        let entry = store.get("Order:id:1").await.unwrap().unwrap();
        assert_eq!(entry.value, value(b"v"));
        assert_eq!(store.stats().rejected, 0);
    }

    #[tokio::test]
    async fn test_entry_heavier_than_a_shard_slice_is_stored() {
        let store = LocalStore::new(&config(1_000, 4_096, 16));
        // Far above 4096 / 16, still under the tier budget
        store.set("Order:id:big", value(&[1u8; 2_048]), Duration::from_secs(60)).await.unwrap();
        assert!(store.lookup("Order:id:big").is_some());

        // Above the whole budget: rejected, and the older value is gone too
        store.set("Order:id:big", value(&[2u8; 8_192]), Duration::from_secs(60)).await.unwrap();
        assert!(store.lookup("Order:id:big").is_none());
        assert_eq!(store.stats().rejected, 1);
        assert_eq!(store.weight(), 0);
    }

    #[test]
    fn test_shard_count_rounds_down_to_power_of_two() {
        assert_eq!(LocalStore::new(&config(6, 1 << 20, 16)).shard_count(), 4);
        assert_eq!(LocalStore::new(&config(1, 1 << 20, 16)).shard_count(), 1);
        assert_eq!(LocalStore::new(&config(10_000, 1 << 20, 16)).shard_count(), 16);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = LocalStore::new(&LocalStoreConfig::default());
        store.set("k", value(b"v"), Duration::from_secs(60)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.delete("never-existed").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_matching_across_shards() {
        let store = LocalStore::new(&config(1_000, 1 << 20, 8));
        for i in 0..20 {
            let key = format!("Order:agg:sum:f{}:none", i);
            store.set(&key, value(b"1"), Duration::from_secs(60)).await.unwrap();
        }
        store.set("Order:id:1", value(b"1"), Duration::from_secs(60)).await.unwrap();

        let pattern = KeyPattern::parse("Order:agg:*").unwrap();
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 20);
        assert_eq!(store.len(), 1);

        let exact = KeyPattern::exact("Order:id:1").unwrap();
        assert_eq!(store.delete_matching(&exact).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let store = LocalStore::new(&config(1_000, 1 << 20, 4));
        for i in 0..10 {
            let ttl = if i % 2 == 0 { 1 } else { 100 };
            store
                .set(&format!("k{}", i), value(b"x"), Duration::from_secs(ttl))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep_expired(), 5);
        assert_eq!(store.len(), 5);
        assert_eq!(store.stats().expirations, 5);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(LocalStore::new(&LocalStoreConfig::default()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = format!("Order:id:{}-{}", t, i);
                        store.insert(&key, CachedValue::Absent, Duration::from_secs(60));
                        store.lookup(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8000);
    }
}
