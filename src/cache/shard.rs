//! LRU Shard
//!
//! One slice of the local tier: an access-ordered table behind a single
//! mutex. The local store routes keys across a
//! power-of-two number of shards to keep lock contention low.
//!
//! Shards carry no capacity of their own. Every shard of a store reports into
//! one shared [`Usage`], and the store evicts across shards until the whole
//! tier is back under its entry and weight budget.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::entry::CacheEntry;
use super::pattern::KeyPattern;

/// Entry count and weight shared by every shard of one store
#[derive(Debug, Default)]
pub struct Usage {
    entries: AtomicUsize,
    weight: AtomicU64,
}

impl Usage {
    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Acquire)
    }

    fn added(&self, weight: u64) {
        self.entries.fetch_add(1, Ordering::AcqRel);
        self.weight.fetch_add(weight, Ordering::AcqRel);
    }

    fn removed(&self, weight: u64) {
        self.entries.fetch_sub(1, Ordering::AcqRel);
        self.weight.fetch_sub(weight, Ordering::AcqRel);
    }
}

struct ShardInner {
    lru: LruCache<String, CacheEntry>,
}

impl ShardInner {
    fn take(&mut self, key: &str, usage: &Usage) -> Option<CacheEntry> {
        let removed = self.lru.pop(key);
        if let Some(entry) = &removed {
            usage.removed(entry.weight);
        }
        removed
    }

    fn put(&mut self, key: String, entry: CacheEntry, usage: &Usage) {
        let added = entry.weight;
        if let Some(old) = self.lru.put(key, entry) {
            usage.removed(old.weight);
        }
        usage.added(added);
    }
}

/// Single shard of the local tier
pub struct Shard {
    inner: Mutex<ShardInner>,
    usage: Arc<Usage>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Shard {
    /// Create a new empty shard reporting into `usage`
    pub fn new(usage: Arc<Usage>) -> Self {
        Self {
            inner: Mutex::new(ShardInner {
                lru: LruCache::unbounded(),
            }),
            usage,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a live entry and mark it most recently used.
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let expired = match inner.lru.peek(key) {
            None => return None,
            Some(entry) => entry.is_expired_at(now),
        };
        if expired {
            inner.take(key, &self.usage);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.lru.get(key).cloned()
    }

    /// Insert (or replace) an entry as the most recently used
    pub fn insert(&self, key: String, entry: CacheEntry) {
        self.inner.lock().put(key, entry, &self.usage);
    }

    /// Evict the least recently used entry other than `keep`.
    /// Returns the evicted weight, or `None` when nothing else is left.
    pub fn pop_lru(&self, keep: &str) -> Option<u64> {
        let mut inner = self.inner.lock();
        let lru_is_kept = matches!(inner.lru.peek_lru(), Some((key, _)) if key == keep);
        if lru_is_kept {
            inner.lru.promote(keep);
        }
        let victim = match inner.lru.peek_lru() {
            Some((key, _)) if key != keep => key.clone(),
            _ => return None,
        };
        let evicted = inner.take(&victim, &self.usage)?;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Some(evicted.weight)
    }

    /// Remove an entry, returning it if present
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().take(key, &self.usage)
    }

    /// Remove every key matching `pattern`
    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .lru
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.take(key, &self.usage);
        }
        doomed.len()
    }

    /// Remove every expired entry
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.take(key, &self.usage);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        expired.len()
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        while let Some((_, entry)) = inner.lru.pop_lru() {
            self.usage.removed(entry.weight);
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Entries evicted for capacity
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries removed because they expired
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
