//! Store Contract
//!
//! Both tiers implement [`CacheStore`]. Implementations surface transport
//! failures as errors; converting them into misses is the job of
//! [`crate::resilience::GuardedStore`], never of a store.

use std::time::Duration;

use async_trait::async_trait;

use super::entry::{CacheEntry, CachedValue};
use super::pattern::KeyPattern;
use crate::error::Result;

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// In-process tier
    Local,
    /// Shared remote tier
    Remote,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Local => write!(f, "local"),
            CacheTier::Remote => write!(f, "remote"),
        }
    }
}

/// Bounded key-value store with per-entry expiry
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Which tier this store is
    fn tier(&self) -> CacheTier;

    /// Fetch a live entry. Expired entries are a miss and are removed.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite an entry living for `ttl`
    async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> Result<()>;

    /// Remove one key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key matching `pattern`, returning how many were removed
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize>;
}
