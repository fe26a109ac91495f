//! Two-Tier Cache Storage
//!
//! Bounded stores, the key pattern grammar both tiers share, and the TTL
//! policy that decides how long anything lives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CacheEngine                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Local Tier (in-process)          │  Remote Tier (shared service)    │
//! │  ┌─────────────────────────┐      │  ┌──────────────────────────┐    │
//! │  │ LocalStore              │      │  │ RemoteStore              │    │
//! │  │ N-way sharded LRU       │      │  │ over dyn RemoteBackend   │    │
//! │  │ entry + weight bounded  │      │  │ set-if-absent, scan      │    │
//! │  └─────────────────────────┘      │  └──────────────────────────┘    │
//! │              │                    │               │                  │
//! │              └──────── CacheStore trait ──────────┘                  │
//! │                              │                                       │
//! │              KeyPattern (shared wildcard grammar)                    │
//! │              TtlPolicy  (jitter, null sentinel, near-cache cap)      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Stores report failures; they never turn them into misses
//! - A known-absent key is cached as [`CachedValue::Absent`], a hit
//! - Expired entries are never returned

mod entry;
mod local;
mod metrics;
mod pattern;
mod remote;
mod shard;
mod store;
mod ttl;

pub use entry::{CacheEntry, CachedValue, ENTRY_OVERHEAD};
pub use local::{LocalStats, LocalStore};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use pattern::{KeyPattern, SEGMENT_SEPARATOR};
pub use remote::{
    InMemoryRemoteBackend, RemoteBackend, RemoteBackendStats, RemoteStore, RemoteValue,
};
pub use store::{CacheStore, CacheTier};
pub use ttl::TtlPolicy;
