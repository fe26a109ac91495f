//! cacheguard - Cache Reliability Engine
//!
//! A read-through cache for data-access pipelines that keeps working when
//! the cache itself misbehaves. It guards the authoritative store against
//! stampedes, penetration and avalanches, and keeps cached reads fresh by
//! invalidating on every mutation.
//!
//! # Architecture
//!
//! ```text
//! OperationInterceptor (pipeline hooks)
//!        │
//!        ▼
//! KeyPolicy ──▶ CacheEngine ──▶ GuardedStore(local) ──▶ LocalStore
//!                  │    │   └──▶ GuardedStore(remote) ──▶ RemoteBackend
//!                  │    └──▶ SingleFlight + DistributedLock ──▶ loader
//!                  └──▶ InvalidationManager (mutations, relations)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Entries, tiers, TTL policy and counters
//! - [`config`] - Engine configuration
//! - [`coordination`] - Stampede protection (singleflight, distributed lock)
//! - [`engine`] - Read-through orchestration
//! - [`error`] - Error types
//! - [`invalidation`] - Mutation-driven invalidation
//! - [`monitoring`] - Health and Prometheus exposition
//! - [`pipeline`] - Before/after hook contract
//! - [`policy`] - Cacheability, keys and fingerprints
//! - [`resilience`] - Timeouts, circuit breakers, fail-open/closed

pub mod cache;
pub mod config;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod monitoring;
pub mod pipeline;
pub mod policy;
pub mod resilience;

// Re-export commonly used types
pub use cache::{CachedValue, CacheTier, InMemoryRemoteBackend, MetricsSnapshot, RemoteBackend};
pub use config::{EngineConfig, FailureMode};
pub use engine::{CacheEngine, CacheEngineBuilder};
pub use error::{Error, Result};
pub use invalidation::{InvalidationReport, RelationConfig};
pub use pipeline::{CacheInterceptor, OperationInterceptor, OperationOutcome, ReadDecision};
pub use policy::{KeyPolicy, OperationContext, OperationKind};
