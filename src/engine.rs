//! Cache Engine - Read-Through Orchestration
//!
//! Ties the tiers, the TTL policy, stampede coordination, failure
//! containment and invalidation together behind one handle.
//!
//! # Read path
//!
//! ```text
//! get_or_load(key)
//!   │
//!   ├─ local hit ─────────────────────────────────────────────▶ value
//!   ├─ remote hit ── copy to local (near-cache TTL) ──────────▶ value
//!   │
//!   └─ miss ── SingleFlight(key) ── leader only:
//!                ├─ re-check tiers
//!                ├─ distributed lock (if remote + enabled)
//!                │    ├─ held    → load, write back, release
//!                │    └─ busy    → poll tiers until poll_wait, then load
//!                └─ write back to every tier with the jittered TTL
//! ```
//!
//! A loader error reaches every waiter and is never cached. A load that an
//! invalidation of its key overlapped is returned to its callers but not
//! written back.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheMetrics, CacheStore, CacheTier, CachedValue, KeyPattern, LocalStore, MetricsSnapshot,
    RemoteBackend, RemoteStore, TtlPolicy,
};
use crate::config::{EngineConfig, FailureMode};
use crate::coordination::{DistributedLock, LeaseGuard, SingleFlight};
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationManager, InvalidationPlan, InvalidationReport, RelationConfig};
use crate::monitoring::{HealthCheck, HealthCheckResult, HealthResponse};
use crate::policy::{KeyPolicy, OperationContext};
use crate::resilience::{BreakerStatus, GuardedStore};

type LoadResult = Result<Option<Bytes>>;

/// Builder for [`CacheEngine`]
#[derive(Default)]
pub struct CacheEngineBuilder {
    config: EngineConfig,
    remote: Option<Arc<dyn RemoteBackend>>,
    relations: RelationConfig,
    scope_metadata: Vec<String>,
}

impl CacheEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable the shared remote tier
    pub fn remote(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    pub fn relations(mut self, relations: RelationConfig) -> Self {
        self.relations = relations;
        self
    }

    /// Metadata entries folded into query keys (e.g. `tenant`)
    pub fn scope_metadata<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope_metadata = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<CacheEngine> {
        self.config.validate()?;
        self.relations.validate()?;

        let config = self.config;
        let metrics = Arc::new(CacheMetrics::new());
        let ttl = TtlPolicy::new(config.ttl.clone());
        let keys = KeyPolicy::new(ttl.clone()).with_scope_metadata(self.scope_metadata);

        let local_store = Arc::new(LocalStore::new(&config.local));
        let local = Arc::new(GuardedStore::new(
            Arc::clone(&local_store) as Arc<dyn CacheStore>,
            config.local.call_timeout,
            &config.breaker,
            config.failure_mode,
            Arc::clone(&metrics),
        ));

        let (remote, lock) = match self.remote {
            Some(backend) => {
                let remote = Arc::new(GuardedStore::new(
                    Arc::new(RemoteStore::new(Arc::clone(&backend))),
                    config.remote.call_timeout,
                    &config.breaker,
                    config.failure_mode,
                    Arc::clone(&metrics),
                ));
                let lock = config.stampede.distributed_lock.then(|| {
                    DistributedLock::new(backend, Arc::clone(&remote), config.stampede.lock_lease)
                });
                (Some(remote), lock)
            }
            None => (None, None),
        };

        // Shared tier first so a local re-fill cannot read the stale remote copy
        let mut tiers = Vec::new();
        if let Some(remote) = &remote {
            tiers.push(Arc::clone(remote));
        }
        tiers.push(Arc::clone(&local));
        let invalidation = InvalidationManager::new(
            tiers,
            self.relations,
            config.invalidation.clone(),
            Arc::clone(&metrics),
        );

        info!(
            remote = remote.is_some(),
            distributed_lock = lock.is_some(),
            failure_mode = %config.failure_mode,
            local_max_entries = config.local.max_entries,
            local_max_weight = config.local.max_weight,
            "cache engine ready"
        );

        Ok(CacheEngine {
            inner: Arc::new(EngineInner {
                config,
                keys,
                ttl,
                local_store,
                local,
                remote,
                lock,
                flights: SingleFlight::new(),
                invalidation,
                metrics,
                health: HealthCheck::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Cache reliability engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("remote", &self.inner.remote.is_some())
            .field("distributed_lock", &self.inner.lock.is_some())
            .field("failure_mode", &self.inner.config.failure_mode)
            .field("local_entries", &self.inner.local_store.len())
            .field("in_flight", &self.inner.flights.len())
            .finish()
    }
}

struct EngineInner {
    config: EngineConfig,
    keys: KeyPolicy,
    ttl: TtlPolicy,
    local_store: Arc<LocalStore>,
    local: Arc<GuardedStore>,
    remote: Option<Arc<GuardedStore>>,
    lock: Option<DistributedLock>,
    flights: SingleFlight<LoadResult>,
    invalidation: InvalidationManager,
    metrics: Arc<CacheMetrics>,
    health: HealthCheck,
    shutdown: CancellationToken,
}

enum LockOutcome {
    /// No distributed coordination for this load
    Skipped,
    Held(LeaseGuard),
    /// Another process filled the key while we waited
    Filled(CachedValue),
    /// Gave up waiting; load directly
    TimedOut,
}

impl CacheEngine {
    pub fn builder() -> CacheEngineBuilder {
        CacheEngineBuilder::default()
    }

    /// Local-only engine with default configuration
    pub fn local() -> Result<Self> {
        Self::builder().build()
    }

    /// Look a key up in every tier. `Some(CachedValue::Absent)` is a cached
    /// "known absent".
    pub async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let found = self.inner.probe(key).await?;
        if found.is_none() {
            self.inner.metrics.record_miss();
        }
        Ok(found)
    }

    /// Write a value (or the null sentinel for `None`) to every tier with
    /// the TTL policy applied to `base_ttl`
    pub async fn set(&self, key: &str, value: Option<Bytes>, base_ttl: Duration) -> Result<()> {
        let value = CachedValue::from_load(value);
        match self.inner.ttl.ttl_for(&value, base_ttl) {
            Some(ttl) => self.inner.write_back(key, value, ttl).await,
            None => Ok(()),
        }
    }

    /// Return the cached value for `key`, or run `loader` once across all
    /// concurrent callers, cache its result and return it.
    ///
    /// `Ok(None)` means the authoritative store has no value; it is cached
    /// as the null sentinel when null caching is on.
    pub async fn get_or_load<F, Fut>(&self, key: &str, base_ttl: Duration, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<Bytes>>> + Send + 'static,
    {
        if let Some(value) = self.inner.probe(key).await? {
            return Ok(value.into_option());
        }
        self.inner.metrics.record_miss();

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let (result, leader) = self
            .inner
            .flights
            .run(key, move || async move { inner.load_through(&owned_key, base_ttl, loader).await })
            .await;
        if !leader {
            self.inner.metrics.record_coalesced();
        }
        result
    }

    /// Read-through for an operation: key and TTL come from the key policy.
    /// Non-cacheable operations call `loader` directly.
    pub async fn read_through<F, Fut>(&self, ctx: &OperationContext, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<Bytes>>> + Send + 'static,
    {
        match self.inner.keys.plan(ctx) {
            Some(plan) => self.get_or_load(&plan.key, plan.base_ttl, loader).await,
            None => loader().await.map_err(Error::loader),
        }
    }

    /// Delete one key from every tier. Deleting an absent key is a no-op.
    pub async fn invalidate(&self, key: &str) -> InvalidationReport {
        self.inner
            .invalidation
            .invalidate_now(&InvalidationPlan::key(key))
            .await
    }

    /// Delete every key matching `pattern` from every tier
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self
            .inner
            .invalidation
            .invalidate_now(&InvalidationPlan::pattern(pattern))
            .await)
    }

    /// Schedule invalidation for a successful mutation. Never fails the
    /// mutation; problems are logged and kept for replay.
    pub fn handle_mutation(&self, ctx: &OperationContext) {
        if !ctx.kind.is_mutation() {
            return;
        }
        let submitted = self
            .inner
            .invalidation
            .plan(ctx)
            .and_then(|plan| self.inner.invalidation.submit(plan));
        if let Err(err) = submitted {
            warn!(
                entity_type = %ctx.entity_type,
                mutation_id = ctx.mutation_id.as_deref().unwrap_or("-"),
                error = %err,
                "could not schedule invalidation"
            );
        }
    }

    /// Wait for scheduled invalidations to finish
    pub async fn flush_invalidations(&self) {
        self.inner.invalidation.flush().await;
    }

    pub fn invalidation(&self) -> &InvalidationManager {
        &self.inner.invalidation
    }

    pub fn key_policy(&self) -> &KeyPolicy {
        &self.inner.keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.inner.local_store
    }

    /// Keys with a load in progress in this process
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    /// Breaker status of a tier, if that tier is configured
    pub fn breaker_status(&self, tier: CacheTier) -> Option<BreakerStatus> {
        match tier {
            CacheTier::Local => Some(self.inner.local.breaker_status()),
            CacheTier::Remote => self.inner.remote.as_ref().map(|r| r.breaker_status()),
        }
    }

    /// Engine health
    pub fn health(&self) -> HealthResponse {
        let inner = &self.inner;
        let mode = inner.config.failure_mode;
        let mut checks = vec![inner.health.readiness_check()];
        checks.push(HealthCheckResult::breaker(
            CacheTier::Local,
            inner.local.breaker_status(),
            mode,
        ));
        if let Some(remote) = &inner.remote {
            checks.push(HealthCheckResult::breaker(
                CacheTier::Remote,
                remote.breaker_status(),
                mode,
            ));
        }
        checks.push(HealthCheckResult::invalidation(
            inner.invalidation.pending(),
            inner.invalidation.failed_count(),
        ));
        HealthResponse::new(checks, inner.health.uptime())
    }

    /// Counters plus current gauges
    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let local = inner.local_store.stats();
        let mut snapshot = inner.metrics.snapshot();
        snapshot.local_entries = local.entries as u64;
        snapshot.local_weight_bytes = local.weight;
        snapshot.local_evictions = local.evictions;
        snapshot.in_flight_loads = inner.flights.len() as u64;
        snapshot.pending_invalidations = inner.invalidation.pending() as u64;
        snapshot.dead_letters = inner.invalidation.failed_count() as u64;
        snapshot
    }

    /// Start the background sweep of expired local entries, if configured.
    /// Stops on [`CacheEngine::shutdown`].
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.inner.config.local.sweep_interval?;
        let store = Arc::clone(&self.inner.local_store);
        let token = self.inner.shutdown.child_token();

        info!(interval_ms = interval.as_millis() as u64, "starting local sweep task");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("local sweep task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    }
                }
            }
        }))
    }

    /// Stop background tasks and wait for scheduled invalidations
    pub async fn shutdown(&self) {
        info!("cache engine shutting down");
        self.inner.health.set_ready(false);
        self.inner.shutdown.cancel();
        self.inner.invalidation.flush().await;
    }
}

impl EngineInner {
    /// Tier lookup with hit metrics; a remote hit refills the local tier
    async fn probe(&self, key: &str) -> Result<Option<CachedValue>> {
        if let Some(entry) = self.local.get(key).await? {
            self.record_hit(CacheTier::Local, &entry.value);
            debug!(key, tier = "local", "cache hit");
            return Ok(Some(entry.value));
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(entry) = remote.get(key).await? else {
            return Ok(None);
        };
        self.record_hit(CacheTier::Remote, &entry.value);
        debug!(key, tier = "remote", "cache hit");

        let near_ttl = self.ttl.near_cache_ttl(entry.remaining_ttl());
        if !near_ttl.is_zero() {
            self.local.set(key, entry.value.clone(), near_ttl).await?;
        }
        Ok(Some(entry.value))
    }

    fn record_hit(&self, tier: CacheTier, value: &CachedValue) {
        self.metrics.record_hit(tier);
        if value.is_absent() {
            self.metrics.record_null_hit();
        }
    }

    /// Body of a single flight
    async fn load_through<F, Fut>(&self, key: &str, base_ttl: Duration, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Bytes>>>,
    {
        // A flight that finished just before ours may have filled the key
        if let Some(value) = self.probe(key).await? {
            return Ok(value.into_option());
        }

        let lease = match self.coordinate(key).await? {
            LockOutcome::Filled(value) => return Ok(value.into_option()),
            LockOutcome::Held(lease) => Some(lease),
            LockOutcome::Skipped | LockOutcome::TimedOut => None,
        };

        let result = self.load_and_store(key, base_ttl, loader).await;

        if let Some(lease) = lease {
            if let Err(err) = lease.release().await {
                debug!(key, error = %err, "lock release failed, lease will expire");
            }
        }
        result
    }

    /// Cross-process coordination for one load
    async fn coordinate(&self, key: &str) -> Result<LockOutcome> {
        let Some(lock) = &self.lock else {
            return Ok(LockOutcome::Skipped);
        };
        let stampede = &self.config.stampede;

        if let Some(outcome) = self.try_lock(lock, key).await? {
            return Ok(outcome);
        }

        let started = Instant::now();
        let deadline = started + stampede.poll_wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                let err = Error::LockTimeout {
                    key: key.to_string(),
                    waited: now - started,
                };
                self.metrics.record_lock_timeout();
                warn!(key, error = %err, "gave up waiting for lock holder, loading directly");
                return Ok(LockOutcome::TimedOut);
            }
            tokio::time::sleep(stampede.poll_interval.min(deadline - now)).await;

            if let Some(value) = self.probe(key).await? {
                return Ok(LockOutcome::Filled(value));
            }
            // The holder may have failed and released without filling the key
            if let Some(outcome) = self.try_lock(lock, key).await? {
                return Ok(outcome);
            }
        }
    }

    /// `Some` when the attempt settled the outcome, `None` when the lock is
    /// held elsewhere
    async fn try_lock(&self, lock: &DistributedLock, key: &str) -> Result<Option<LockOutcome>> {
        match lock.try_acquire(key).await {
            Ok(Some(lease)) => {
                self.metrics.record_lock_acquired();
                Ok(Some(LockOutcome::Held(lease)))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_store_failure() && self.config.failure_mode == FailureMode::FailOpen => {
                self.metrics.record_fail_open();
                debug!(key, error = %err, "lock unavailable, loading without coordination");
                Ok(Some(LockOutcome::Skipped))
            }
            Err(err) => Err(err),
        }
    }

    async fn load_and_store<F, Fut>(&self, key: &str, base_ttl: Duration, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Bytes>>>,
    {
        self.metrics.record_load();
        let epoch = self.invalidation.epoch();
        let loaded = match loader().await {
            Ok(loaded) => loaded,
            Err(err) => {
                self.metrics.record_load_failure();
                debug!(key, error = %err, "loader failed, nothing cached");
                return Err(Error::loader(err));
            }
        };

        let value = CachedValue::from_load(loaded);
        if self.invalidation.invalidated_since(epoch, key) {
            // An invalidation overlapped the load; the value may predate it
            debug!(key, "invalidated during load, result not cached");
            return Ok(value.into_option());
        }
        if let Some(ttl) = self.ttl.ttl_for(&value, base_ttl) {
            self.write_back(key, value.clone(), ttl).await?;
            debug!(
                key,
                ttl_ms = ttl.as_millis() as u64,
                absent = value.is_absent(),
                "loaded and cached"
            );
        }
        Ok(value.into_option())
    }

    /// Write to every tier with the same TTL
    async fn write_back(&self, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        if let Some(remote) = &self.remote {
            remote.set(key, value.clone(), ttl).await?;
        }
        self.local.set(key, value, ttl).await
    }
}

// =============================================================================
// Tests
// =============================================================================
