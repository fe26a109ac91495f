//! Invalidation Manager
//!
//! Turns a successful mutation into an [`InvalidationPlan`] and applies it
//! to every tier:
//!
//! 1. direct keys of the mutated records (`{entity}:id:{id}`)
//! 2. every scoped query of the entity type (`{entity}:list:*`, `agg`,
//!    `group`, `sort`, `page`)
//! 3. related patterns from the [`RelationConfig`]
//!
//! Each deletion is retried with exponential backoff. A deletion that still
//! fails is logged and kept as a [`FailedInvalidation`] for
//! [`InvalidationManager::replay_failed`]; it never fails the mutation.
//!
//! Every plan is stamped with a new epoch when it is scheduled, and the last
//! [`EPOCH_LOG_LIMIT`] stamps are kept. A load that overlapped a plan covering
//! its key must not write its result back, since the deletion may already
//! have passed that key.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::relations::RelationConfig;
use crate::cache::{CacheMetrics, KeyPattern, SEGMENT_SEPARATOR};
use crate::config::InvalidationConfig;
use crate::error::{Error, Result};
use crate::policy::{entity_key, escape, scoped_patterns, OperationContext};
use crate::resilience::GuardedStore;

/// One thing to delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    Key(String),
    Pattern(KeyPattern),
}

impl InvalidationTarget {
    pub fn as_str(&self) -> &str {
        match self {
            InvalidationTarget::Key(key) => key,
            InvalidationTarget::Pattern(pattern) => pattern.as_str(),
        }
    }

    /// True if deleting this target removes `key`
    pub fn covers(&self, key: &str) -> bool {
        match self {
            InvalidationTarget::Key(target) => target == key,
            InvalidationTarget::Pattern(pattern) => pattern.matches(key),
        }
    }
}

/// Scheduled plans remembered for [`InvalidationManager::invalidated_since`]
pub const EPOCH_LOG_LIMIT: usize = 1024;

/// Everything one mutation invalidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub entity_type: String,
    pub mutation_id: Option<String>,
    pub targets: Vec<InvalidationTarget>,
}

impl InvalidationPlan {
    /// A plan that deletes a single key
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            entity_type: String::new(),
            mutation_id: None,
            targets: vec![InvalidationTarget::Key(key.into())],
        }
    }

    /// A plan that deletes every key matching `pattern`
    pub fn pattern(pattern: KeyPattern) -> Self {
        Self {
            entity_type: String::new(),
            mutation_id: None,
            targets: vec![InvalidationTarget::Pattern(pattern)],
        }
    }
}

/// A deletion that exhausted its retries
#[derive(Debug, Clone, Serialize)]
pub struct FailedInvalidation {
    pub entity_type: String,
    pub pattern: String,
    pub exact: bool,
    pub tier: String,
    pub mutation_id: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of applying a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries removed, summed over tiers
    pub removed: usize,
    /// Deletions dead-lettered
    pub failed: usize,
}

/// Invalidation manager
#[derive(Clone)]
pub struct InvalidationManager {
    inner: Arc<Inner>,
}

struct Inner {
    tiers: Vec<Arc<GuardedStore>>,
    relations: RelationConfig,
    config: InvalidationConfig,
    metrics: Arc<CacheMetrics>,
    pending: AtomicUsize,
    epoch: AtomicU64,
    recent: Mutex<VecDeque<(u64, Vec<InvalidationTarget>)>>,
    idle: Notify,
    failed: Mutex<Vec<FailedInvalidation>>,
}

impl InvalidationManager {
    /// `tiers` are invalidated in order; put the shared tier first
    pub fn new(
        tiers: Vec<Arc<GuardedStore>>,
        relations: RelationConfig,
        config: InvalidationConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tiers,
                relations,
                config,
                metrics,
                pending: AtomicUsize::new(0),
                epoch: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::new()),
                idle: Notify::new(),
                failed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build the plan for a mutation
    pub fn plan(&self, ctx: &OperationContext) -> Result<InvalidationPlan> {
        let entity = &ctx.entity_type;
        let records = ctx.records();

        let mut keys = BTreeSet::new();
        if let Some(id) = &ctx.params.id {
            keys.insert(entity_key(entity, id));
        }
        for record in &records {
            if let Some(id) = record.get(&self.inner.config.id_field).filter(|v| !v.is_null()) {
                keys.insert(entity_key(entity, id));
            }
        }

        let mut targets: Vec<InvalidationTarget> =
            keys.into_iter().map(InvalidationTarget::Key).collect();
        if targets.is_empty() {
            // No identifiable record: any point lookup of the type may be stale
            debug!(entity_type = %entity, "mutation without ids, dropping all point lookups");
            let all_ids = format!("{}{sep}id{sep}*", escape(entity), sep = SEGMENT_SEPARATOR);
            targets.push(InvalidationTarget::Pattern(KeyPattern::parse(&all_ids)?));
        }

        targets.extend(scoped_patterns(entity)?.into_iter().map(InvalidationTarget::Pattern));
        for pattern in self.inner.relations.resolve(entity, &records)? {
            let target = InvalidationTarget::Pattern(pattern);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        Ok(InvalidationPlan {
            entity_type: entity.clone(),
            mutation_id: ctx.mutation_id.clone(),
            targets,
        })
    }

    /// Apply a plan in the background. The caller does not wait; use
    /// [`InvalidationManager::flush`] to wait for quiescence.
    pub fn submit(&self, plan: InvalidationPlan) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("invalidation needs a tokio runtime: {}", e)))?;

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.stamp(&plan.targets);
        let pending = PendingGuard(Arc::clone(&self.inner));
        handle.spawn(async move {
            pending.0.apply(&plan).await;
            drop(pending);
        });
        Ok(())
    }

    /// Apply a plan and wait for it
    pub async fn invalidate_now(&self, plan: &InvalidationPlan) -> InvalidationReport {
        self.inner.stamp(&plan.targets);
        self.inner.apply(plan).await
    }

    /// Wait until no submitted plan is still running
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Epoch of the most recently scheduled plan
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// True if a plan scheduled after `epoch` covers `key`. Answers true
    /// when those plans have already left the log.
    pub fn invalidated_since(&self, epoch: u64, key: &str) -> bool {
        if self.epoch() == epoch {
            return false;
        }
        let recent = self.inner.recent.lock();
        match recent.front() {
            Some((oldest, _)) if *oldest <= epoch + 1 => {}
            _ => return true,
        }
        recent
            .iter()
            .filter(|(stamp, _)| *stamp > epoch)
            .any(|(_, targets)| targets.iter().any(|target| target.covers(key)))
    }

    /// Submitted plans still running
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Dead-lettered deletions
    pub fn failed(&self) -> Vec<FailedInvalidation> {
        self.inner.failed.lock().clone()
    }

    pub fn failed_count(&self) -> usize {
        self.inner.failed.lock().len()
    }

    /// Retry every dead-lettered deletion. Ones that fail again go back on
    /// the list with fresh context. Returns how many succeeded.
    pub async fn replay_failed(&self) -> Result<usize> {
        let letters = std::mem::take(&mut *self.inner.failed.lock());
        if letters.is_empty() {
            return Ok(0);
        }
        info!(count = letters.len(), "replaying failed invalidations");

        let mut replayed = 0;
        for letter in letters {
            let target = if letter.exact {
                InvalidationTarget::Key(letter.pattern.clone())
            } else {
                InvalidationTarget::Pattern(KeyPattern::parse(&letter.pattern)?)
            };
            let Some(tier) = self
                .inner
                .tiers
                .iter()
                .find(|t| t.tier().to_string() == letter.tier)
            else {
                warn!(tier = %letter.tier, pattern = %letter.pattern, "dead letter for unknown tier dropped");
                continue;
            };
            self.inner.stamp(std::slice::from_ref(&target));
            let plan = InvalidationPlan {
                entity_type: letter.entity_type,
                mutation_id: letter.mutation_id,
                targets: Vec::new(),
            };
            if self.inner.delete_with_retry(tier, &target, &plan).await.is_some() {
                replayed += 1;
            }
        }
        Ok(replayed)
    }
}

impl Inner {
    fn stamp(&self, targets: &[InvalidationTarget]) {
        let mut recent = self.recent.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        recent.push_back((epoch, targets.to_vec()));
        if recent.len() > EPOCH_LOG_LIMIT {
            recent.pop_front();
        }
    }

    async fn apply(&self, plan: &InvalidationPlan) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        for target in &plan.targets {
            for tier in &self.tiers {
                match self.delete_with_retry(tier, target, plan).await {
                    Some(removed) => report.removed += removed,
                    None => report.failed += 1,
                }
            }
        }
        self.metrics.record_invalidation();
        debug!(
            entity_type = %plan.entity_type,
            mutation_id = plan.mutation_id.as_deref().unwrap_or("-"),
            targets = plan.targets.len(),
            removed = report.removed,
            failed = report.failed,
            "invalidation applied"
        );
        report
    }

    /// `None` once retries are exhausted (and the failure dead-lettered)
    async fn delete_with_retry(
        &self,
        tier: &GuardedStore,
        target: &InvalidationTarget,
        plan: &InvalidationPlan,
    ) -> Option<usize> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match target {
                InvalidationTarget::Key(key) => tier.delete(key).await.map(usize::from),
                InvalidationTarget::Pattern(pattern) => tier.delete_matching(pattern).await,
            };
            match result {
                Ok(removed) => return Some(removed),
                Err(err) if attempt < max_attempts => {
                    self.metrics.record_invalidation_retry();
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        pattern = target.as_str(),
                        tier = %tier.tier(),
                        attempt,
                        error = %err,
                        "invalidation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.dead_letter(tier, target, plan, attempt, &err);
                    return None;
                }
            }
        }
    }

    fn dead_letter(
        &self,
        tier: &GuardedStore,
        target: &InvalidationTarget,
        plan: &InvalidationPlan,
        attempts: u32,
        err: &Error,
    ) {
        self.metrics.record_invalidation_failure();
        error!(
            entity_type = %plan.entity_type,
            pattern = target.as_str(),
            mutation_id = plan.mutation_id.as_deref().unwrap_or("-"),
            tier = %tier.tier(),
            attempts,
            error = %err,
            "invalidation failed, kept for replay"
        );
        self.failed.lock().push(FailedInvalidation {
            entity_type: plan.entity_type.clone(),
            pattern: target.as_str().to_string(),
            exact: matches!(target, InvalidationTarget::Key(_)),
            tier: tier.tier().to_string(),
            mutation_id: plan.mutation_id.clone(),
            attempts,
            error: err.to_string(),
            failed_at: Utc::now(),
        });
    }
}

struct PendingGuard(Arc<Inner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
