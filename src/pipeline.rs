//! Pipeline Integration
//!
//! The surrounding operation pipeline talks to the cache through two hooks:
//!
//! ```text
//! before_read(ctx) ──▶ Hit(value)  → skip the operation
//!                  └─▶ Proceed     → run it, then
//! after_operation(ctx, outcome)
//!     ├─ read loaded   → store per TTL policy
//!     ├─ mutation done → schedule invalidation
//!     └─ failed        → nothing is cached
//! ```
//!
//! Hooks alone do not coalesce concurrent misses. Pipelines that can hand the
//! operation over as a closure should use [`CacheInterceptor::read_through`],
//! which does.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::engine::CacheEngine;
use crate::error::{Error, Result};
use crate::policy::OperationContext;

/// Answer of [`OperationInterceptor::before_read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadDecision {
    /// Served from cache; `None` is a cached "known absent"
    Hit(Option<Bytes>),
    /// Run the operation against the authoritative store
    Proceed,
}

/// What the operation did, as reported to [`OperationInterceptor::after_operation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// A read finished; `None` means nothing was found
    Loaded(Option<Bytes>),
    /// A mutation was committed
    Applied,
    /// The operation failed
    Failed(String),
}

/// Before/after hook contract of the operation pipeline
#[async_trait]
pub trait OperationInterceptor: Send + Sync {
    async fn before_read(&self, ctx: &OperationContext) -> Result<ReadDecision>;

    async fn after_operation(&self, ctx: &OperationContext, outcome: &OperationOutcome) -> Result<()>;
}

/// [`OperationInterceptor`] backed by a [`CacheEngine`]
#[derive(Clone)]
pub struct CacheInterceptor {
    engine: CacheEngine,
}

impl CacheInterceptor {
    pub fn new(engine: CacheEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    /// Run a read with stampede protection
    pub async fn read_through<F, Fut>(&self, ctx: &OperationContext, loader: F) -> Result<Option<Bytes>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<Bytes>>> + Send + 'static,
    {
        self.engine.read_through(ctx, loader).await
    }

    /// Run a mutation and schedule invalidation if it succeeds. The
    /// mutation's own result is returned untouched.
    pub async fn mutate<T, Fut>(&self, ctx: &OperationContext, mutation: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let result = mutation.await;
        if result.is_ok() {
            self.engine.handle_mutation(ctx);
        }
        result
    }
}

#[async_trait]
impl OperationInterceptor for CacheInterceptor {
    async fn before_read(&self, ctx: &OperationContext) -> Result<ReadDecision> {
        let Some(plan) = self.engine.key_policy().plan(ctx) else {
            return Ok(ReadDecision::Proceed);
        };
        Ok(match self.engine.get(&plan.key).await? {
            Some(value) => ReadDecision::Hit(value.into_option()),
            None => ReadDecision::Proceed,
        })
    }

    async fn after_operation(&self, ctx: &OperationContext, outcome: &OperationOutcome) -> Result<()> {
        match outcome {
            OperationOutcome::Loaded(value) => {
                if let Some(plan) = self.engine.key_policy().plan(ctx) {
                    self.engine.set(&plan.key, value.clone(), plan.base_ttl).await?;
                }
                Ok(())
            }
            OperationOutcome::Applied if ctx.kind.is_mutation() => {
                self.engine.handle_mutation(ctx);
                Ok(())
            }
            OperationOutcome::Applied => Err(Error::Internal(format!(
                "{} reported as applied but is not a mutation",
                ctx.kind
            ))),
            OperationOutcome::Failed(reason) => {
                debug!(entity_type = %ctx.entity_type, kind = %ctx.kind, reason = %reason, "operation failed, cache untouched");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
