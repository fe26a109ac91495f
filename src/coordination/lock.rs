//! Cross-Process Load Lock
//!
//! A lease held in the remote tier under `lock:{key}`, taken with an atomic
//! set-if-absent and released with compare-and-delete on a per-holder
//! token, so a holder whose lease already expired can never release a lock
//! someone else now holds.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::RemoteBackend;
use crate::error::Result;
use crate::resilience::GuardedStore;

/// Prefix for lock keys in the remote tier
pub const LOCK_PREFIX: &str = "lock:";

/// Lease lock over the remote backend
pub struct DistributedLock {
    backend: Arc<dyn RemoteBackend>,
    remote: Arc<GuardedStore>,
    lease: Duration,
}

impl DistributedLock {
    /// Calls go through `remote`'s timeout and breaker
    pub fn new(backend: Arc<dyn RemoteBackend>, remote: Arc<GuardedStore>, lease: Duration) -> Self {
        Self {
            backend,
            remote,
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Try once to take the lock for `key`. `Ok(None)` means another holder
    /// has it.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LeaseGuard>> {
        let lock_key = format!("{}{}", LOCK_PREFIX, key);
        let token = Uuid::new_v4().to_string();

        let acquired = self
            .remote
            .run(
                "set_if_absent",
                self.backend
                    .set_if_absent(&lock_key, Bytes::from(token.clone()), self.lease),
            )
            .await?;

        if !acquired {
            trace!(key = %lock_key, "lock held elsewhere");
            return Ok(None);
        }
        debug!(key = %lock_key, lease_ms = self.lease.as_millis() as u64, "lock acquired");
        Ok(Some(LeaseGuard {
            lock_key,
            token,
            backend: Arc::clone(&self.backend),
            remote: Arc::clone(&self.remote),
            released: false,
        }))
    }
}

/// A held lease. Release it explicitly; if dropped unreleased the release
/// is spawned onto the current runtime, and without one the lease simply
/// runs out.
pub struct LeaseGuard {
    lock_key: String,
    token: String,
    backend: Arc<dyn RemoteBackend>,
    remote: Arc<GuardedStore>,
    released: bool,
}

impl LeaseGuard {
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Release the lease; false if it had already expired or changed hands
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        release(&self.backend, &self.remote, &self.lock_key, &self.token).await
    }
}

async fn release(
    backend: &Arc<dyn RemoteBackend>,
    remote: &GuardedStore,
    lock_key: &str,
    token: &str,
) -> Result<bool> {
    let released = remote
        .run(
            "delete_if_equals",
            backend.delete_if_equals(lock_key, token.as_bytes()),
        )
        .await?;
    if released {
        debug!(key = %lock_key, "lock released");
    } else {
        debug!(key = %lock_key, "lease expired before release");
    }
    Ok(released)
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!(key = %self.lock_key, "no runtime to release lock, lease will expire");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let remote = Arc::clone(&self.remote);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(err) = release(&backend, &remote, &lock_key, &token).await {
                debug!(key = %lock_key, error = %err, "deferred lock release failed");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMetrics, InMemoryRemoteBackend, RemoteStore};
    use crate::config::{BreakerConfig, FailureMode};

    fn lock(backend: Arc<InMemoryRemoteBackend>, lease: Duration) -> DistributedLock {
        let remote = Arc::new(GuardedStore::new(
            Arc::new(RemoteStore::new(backend.clone())),
            Duration::from_millis(100),
            &BreakerConfig::default(),
            FailureMode::FailOpen,
            Arc::new(CacheMetrics::new()),
        ));
        DistributedLock::new(backend, remote, lease)
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let backend = Arc::new(InMemoryRemoteBackend::new());
        let a = lock(backend.clone(), Duration::from_secs(10));
        let b = lock(backend.clone(), Duration::from_secs(10));

        let held = a.try_acquire("Order:id:1").await.unwrap().unwrap();
        assert_eq!(held.lock_key(), "lock:Order:id:1");
        assert!(b.try_acquire("Order:id:1").await.unwrap().is_none());

        // Different key, independent lock
        assert!(b.try_acquire("Order:id:2").await.unwrap().is_some());

        assert!(held.release().await.unwrap());
        assert!(b.try_acquire("Order:id:1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_cannot_release_new_holder() {
        let backend = Arc::new(InMemoryRemoteBackend::new());
        let a = lock(backend.clone(), Duration::from_secs(10));
        let b = lock(backend.clone(), Duration::from_secs(10));

        let stale = a.try_acquire("k").await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let fresh = b.try_acquire("k").await.unwrap().unwrap();
        assert!(!stale.release().await.unwrap());
        assert!(a.try_acquire("k").await.unwrap().is_none());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let backend = Arc::new(InMemoryRemoteBackend::new());
        let a = lock(backend.clone(), Duration::from_secs(10));

        drop(a.try_acquire("k").await.unwrap().unwrap());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(a.try_acquire("k").await.unwrap().is_some());
    }
}
