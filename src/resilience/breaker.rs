//! Per-Tier Circuit Breaker
//!
//! ```text
//!            threshold consecutive failures
//!   CLOSED ─────────────────────────────────▶ OPEN
//!     ▲                                        │ cooldown elapsed,
//!     │ probe succeeds                         │ one probe admitted
//!     │                                        ▼
//!     └────────────────────────────────── HALF_OPEN ──▶ OPEN (probe fails)
//! ```
//!
//! Only the single probe admitted in HALF_OPEN can move the breaker out of
//! that state. Calls that were admitted while CLOSED and finish late never
//! close or re-open it on their own.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::CacheTier;
use crate::config::BreakerConfig;
use crate::error::{Error, Result};

/// Breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerStatus::Closed => write!(f, "closed"),
            BreakerStatus::Open => write!(f, "open"),
            BreakerStatus::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: CircuitBreakerState,
    probe_in_flight: bool,
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed
    Normal,
    /// The one trial call after cooldown
    Probe,
}

/// Circuit breaker guarding one tier
#[derive(Debug)]
pub struct CircuitBreaker {
    tier: CacheTier,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(tier: CacheTier, config: &BreakerConfig) -> Self {
        Self {
            tier,
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Ask to make a call. Fails with [`Error::StoreUnavailable`] without
    /// side effects while the breaker is open or a probe is already out.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        let admission = match inner.state.status {
            BreakerStatus::Closed => Admission::Normal,
            BreakerStatus::Open => {
                let cooled = inner
                    .state
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(Error::StoreUnavailable { tier: self.tier });
                }
                inner.state.status = BreakerStatus::HalfOpen;
                inner.probe_in_flight = true;
                info!(tier = %self.tier, "circuit breaker half-open, admitting probe");
                Admission::Probe
            }
            BreakerStatus::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Error::StoreUnavailable { tier: self.tier });
                }
                inner.probe_in_flight = true;
                Admission::Probe
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            admission,
            resolved: false,
        })
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state.status) {
            (Admission::Probe, BreakerStatus::HalfOpen) => {
                inner.state = CircuitBreakerState::default();
                inner.probe_in_flight = false;
                info!(tier = %self.tier, "circuit breaker closed");
            }
            (Admission::Normal, BreakerStatus::Closed) => {
                inner.state.consecutive_failures = 0;
            }
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state.status) {
            (Admission::Probe, BreakerStatus::HalfOpen) => {
                inner.state.status = BreakerStatus::Open;
                inner.state.opened_at = Some(Instant::now());
                inner.state.consecutive_failures += 1;
                inner.probe_in_flight = false;
                warn!(tier = %self.tier, "probe failed, circuit breaker re-opened");
            }
            (Admission::Normal, BreakerStatus::Closed) => {
                inner.state.consecutive_failures += 1;
                if inner.state.consecutive_failures >= self.failure_threshold {
                    inner.state.status = BreakerStatus::Open;
                    inner.state.opened_at = Some(Instant::now());
                    warn!(
                        tier = %self.tier,
                        failures = inner.state.consecutive_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            _ => {
                inner.state.consecutive_failures += 1;
            }
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    pub fn status(&self) -> BreakerStatus {
        self.inner.lock().state.status
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }
}

/// Outstanding admission. Must be resolved with [`BreakerPermit::success`]
/// or [`BreakerPermit::failure`]; an unresolved probe counts as a failure
/// when dropped (e.g. the calling future was cancelled).
#[must_use]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.admission);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.admission);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.admission == Admission::Probe {
            self.breaker.on_failure(Admission::Probe);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CacheTier::Remote,
            &BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let b = breaker(3, 30);
        fail(&b);
        fail(&b);
        assert_eq!(b.status(), BreakerStatus::Closed);
        assert_eq!(b.state().consecutive_failures, 2);

        fail(&b);
        assert_eq!(b.status(), BreakerStatus::Open);
        assert!(b.state().opened_at.is_some());
        assert_matches!(
            b.try_acquire().err(),
            Some(Error::StoreUnavailable { tier: CacheTier::Remote })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_streak() {
        let b = breaker(3, 30);
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().success();
        fail(&b);
        fail(&b);
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cooldown() {
        let b = breaker(1, 30);
        fail(&b);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = b.try_acquire().unwrap();
        assert_eq!(probe.admission(), Admission::Probe);
        assert_eq!(b.status(), BreakerStatus::HalfOpen);

        // Exactly one probe at a time
        assert!(b.try_acquire().is_err());

        probe.success();
        assert_eq!(b.status(), BreakerStatus::Closed);
        assert_eq!(b.try_acquire().unwrap().admission(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let b = breaker(1, 30);
        fail(&b);
        tokio::time::advance(Duration::from_secs(30)).await;

        b.try_acquire().unwrap().failure();
        assert_eq!(b.status(), BreakerStatus::Open);

        // Cooldown restarts from the failed probe
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_counts_as_failure() {
        let b = breaker(1, 5);
        fail(&b);
        tokio::time::advance(Duration::from_secs(5)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.status(), BreakerStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_call_does_not_close() {
        let b = breaker(1, 5);
        let late = b.try_acquire().unwrap();
        fail(&b);
        tokio::time::advance(Duration::from_secs(5)).await;
        let probe = b.try_acquire().unwrap();

        late.success();
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
        probe.failure();
        assert_eq!(b.status(), BreakerStatus::Open);
    }
}
