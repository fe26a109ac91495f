//! Health Checks
//!
//! The engine is only as healthy as its weakest guarantee: an open breaker
//! or an invalidation that has not landed yet both mean cached reads may be
//! stale or slow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::CacheTier;
use crate::config::FailureMode;
use crate::resilience::BreakerStatus;

/// Engine health, ordered from best to worst so the overall status of a
/// response is the `max` of its checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every tier answers and every invalidation has landed
    Healthy,
    /// Reads are served, but may skip a tier or see a pending invalidation
    Degraded,
    /// Reads fail (fail-closed with a tier down) or the engine is shut down
    Unhealthy,
}

impl HealthStatus {
    /// True while `get_or_load` still returns values; `/healthz` answers 200
    pub fn serves_reads(self) -> bool {
        self != HealthStatus::Unhealthy
    }

    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// One named check of a [`HealthResponse`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// `readiness`, `{tier}_breaker` or `invalidation`
    pub name: String,
    pub status: HealthStatus,
    /// Why the check is not healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckResult {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Breaker of one tier. Any non-closed breaker degrades the engine; an
    /// open one under fail-closed makes it unhealthy since reads then fail.
    pub fn breaker(tier: CacheTier, status: BreakerStatus, mode: FailureMode) -> Self {
        let name = format!("{}_breaker", tier);
        match (status, mode) {
            (BreakerStatus::Closed, _) => Self::healthy(name),
            (BreakerStatus::Open, FailureMode::FailClosed) => {
                Self::unhealthy(name, format!("{} tier unavailable ({})", tier, mode))
            }
            (status, _) => Self::degraded(name, format!("breaker {}", status)),
        }
    }

    /// Invalidation backlog
    pub fn invalidation(pending: usize, dead_letters: usize) -> Self {
        match (pending, dead_letters) {
            (0, 0) => Self::healthy("invalidation"),
            (pending, 0) => Self::degraded("invalidation", format!("{} pending", pending)),
            (pending, failed) => Self::degraded(
                "invalidation",
                format!("{} pending, {} awaiting replay", pending, failed),
            ),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst of `checks`
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    /// Crate version of the running engine
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Engine lifetime state behind the `readiness` check
pub struct HealthCheck {
    started: Instant,
    /// Cleared on shutdown
    ready: AtomicBool,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            ready: AtomicBool::new(true),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "engine shut down")
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Degraded.serves_reads());
        assert!(!HealthStatus::Unhealthy.serves_reads());
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
    }

    #[test]
    fn test_breaker_check() {
        let open = BreakerStatus::Open;
        assert_eq!(
            HealthCheckResult::breaker(CacheTier::Remote, BreakerStatus::Closed, FailureMode::FailClosed).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthCheckResult::breaker(CacheTier::Remote, open, FailureMode::FailOpen).status,
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthCheckResult::breaker(CacheTier::Remote, open, FailureMode::FailClosed).status,
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthCheckResult::breaker(CacheTier::Local, BreakerStatus::HalfOpen, FailureMode::FailClosed).status,
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthCheckResult::breaker(CacheTier::Local, open, FailureMode::FailOpen).name,
            "local_breaker"
        );
    }

    #[test]
    fn test_invalidation_check() {
        assert_eq!(HealthCheckResult::invalidation(0, 0).status, HealthStatus::Healthy);
        assert_eq!(HealthCheckResult::invalidation(2, 0).status, HealthStatus::Degraded);
        let failed = HealthCheckResult::invalidation(0, 3);
        assert_eq!(failed.status, HealthStatus::Degraded);
        assert_eq!(failed.message.as_deref(), Some("0 pending, 3 awaiting replay"));
    }

    #[test]
    fn test_health_response_takes_worst() {
        let checks = vec![
            HealthCheckResult::healthy("check1"),
            HealthCheckResult::degraded("check2", "slow"),
        ];
        let response = HealthResponse::new(checks, Duration::from_secs(60));
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.uptime_seconds, 60);

        let empty = HealthResponse::new(Vec::new(), Duration::ZERO);
        assert_eq!(empty.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_readiness() {
        let health = HealthCheck::new();
        assert_eq!(health.readiness_check().status, HealthStatus::Healthy);
        health.set_ready(false);
        assert_eq!(health.readiness_check().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serialization() {
        let result = HealthCheckResult::healthy("remote_breaker");
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"name":"remote_breaker","status":"healthy"}"#);

        let degraded = HealthCheckResult::degraded("invalidation", "2 pending");
        let json = serde_json::to_string(&degraded).unwrap();
        assert!(json.contains(r#""status":"degraded""#));

        let deserialized: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.status, HealthStatus::Degraded);
        assert_eq!(deserialized.message.as_deref(), Some("2 pending"));
    }
}
