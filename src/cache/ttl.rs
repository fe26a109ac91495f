//! TTL Policy
//!
//! Turns a per-kind base TTL into the lifetime actually written to a tier:
//!
//! - real values live `base * uniform(1 - r, 1 + r)` so entries written
//!   together do not expire together
//! - the null sentinel lives a fixed, short `null_ttl`
//! - a value copied from the remote tier into the local tier lives no longer
//!   than the remote copy, capped by `near_cache_ttl_cap`

use std::time::Duration;

use rand::Rng;

use super::entry::CachedValue;
use crate::config::TtlConfig;
use crate::policy::OperationKind;

/// TTL policy
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    config: TtlConfig,
}

impl TtlPolicy {
    /// Create a policy from configuration
    pub fn new(config: TtlConfig) -> Self {
        Self { config }
    }

    /// Configured base TTL for a kind; `None` for kinds that are never cached
    pub fn base_ttl(&self, kind: OperationKind) -> Option<Duration> {
        let base = &self.config.base;
        match kind {
            OperationKind::PointLookup => Some(base.point_lookup),
            OperationKind::ListQuery => Some(base.list_query),
            OperationKind::Aggregate => Some(base.aggregate),
            OperationKind::GroupBy => Some(base.group_by),
            OperationKind::SortLimit => Some(base.sort_limit),
            OperationKind::Paginate => Some(base.paginate),
            OperationKind::RandomSample
            | OperationKind::Create
            | OperationKind::Update
            | OperationKind::Delete
            | OperationKind::BatchCreate
            | OperationKind::BatchUpdate
            | OperationKind::BatchDelete => None,
        }
    }

    /// Jittered lifetime for a real value
    pub fn effective_ttl(&self, base: Duration) -> Duration {
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
        base.mul_f64(factor)
    }

    /// Lifetime for a loaded value; `None` when it must not be cached
    pub fn ttl_for(&self, value: &CachedValue, base: Duration) -> Option<Duration> {
        match value {
            CachedValue::Present(_) => Some(self.effective_ttl(base)),
            CachedValue::Absent if self.config.null_caching => Some(self.config.null_ttl),
            CachedValue::Absent => None,
        }
    }

    /// Lifetime of a local copy of a remote entry with `remaining` left
    pub fn near_cache_ttl(&self, remaining: Duration) -> Duration {
        match self.config.near_cache_ttl_cap {
            Some(cap) => remaining.min(cap),
            None => remaining,
        }
    }

    /// Null sentinel lifetime
    pub fn null_ttl(&self) -> Duration {
        self.config.null_ttl
    }

    /// Whether empty results are cached at all
    pub fn null_caching(&self) -> bool {
        self.config.null_caching
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(TtlConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = TtlPolicy::default();
        let base = Duration::from_secs(600);
        for _ in 0..1_000 {
            let ttl = policy.effective_ttl(base);
            assert!(ttl >= Duration::from_secs(540), "{:?}", ttl);
            assert!(ttl <= Duration::from_secs(660), "{:?}", ttl);
        }
    }

    #[test]
    fn test_jitter_actually_spreads() {
        let policy = TtlPolicy::default();
        let base = Duration::from_secs(600);
        let first = policy.effective_ttl(base);
        let spread = (0..100).any(|_| policy.effective_ttl(base) != first);
        assert!(spread);
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = TtlPolicy::new(TtlConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        });
        assert_eq!(policy.effective_ttl(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn test_null_sentinel_ttl() {
        let policy = TtlPolicy::default();
        let base = Duration::from_secs(60);
        assert_eq!(
            policy.ttl_for(&CachedValue::Absent, base),
            Some(Duration::from_secs(10))
        );

        let disabled = TtlPolicy::new(TtlConfig {
            null_caching: false,
            ..Default::default()
        });
        assert_eq!(disabled.ttl_for(&CachedValue::Absent, base), None);
        assert!(disabled
            .ttl_for(&CachedValue::Present(Bytes::from_static(b"x")), base)
            .is_some());
    }

    #[test]
    fn test_base_ttl_table() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.base_ttl(OperationKind::Aggregate), Some(Duration::from_secs(600)));
        assert_eq!(policy.base_ttl(OperationKind::PointLookup), Some(Duration::from_secs(60)));
        assert_eq!(policy.base_ttl(OperationKind::RandomSample), None);
        assert_eq!(policy.base_ttl(OperationKind::Update), None);
    }

    #[test]
    fn test_near_cache_cap() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.near_cache_ttl(Duration::from_secs(500)), Duration::from_secs(60));
        assert_eq!(policy.near_cache_ttl(Duration::from_secs(5)), Duration::from_secs(5));

        let uncapped = TtlPolicy::new(TtlConfig {
            near_cache_ttl_cap: None,
            ..Default::default()
        });
        assert_eq!(uncapped.near_cache_ttl(Duration::from_secs(500)), Duration::from_secs(500));
    }
}
