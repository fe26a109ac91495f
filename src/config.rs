//! Engine configuration
//!
//! Every knob has a default matching the documented behaviour; a YAML file
//! only needs to name the values it overrides. Durations are expressed in
//! milliseconds (`*_ms` keys).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of local shards
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TTL policy
    pub ttl: TtlConfig,
    /// In-process tier
    pub local: LocalStoreConfig,
    /// Shared remote tier (only used when a backend is supplied)
    pub remote: RemoteStoreConfig,
    /// Circuit breaker settings, applied per tier
    pub breaker: BreakerConfig,
    /// What a cache-tier failure turns into
    pub failure_mode: FailureMode,
    /// Stampede coordination
    pub stampede: StampedeConfig,
    /// Invalidation retries
    pub invalidation: InvalidationConfig,
}

/// Behaviour on cache-tier failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Treat failures as a miss (availability first)
    #[default]
    FailOpen,
    /// Propagate failures to the caller
    FailClosed,
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMode::FailOpen => write!(f, "fail-open"),
            FailureMode::FailClosed => write!(f, "fail-closed"),
        }
    }
}

/// Base TTL per cacheable operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseTtlTable {
    #[serde(rename = "point_lookup_ms", with = "millis")]
    pub point_lookup: Duration,
    #[serde(rename = "list_query_ms", with = "millis")]
    pub list_query: Duration,
    #[serde(rename = "aggregate_ms", with = "millis")]
    pub aggregate: Duration,
    #[serde(rename = "group_by_ms", with = "millis")]
    pub group_by: Duration,
    #[serde(rename = "sort_limit_ms", with = "millis")]
    pub sort_limit: Duration,
    #[serde(rename = "paginate_ms", with = "millis")]
    pub paginate: Duration,
}

impl Default for BaseTtlTable {
    fn default() -> Self {
        Self {
            point_lookup: Duration::from_secs(60),
            list_query: Duration::from_secs(60),
            // Expensive to recompute, changes less often
            aggregate: Duration::from_secs(600),
            group_by: Duration::from_secs(600),
            sort_limit: Duration::from_secs(120),
            paginate: Duration::from_secs(60),
        }
    }
}

/// TTL policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Base TTL table
    pub base: BaseTtlTable,
    /// Jitter ratio r: effective = base * U(1 - r, 1 + r). 0 disables jitter.
    pub jitter_ratio: f64,
    /// Cache empty loads as a sentinel
    pub null_caching: bool,
    /// TTL of the null sentinel
    #[serde(rename = "null_ttl_ms", with = "millis")]
    pub null_ttl: Duration,
    /// Upper bound for local copies of remote entries
    #[serde(rename = "near_cache_ttl_cap_ms", with = "opt_millis")]
    pub near_cache_ttl_cap: Option<Duration>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            base: BaseTtlTable::default(),
            jitter_ratio: 0.1,
            null_caching: true,
            null_ttl: Duration::from_secs(10),
            near_cache_ttl_cap: Some(Duration::from_secs(60)),
        }
    }
}

/// Local (in-process) tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total weight in bytes
    pub max_weight: u64,
    /// Shard count (power of two)
    pub shard_count: usize,
    /// Per-call time bound
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Background expiry sweep interval, `None` disables the sweeper
    #[serde(rename = "sweep_interval_ms", with = "opt_millis")]
    pub sweep_interval: Option<Duration>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_weight: 256 * 1024 * 1024, // 256MB
            shard_count: DEFAULT_SHARD_COUNT,
            call_timeout: Duration::from_millis(10),
            sweep_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Remote tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Per-call time bound
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(100),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe is allowed
    #[serde(rename = "cooldown_ms", with = "millis")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Stampede coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StampedeConfig {
    /// Use a set-if-absent lease on the remote tier across processes
    pub distributed_lock: bool,
    /// Lease TTL of the lock key
    #[serde(rename = "lock_lease_ms", with = "millis")]
    pub lock_lease: Duration,
    /// Interval at which non-holders poll for the value
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Total wait before a non-holder loads directly
    #[serde(rename = "poll_wait_ms", with = "millis")]
    pub poll_wait: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            distributed_lock: true,
            lock_lease: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            poll_wait: Duration::from_secs(1),
        }
    }
}

/// Invalidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Attempts per target before it is dead-lettered
    pub max_attempts: u32,
    /// Initial retry backoff, doubled per attempt
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    /// Payload field carrying the record identifier
    pub id_field: String,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            id_field: "id".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.ttl.jitter_ratio) {
            return Err(Error::Config(format!(
                "ttl.jitter_ratio must be in [0, 1), got {}",
                self.ttl.jitter_ratio
            )));
        }
        if self.ttl.null_caching && self.ttl.null_ttl.is_zero() {
            return Err(Error::Config(
                "ttl.null_ttl_ms must be greater than 0 when null caching is enabled".to_string(),
            ));
        }
        if self.local.max_entries == 0 || self.local.max_weight == 0 {
            return Err(Error::Config(
                "local.max_entries and local.max_weight must be greater than 0".to_string(),
            ));
        }
        if !self.local.shard_count.is_power_of_two() {
            return Err(Error::Config(format!(
                "local.shard_count must be a power of two, got {}",
                self.local.shard_count
            )));
        }
        if self.local.call_timeout.is_zero() || self.remote.call_timeout.is_zero() {
            return Err(Error::Config("store call timeouts must be greater than 0".to_string()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.stampede.poll_interval.is_zero() {
            return Err(Error::Config(
                "stampede.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.stampede.lock_lease.is_zero() {
            return Err(Error::Config(
                "stampede.lock_lease_ms must be greater than 0".to_string(),
            ));
        }
        if self.invalidation.max_attempts == 0 {
            return Err(Error::Config(
                "invalidation.max_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helpers: `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helpers: `Option<Duration>` as integer milliseconds or null
pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// =============================================================================
// Tests
// =============================================================================
