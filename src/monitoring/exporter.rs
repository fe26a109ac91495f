//! Prometheus Exposition
//!
//! Renders a [`MetricsSnapshot`] and a [`HealthResponse`] as Prometheus text
//! format. A fresh registry is filled per scrape, so the exporter holds no
//! state beyond its metric prefix.
//!
//! Monotonic engine counts are exposed as counters (`*_total`); point-in-time
//! readings are gauges.

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use super::health::HealthResponse;
use crate::cache::MetricsSnapshot;
use crate::error::{Error, Result};

/// Default metric name prefix
pub const DEFAULT_PREFIX: &str = "cacheguard";

/// Prometheus text exporter
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    prefix: String,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Render metrics (and health, if given) in text exposition format
    pub fn render(&self, snapshot: &MetricsSnapshot, health: Option<&HealthResponse>) -> Result<String> {
        let registry = Registry::new_custom(Some(self.prefix.clone()), None).map_err(prom)?;

        let lookups = vec_counter(&registry, "lookups_total", "Cache lookups by outcome", &["outcome"])?;
        lookups.with_label_values(&["local_hit"]).inc_by(snapshot.local_hits);
        lookups.with_label_values(&["remote_hit"]).inc_by(snapshot.remote_hits);
        lookups.with_label_values(&["null_hit"]).inc_by(snapshot.null_hits);
        lookups.with_label_values(&["miss"]).inc_by(snapshot.misses);

        let store_failures = vec_counter(
            &registry,
            "store_failures_total",
            "Store calls that timed out or failed, by tier",
            &["tier"],
        )?;
        store_failures
            .with_label_values(&["local"])
            .inc_by(snapshot.local_store_failures);
        store_failures
            .with_label_values(&["remote"])
            .inc_by(snapshot.remote_store_failures);

        let hit_ratio = Gauge::with_opts(Opts::new("hit_ratio", "Hits over lookups")).map_err(prom)?;
        hit_ratio.set(snapshot.hit_ratio);
        registry.register(Box::new(hit_ratio)).map_err(prom)?;

        for (name, help, value) in [
            ("loads_total", "Loader invocations", snapshot.loads),
            ("load_failures_total", "Loader invocations that failed", snapshot.load_failures),
            ("coalesced_total", "Callers that joined an in-flight load", snapshot.coalesced),
            ("lock_acquired_total", "Distributed locks acquired", snapshot.lock_acquired),
            ("lock_timeouts_total", "Lock waits that fell back to a direct load", snapshot.lock_timeouts),
            ("short_circuits_total", "Calls rejected by an open breaker", snapshot.short_circuits),
            ("fail_open_total", "Store failures served as misses", snapshot.fail_open_degradations),
            ("invalidations_total", "Invalidation plans applied", snapshot.invalidations),
            ("invalidation_retries_total", "Invalidation deletes retried", snapshot.invalidation_retries),
            ("invalidation_failures_total", "Invalidation deletes dead-lettered", snapshot.invalidation_failures),
            ("local_evictions_total", "Local entries evicted for capacity", snapshot.local_evictions),
        ] {
            counter(&registry, name, help, value)?;
        }

        for (name, help, value) in [
            ("local_entries", "Entries in the local tier", snapshot.local_entries),
            ("local_weight_bytes", "Weight of the local tier", snapshot.local_weight_bytes),
            ("in_flight_loads", "Keys with a load in progress", snapshot.in_flight_loads),
            ("pending_invalidations", "Invalidations not yet applied", snapshot.pending_invalidations),
            ("dead_letters", "Invalidations awaiting replay", snapshot.dead_letters),
        ] {
            gauge(&registry, name, help, value)?;
        }

        if let Some(health) = health {
            let status = vec_gauge(&registry, "health_check", "1 when the check is healthy", &["check"])?;
            for check in &health.checks {
                status
                    .with_label_values(&[check.name.as_str()])
                    .set(i64::from(check.status.is_healthy()));
            }
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer).map_err(prom)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("non-utf8 exposition: {}", e)))
    }

    /// Content type for HTTP responses
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, value: u64) -> Result<()> {
    let counter = IntCounter::new(name, help).map_err(prom)?;
    counter.inc_by(value);
    registry.register(Box::new(counter)).map_err(prom)
}

fn vec_counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels).map_err(prom)?;
    registry.register(Box::new(vec.clone())).map_err(prom)?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str, value: u64) -> Result<()> {
    let gauge = IntGauge::new(name, help).map_err(prom)?;
    gauge.set(to_i64(value));
    registry.register(Box::new(gauge)).map_err(prom)
}

fn vec_gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels).map_err(prom)?;
    registry.register(Box::new(vec.clone())).map_err(prom)?;
    Ok(vec)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn prom(err: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", err))
}

// =============================================================================
// Tests
// =============================================================================
