//! Observability
//!
//! Health reporting and Prometheus exposition for the engine.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  CacheEngine ──▶ MetricsSnapshot ──┐                      │
//! │      │                             ├──▶ PrometheusExporter │
//! │      └────────▶ HealthResponse ────┘        (/metrics)     │
//! │                     │                                     │
//! │                     └──▶ JSON (/healthz)                  │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod exporter;
mod health;

pub use exporter::{PrometheusExporter, DEFAULT_PREFIX};
pub use health::{HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
