//! Failure Containment
//!
//! Timeouts, per-tier circuit breakers and the fail-open / fail-closed
//! decision, applied once at the store boundary.

mod breaker;
mod guard;

pub use breaker::{Admission, BreakerPermit, BreakerStatus, CircuitBreaker, CircuitBreakerState};
pub use guard::{GuardedStore, StoreGuard};
