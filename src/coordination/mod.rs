//! Stampede Coordination
//!
//! [`SingleFlight`] collapses concurrent misses inside one process;
//! [`DistributedLock`] extends that across processes sharing a remote tier.

mod lock;
mod singleflight;

pub use lock::{DistributedLock, LeaseGuard, LOCK_PREFIX};
pub use singleflight::SingleFlight;
