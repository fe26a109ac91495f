//! Cacheability & Key Policy
//!
//! Decides from an [`OperationContext`] alone whether a read is cached, under
//! which key, and in which TTL bucket.

mod key;
mod operation;
mod proptest;

pub use key::{
    entity_key, entity_pattern, escape, id_segment, scoped_patterns, CachePlan, KeyPolicy,
    UNCONSTRAINED_FINGERPRINT,
};
pub use operation::{OperationContext, OperationKind, QueryParams};
