//! Mutation-Driven Invalidation
//!
//! TTL bounds staleness; invalidation removes it early. Every successful
//! mutation drops the mutated records, every scoped query of the entity
//! type, and whatever the [`RelationConfig`] says depends on it.

mod manager;
mod relations;

pub use manager::{
    FailedInvalidation, InvalidationManager, InvalidationPlan, InvalidationReport,
    InvalidationTarget,
};
pub use relations::{RelationConfig, RelationRule};
