//! Property-Based Tests for Key Derivation
//!
//! # Test Properties
//!
//! 1. **Fingerprint Determinism**: field order never changes a fingerprint
//! 2. **Structure Preservation**: escaped identifiers never add segments or
//!    wildcards
//! 3. **Prefix Soundness**: every key a pattern matches starts with the
//!    pattern's literal prefix

#![cfg(test)]

use proptest::prelude::*;
use serde_json::{Map, Value};

use super::key::{entity_key, entity_pattern, scoped_patterns, KeyPolicy};
use super::operation::OperationContext;
use crate::cache::{KeyPattern, SEGMENT_SEPARATOR};

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for filter objects: distinct field names with small values
fn filter_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::btree_map("[a-z_]{1,8}", any::<i64>(), 1..8)
        .prop_map(|m| m.into_iter().collect())
}

/// Strategy for hostile identifiers, including separators and wildcards
fn id_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:*%_ -]{1,24}"
}

fn object(fields: impl Iterator<Item = (String, i64)>) -> Value {
    let mut map = Map::new();
    for (name, value) in fields {
        map.insert(name, Value::from(value));
    }
    Value::Object(map)
}

// =============================================================================
// Fingerprint Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the same filter built in any field order fingerprints the same
    #[test]
    fn prop_fingerprint_order_independent(fields in filter_strategy()) {
        let forward = object(fields.clone().into_iter());
        let backward = object(fields.into_iter().rev());

        let policy = KeyPolicy::default();
        let a = OperationContext::list("Order").with_filter(forward);
        let b = OperationContext::list("Order").with_filter(backward);
        prop_assert_eq!(policy.fingerprint(&a), policy.fingerprint(&b));
    }

    /// Property: different filters fingerprint differently
    #[test]
    fn prop_fingerprint_distinguishes(fields in filter_strategy(), bump in 1i64..1000) {
        let policy = KeyPolicy::default();
        let mut changed = fields.clone();
        changed[0].1 = changed[0].1.wrapping_add(bump);

        let a = OperationContext::list("Order").with_filter(object(fields.into_iter()));
        let b = OperationContext::list("Order").with_filter(object(changed.into_iter()));
        prop_assert_ne!(policy.fingerprint(&a), policy.fingerprint(&b));
    }
}

// =============================================================================
// Key / Pattern Agreement
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: an escaped id yields exactly three segments and no wildcard
    #[test]
    fn prop_escaped_key_keeps_structure(id in id_strategy()) {
        let key = entity_key("Order", &Value::String(id));
        prop_assert_eq!(key.split(SEGMENT_SEPARATOR).count(), 3);
        prop_assert!(!key.contains('*'));

        let exact = KeyPattern::exact(&key)?;
        prop_assert!(exact.matches(&key));
        prop_assert!(entity_pattern("Order")?.matches(&key));
        prop_assert!(!scoped_patterns("Order")?.iter().any(|p| p.matches(&key)));
    }

    /// Property: distinct ids never collide
    #[test]
    fn prop_distinct_ids_distinct_keys(a in id_strategy(), b in id_strategy()) {
        prop_assume!(a != b);
        let ka = entity_key("Order", &Value::String(a));
        let kb = entity_key("Order", &Value::String(b));
        prop_assert_ne!(&ka, &kb);
        prop_assert!(!KeyPattern::exact(&ka)?.matches(&kb));
    }

    /// Property: every matched key starts with the pattern's literal prefix
    #[test]
    fn prop_literal_prefix_is_sound(
        segments in prop::collection::vec("[a-z]{1,4}", 1..5),
        tail in "[a-z]{0,4}",
        wild in any::<prop::sample::Index>(),
    ) {
        let mut parts: Vec<String> = segments.clone();
        let wild_at = wild.index(parts.len());
        let key = {
            let mut k = parts.join(":");
            k.push(SEGMENT_SEPARATOR);
            k.push_str(&tail);
            k
        };
        parts[wild_at] = "*".to_string();
        let raw = format!("{}:*", parts.join(":"));

        let pattern = KeyPattern::parse(&raw)?;
        prop_assert!(pattern.matches(&key), "{} !~ {}", raw, key);
        prop_assert!(key.starts_with(&pattern.literal_prefix()));
    }
}
