//! Cacheability & Key Derivation
//!
//! Key layout:
//!
//! ```text
//! {entity}:id:{id}                              point lookup
//! {entity}:{list|agg|group|sort|page}:{d..}:{fp} scoped queries
//! ```
//!
//! Every user-supplied segment is percent-encoded, so `:` and `*` inside an
//! identifier can neither add segments nor act as a wildcard. `fp` is
//! `none` for an unconstrained query, otherwise a 128-bit hex digest of the
//! canonical JSON of filter, sort and page.

use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::operation::{OperationContext, OperationKind};
use crate::cache::{KeyPattern, TtlPolicy, SEGMENT_SEPARATOR};
use crate::error::Result;

/// Fingerprint of a query with no filter, sort or page
pub const UNCONSTRAINED_FINGERPRINT: &str = "none";

const FINGERPRINT_BYTES: usize = 16;

/// Where and for how long a read is cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub key: String,
    pub base_ttl: Duration,
}

/// Cacheability and key policy
#[derive(Debug, Clone, Default)]
pub struct KeyPolicy {
    ttl: TtlPolicy,
    scope_metadata: Vec<String>,
}

impl KeyPolicy {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self {
            ttl,
            scope_metadata: Vec::new(),
        }
    }

    /// Fold these metadata entries (e.g. `tenant`) into query fingerprints
    pub fn with_scope_metadata<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope_metadata = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Key and base TTL for a read, or `None` if it must not be cached
    pub fn plan(&self, ctx: &OperationContext) -> Option<CachePlan> {
        let base_ttl = self.ttl.base_ttl(ctx.kind)?;
        let key = match ctx.kind {
            OperationKind::PointLookup => entity_key(&ctx.entity_type, ctx.params.id.as_ref()?),
            kind => {
                let segment = kind.key_segment()?;
                let mut key = format!("{}{}{}", escape(&ctx.entity_type), SEGMENT_SEPARATOR, segment);
                for discriminator in &ctx.params.discriminators {
                    key.push(SEGMENT_SEPARATOR);
                    key.push_str(&escape(discriminator));
                }
                key.push(SEGMENT_SEPARATOR);
                key.push_str(&self.fingerprint(ctx));
                key
            }
        };
        Some(CachePlan { key, base_ttl })
    }

    /// Stable digest of what constrains a scoped query
    pub fn fingerprint(&self, ctx: &OperationContext) -> String {
        let scope: Vec<(&str, &str)> = self
            .scope_metadata
            .iter()
            .filter_map(|name| ctx.metadata.get(name).map(|v| (name.as_str(), v.as_str())))
            .collect();

        if ctx.params.is_unconstrained() && scope.is_empty() {
            return UNCONSTRAINED_FINGERPRINT.to_string();
        }

        let mut canonical = String::new();
        for (label, part) in [
            ("filter", &ctx.params.filter),
            ("sort", &ctx.params.sort),
            ("page", &ctx.params.page),
        ] {
            canonical.push_str(label);
            canonical.push('=');
            match part {
                Some(value) => write_canonical(value, &mut canonical),
                None => canonical.push_str("null"),
            }
            canonical.push(';');
        }
        for (name, value) in scope {
            canonical.push_str(name);
            canonical.push('=');
            write_canonical(&Value::String(value.to_string()), &mut canonical);
            canonical.push(';');
        }

        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }
}

/// Direct key of one entity record
pub fn entity_key(entity_type: &str, id: &Value) -> String {
    format!(
        "{}{sep}id{sep}{}",
        escape(entity_type),
        escape(&id_segment(id)),
        sep = SEGMENT_SEPARATOR
    )
}

/// Patterns covering every scoped query key of an entity type
pub fn scoped_patterns(entity_type: &str) -> Result<Vec<KeyPattern>> {
    let entity = escape(entity_type);
    OperationKind::SCOPED_QUERIES
        .iter()
        .filter_map(|kind| kind.key_segment())
        .map(|segment| KeyPattern::parse(&format!("{}{sep}{}{sep}*", entity, segment, sep = SEGMENT_SEPARATOR)))
        .collect()
}

/// Pattern covering every key of an entity type
pub fn entity_pattern(entity_type: &str) -> Result<KeyPattern> {
    KeyPattern::parse(&format!("{}{}*", escape(entity_type), SEGMENT_SEPARATOR))
}

/// Percent-encode one key segment
pub fn escape(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Text form of an identifier value (strings unquoted)
pub fn id_segment(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

/// JSON with object keys sorted at every depth
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
