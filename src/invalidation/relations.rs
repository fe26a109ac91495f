//! Cross-Entity Relations
//!
//! Mutating one entity type can stale cached reads of another (an
//! `OrderItem` change moves `Order` totals). A [`RelationConfig`] lists, per
//! source entity type, which related key patterns to drop.
//!
//! Templates are key patterns with `{field}` placeholders filled from each
//! payload record; dotted names (`{customer.id}`) reach into nested objects.
//! Filled values are escaped like any other key segment. When a placeholder
//! cannot be filled the rule widens to every key of the related entity.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::cache::KeyPattern;
use crate::error::{Error, Result};
use crate::policy::{entity_pattern, escape, id_segment};

/// One related pattern to invalidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRule {
    pub related_entity: String,
    pub key_pattern_template: String,
}

/// Relation rules keyed by source entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationConfig {
    rules: HashMap<String, Vec<RelationRule>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart<'a> {
    Text(&'a str),
    Field(&'a str),
}

impl RelationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule: mutations of `source` drop `template` of `related`
    pub fn relate(
        mut self,
        source: impl Into<String>,
        related: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.rules.entry(source.into()).or_default().push(RelationRule {
            related_entity: related.into(),
            key_pattern_template: template.into(),
        });
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject templates that can never form a valid pattern
    pub fn validate(&self) -> Result<()> {
        for rule in self.rules.values().flatten() {
            let parts = parse_template(&rule.key_pattern_template)?;
            let probe: String = parts
                .iter()
                .map(|part| match part {
                    TemplatePart::Text(text) => *text,
                    TemplatePart::Field(_) => "x",
                })
                .collect();
            KeyPattern::parse(&probe)?;
        }
        Ok(())
    }

    pub fn rules_for(&self, source: &str) -> &[RelationRule] {
        self.rules.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Patterns to drop for a mutation of `source` carrying `records`
    pub fn resolve(&self, source: &str, records: &[&Value]) -> Result<Vec<KeyPattern>> {
        let mut resolved = BTreeSet::new();
        for rule in self.rules_for(source) {
            let parts = parse_template(&rule.key_pattern_template)?;
            let has_fields = parts.iter().any(|p| matches!(p, TemplatePart::Field(_)));

            if !has_fields {
                resolved.insert(rule.key_pattern_template.clone());
                continue;
            }

            let mut widened = records.is_empty();
            for record in records {
                match fill(&parts, record) {
                    Some(raw) => {
                        resolved.insert(raw);
                    }
                    None => widened = true,
                }
            }
            if widened {
                warn!(
                    entity_type = source,
                    related = %rule.related_entity,
                    template = %rule.key_pattern_template,
                    "relation placeholder missing from payload, widening to related entity"
                );
                resolved.insert(entity_pattern(&rule.related_entity)?.as_str().to_string());
            }
        }

        resolved.iter().map(|raw| KeyPattern::parse(raw)).collect()
    }
}

fn parse_template(template: &str) -> Result<Vec<TemplatePart<'_>>> {
    let invalid = |reason: &str| Error::InvalidPattern {
        pattern: template.to_string(),
        reason: reason.to_string(),
    };

    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(TemplatePart::Text(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
        let field = &after[..close];
        if field.is_empty() || field.contains('{') {
            return Err(invalid("empty or nested placeholder"));
        }
        parts.push(TemplatePart::Field(field));
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(invalid("unmatched '}'"));
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest));
    }
    Ok(parts)
}

fn fill(parts: &[TemplatePart<'_>], record: &Value) -> Option<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            TemplatePart::Text(text) => out.push_str(text),
            TemplatePart::Field(field) => {
                let value = lookup(record, field)?;
                out.push_str(&escape(&id_segment(value)));
            }
        }
    }
    Some(out)
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |node, name| node.get(name))
        .filter(|value| !value.is_null())
}

// =============================================================================
// Tests
// =============================================================================
