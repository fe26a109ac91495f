//! Key Pattern Grammar
//!
//! Keys are `:`-separated segments. A pattern is a key in which
//!
//! - a segment consisting of exactly `*` matches any single segment, and
//! - a `*` as the final character matches any remaining suffix, including
//!   further segments (`Order:agg:*`, `Order:agg:cust*`).
//!
//! A `*` anywhere else is rejected. Both cache tiers match through this one
//! type so their invalidation semantics cannot drift apart.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Segment separator inside keys
pub const SEGMENT_SEPARATOR: char = ':';

const WILDCARD: char = '*';

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// Compiled invalidation pattern
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPattern {
    raw: String,
    segments: Vec<Segment>,
    open_tail: bool,
}

impl KeyPattern {
    /// Parse a pattern string
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        let (body, open_tail) = match raw.strip_suffix(WILDCARD) {
            Some(body) => (body, true),
            None => (raw, false),
        };

        let mut segments = Vec::new();
        for part in body.split(SEGMENT_SEPARATOR) {
            if part.len() == 1 && part.starts_with(WILDCARD) {
                segments.push(Segment::Any);
            } else if part.contains(WILDCARD) {
                return Err(Error::InvalidPattern {
                    pattern: raw.to_string(),
                    reason: "'*' must be a whole segment or the final character".to_string(),
                });
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            open_tail,
        })
    }

    /// Pattern that matches exactly one key
    pub fn exact(key: &str) -> Result<Self> {
        let pattern = Self::parse(key)?;
        if !pattern.is_exact() {
            return Err(Error::InvalidPattern {
                pattern: key.to_string(),
                reason: "exact key must not contain wildcards".to_string(),
            });
        }
        Ok(pattern)
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern contains no wildcard
    pub fn is_exact(&self) -> bool {
        !self.open_tail && self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Longest literal prefix every matching key starts with.
    ///
    /// Backends that can only list keys by prefix scan with this and filter
    /// the candidates through [`KeyPattern::matches`].
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        let last = self.segments.len() - 1;
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Any => return prefix,
                Segment::Literal(lit) => {
                    prefix.push_str(lit);
                    if i < last {
                        prefix.push(SEGMENT_SEPARATOR);
                    }
                }
            }
        }
        prefix
    }

    /// Check whether `key` matches
    pub fn matches(&self, key: &str) -> bool {
        let key_segments: Vec<&str> = key.split(SEGMENT_SEPARATOR).collect();
        let n = self.segments.len();

        if self.open_tail {
            if key_segments.len() < n {
                return false;
            }
            let (head, last) = self.segments.split_at(n - 1);
            let heads_match = head
                .iter()
                .zip(&key_segments)
                .all(|(segment, part)| segment_matches(segment, part));
            heads_match
                && match &last[0] {
                    Segment::Any => true,
                    Segment::Literal(lit) => key_segments[n - 1].starts_with(lit.as_str()),
                }
        } else {
            key_segments.len() == n
                && self
                    .segments
                    .iter()
                    .zip(&key_segments)
                    .all(|(segment, part)| segment_matches(segment, part))
        }
    }
}

fn segment_matches(segment: &Segment, part: &str) -> bool {
    match segment {
        Segment::Any => true,
        Segment::Literal(lit) => lit == part,
    }
}

impl FromStr for KeyPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Tests
// =============================================================================
