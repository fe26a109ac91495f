//! Cache Entry Types
//!
//! A stored value is either real bytes or the null sentinel that records a
//! known-absent key. Entries carry their own expiry and weight.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Fixed bookkeeping cost charged to every entry on top of key and payload
pub const ENTRY_OVERHEAD: u64 = 64;

const TAG_ABSENT: u8 = 0x00;
const TAG_PRESENT: u8 = 0x01;

/// Value held by the cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedValue {
    /// Loaded bytes
    Present(Bytes),
    /// Null sentinel: the authoritative store has no value for the key
    Absent,
}

impl CachedValue {
    /// Build from a loader result
    pub fn from_load(loaded: Option<Bytes>) -> Self {
        match loaded {
            Some(data) => CachedValue::Present(data),
            None => CachedValue::Absent,
        }
    }

    /// Convert to what a caller sees
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            CachedValue::Present(data) => Some(data),
            CachedValue::Absent => None,
        }
    }

    /// True for the null sentinel
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, CachedValue::Absent)
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            CachedValue::Present(data) => data.len(),
            CachedValue::Absent => 0,
        }
    }

    /// True if there is no payload
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode for a byte-oriented backend: one tag byte, then the payload
    pub fn encode(&self) -> Bytes {
        match self {
            CachedValue::Absent => Bytes::from_static(&[TAG_ABSENT]),
            CachedValue::Present(data) => {
                let mut buf = BytesMut::with_capacity(data.len() + 1);
                buf.put_u8(TAG_PRESENT);
                buf.extend_from_slice(data);
                buf.freeze()
            }
        }
    }

    /// Decode bytes produced by [`CachedValue::encode`]
    pub fn decode(raw: Bytes) -> Result<Self> {
        match raw.first() {
            Some(&TAG_ABSENT) if raw.len() == 1 => Ok(CachedValue::Absent),
            Some(&TAG_PRESENT) => Ok(CachedValue::Present(raw.slice(1..))),
            Some(tag) => Err(Error::Codec(format!(
                "unknown value tag {:#04x} ({} bytes)",
                tag,
                raw.len()
            ))),
            None => Err(Error::Codec("empty value".to_string())),
        }
    }
}

/// Cache entry containing a value and its lifetime metadata
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Stored value
    pub value: CachedValue,
    /// Entry is a miss from this instant on
    pub expires_at: Instant,
    /// When the entry was written
    pub inserted_at: Instant,
    /// Weight charged against the store capacity
    pub weight: u64,
}

impl CacheEntry {
    /// Create an entry for `key` that lives for `ttl`
    pub fn new(key: &str, value: CachedValue, ttl: Duration) -> Self {
        let now = Instant::now();
        let weight = key.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD;
        Self {
            value,
            expires_at: now + ttl,
            inserted_at: now,
            weight,
        }
    }

    /// Check expiry against a given instant
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Check if expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Age of the entry
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }
}

/// Fast non-cryptographic hash (FxHash algorithm), used for shard routing
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================
