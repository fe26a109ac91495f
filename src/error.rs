//! Error types for the cache reliability engine

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheTier;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
///
/// `Error` is `Clone` so one loader outcome can be handed to every waiter of
/// a coalesced load.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Store call exceeded its time bound
    #[error("{tier} store call '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        tier: CacheTier,
        operation: &'static str,
        timeout: Duration,
    },

    /// Circuit breaker is open, call short-circuited without I/O
    #[error("{tier} store unavailable: circuit breaker open")]
    StoreUnavailable { tier: CacheTier },

    /// Transport or availability failure reported by a backend
    #[error("{tier} store transport error: {reason}")]
    StoreTransport { tier: CacheTier, reason: String },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// Distributed lock not obtained within the poll-wait bound
    #[error("distributed lock for '{key}' not obtained within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// The wrapped operation failed
    #[error("loader failed: {0}")]
    Loader(Arc<anyhow::Error>),

    // =========================================================================
    // Input / Configuration Errors
    // =========================================================================
    /// Invalid invalidation pattern
    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Stored bytes could not be decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (config files, listeners)
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a loader failure
    pub fn loader(err: anyhow::Error) -> Self {
        Error::Loader(Arc::new(err))
    }

    /// True for failures of the cache tier itself (timeout, open breaker,
    /// transport). Only these are subject to fail-open conversion.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreTimeout { .. } | Error::StoreUnavailable { .. } | Error::StoreTransport { .. }
        )
    }

    /// True if the failure should be counted against a circuit breaker
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Error::StoreTimeout { .. } | Error::StoreTransport { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        let timeout = Error::StoreTimeout {
            tier: CacheTier::Remote,
            operation: "get",
            timeout: Duration::from_millis(100),
        };
        let open = Error::StoreUnavailable {
            tier: CacheTier::Remote,
        };
        let loader = Error::loader(anyhow::anyhow!("db down"));

        assert!(timeout.is_store_failure());
        assert!(timeout.counts_against_breaker());
        assert!(open.is_store_failure());
        assert!(!open.counts_against_breaker());
        assert!(!loader.is_store_failure());
    }

    #[test]
    fn test_loader_error_display_is_preserved() {
        let err = Error::loader(anyhow::anyhow!("connection refused"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), "loader failed: connection refused");
        assert_eq!(cloned.to_string(), err.to_string());
    }
}
