//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Broker admin call failed.
    #[error("broker operation '{operation}' failed: {reason}")]
    Broker { operation: String, reason: String },

    /// Broker admin call did not complete in time.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Connect runtime request failed.
    #[error("connect runtime '{runtime}' request failed: {reason}")]
    Connect { runtime: String, reason: String },

    /// Tag catalog request failed.
    #[error("tag catalog request failed: {reason}")]
    TagCatalog { reason: String },

    /// The cluster's provider does not offer this capability.
    #[error("'{operation}' is not supported by provider '{provider}'")]
    Unsupported { operation: String, provider: String },

    /// Offsets of a group with live members cannot be changed.
    #[error("consumer group '{group}' is {state}, it must be empty or dead")]
    GroupActive { group: String, state: String },

    /// Malformed offset reset request.
    #[error("invalid offset reset: {reason}")]
    InvalidOffsetReset { reason: String },

    /// No managed cluster with that name.
    #[error("cluster '{cluster}' is not managed")]
    UnknownCluster { cluster: String },

    /// A resource the operation refers to does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Store error.
    #[error(transparent)]
    Store(#[from] keel_store::Error),
}

impl Error {
    /// Create a broker error.
    pub fn broker(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a connect runtime error.
    pub fn connect(runtime: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            runtime: runtime.into(),
            reason: reason.into(),
        }
    }

    /// Create a tag catalog error.
    pub fn tag_catalog(reason: impl Into<String>) -> Self {
        Self::TagCatalog {
            reason: reason.into(),
        }
    }

    /// Create an unsupported capability error.
    pub fn unsupported(operation: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            provider: provider.into(),
        }
    }

    /// Create an invalid offset reset error.
    pub fn invalid_offset_reset(reason: impl Into<String>) -> Self {
        Self::InvalidOffsetReset {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::broker("create_acls", "authorization failed");
        assert!(err.to_string().contains("create_acls"));
        assert!(err.to_string().contains("authorization failed"));
    }

    #[test]
    fn test_unsupported() {
        let err = Error::unsupported("reset_password", "confluent-cloud");
        assert!(err.to_string().contains("reset_password"));
        assert!(err.to_string().contains("confluent-cloud"));
    }

    #[test]
    fn test_store_errors_convert() {
        let err: Error = keel_store::Error::transport("append", "down").into();
        assert!(matches!(err, Error::Store(_)));
        assert!(err.to_string().contains("append"));
    }
}
