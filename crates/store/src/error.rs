//! Error types for the store crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The broker did not acknowledge the append in time. Durability unknown.
    #[error("write to '{topic}' not acknowledged within {timeout:?}")]
    WriteTimeout { topic: String, timeout: Duration },

    /// The write is durable but the local replica did not observe it in time.
    #[error("replica of '{topic}' did not reach offset {target} within {timeout:?} (observed {observed})")]
    SyncTimeout {
        topic: String,
        target: i64,
        observed: i64,
        timeout: Duration,
    },

    /// Log transport failure.
    #[error("log transport operation '{operation}' failed: {reason}")]
    Transport { operation: String, reason: String },

    /// Record could not be encoded or decoded.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The backing topic exists but violates the store's requirements.
    #[error("invalid store topic '{topic}': {reason}")]
    InvalidLogTopic { topic: String, reason: String },

    /// Attempt to write under the reserved probe key.
    #[error("key '{key}' is reserved")]
    ReservedKey { key: String },

    /// A one-shot readiness transition was attempted twice.
    #[error("'{component}' was already marked ready")]
    AlreadyReady { component: String },

    /// Operation requires a started store.
    #[error("store '{topic}' has not been started")]
    NotStarted { topic: String },
}

impl Error {
    /// Create a transport error.
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create an invalid log topic error.
    pub fn invalid_log_topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLogTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create an already-ready invariant violation.
    pub fn already_ready(component: impl Into<String>) -> Self {
        Self::AlreadyReady {
            component: component.into(),
        }
    }

    /// Whether the outcome of the write that produced this error is unknown.
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Self::WriteTimeout { .. } | Self::SyncTimeout { .. })
    }

    /// Whether this is a configuration problem that retrying cannot fix.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidLogTopic { .. } | Self::AlreadyReady { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
