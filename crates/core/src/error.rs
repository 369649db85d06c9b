//! Core error types for keel configuration handling.
//!
//! All errors are explicit and typed; configuration problems are surfaced to
//! the caller at load time rather than discovered later by the executors.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file '{path}': {reason}")]
    ConfigRead { path: PathBuf, reason: String },

    #[error("failed to parse config: {reason}")]
    ConfigParse { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a config read error.
    pub fn config_read(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigRead {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config parse error.
    pub fn config_parse(reason: impl Into<String>) -> Self {
        Self::ConfigParse {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
