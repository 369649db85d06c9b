//! Control plane errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] keel_core::Error),

    #[error(transparent)]
    Store(#[from] keel_store::Error),

    #[error(transparent)]
    Reconcile(#[from] keel_reconciler::Error),

    /// A configured cluster was given no admin client.
    #[error("no backends provided for cluster '{cluster}'")]
    MissingBackends { cluster: String },

    #[error("cluster '{cluster}' is not managed")]
    UnknownCluster { cluster: String },

    /// Stores have not caught up yet.
    #[error("control plane is not ready")]
    NotReady,

    #[error("control plane already started")]
    AlreadyStarted,

    #[error("failed to initialize tracing: {reason}")]
    Telemetry { reason: String },
}

impl Error {
    pub fn unknown_cluster(cluster: impl Into<String>) -> Self {
        Self::UnknownCluster {
            cluster: cluster.into(),
        }
    }
}
