//! The executor contract shared by every resource kind.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};

/// Resource kinds with a reconciliation executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Topics,
    Acls,
    Connectors,
    Users,
}

impl ResourceKind {
    pub const ALL: [Self; 4] = [Self::Topics, Self::Acls, Self::Connectors, Self::Users];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Topics => "topics",
            Self::Acls => "acls",
            Self::Connectors => "connectors",
            Self::Users => "users",
        };
        f.write_str(name)
    }
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Actual-only resources left in place by the drop policy.
    pub unsynced: usize,
    /// Individual apply operations that failed.
    pub failed: usize,
    /// Management of this kind is disabled for the cluster.
    pub skipped: bool,
}

impl ReconcileReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Nothing was changed and nothing failed.
    pub const fn converged(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0 && self.failed == 0
    }

    pub(crate) fn record(&mut self, outcome: Outcome, ok: bool) {
        if !ok {
            self.failed = self.failed.saturating_add(1);
            return;
        }
        match outcome {
            Outcome::Created => self.created = self.created.saturating_add(1),
            Outcome::Updated => self.updated = self.updated.saturating_add(1),
            Outcome::Deleted => self.deleted = self.deleted.saturating_add(1),
        }
    }

    pub(crate) fn log(&self, kind: ResourceKind, cluster: &str) {
        if self.skipped {
            return;
        }
        info!(
            kind = %kind,
            cluster,
            created = self.created,
            updated = self.updated,
            deleted = self.deleted,
            unsynced = self.unsynced,
            failed = self.failed,
            "Reconciliation tick complete"
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    Created,
    Updated,
    Deleted,
}

/// Converges one resource kind on one managed cluster.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Name of the managed cluster.
    fn cluster(&self) -> &str;

    /// Run one full collect, diff and apply cycle.
    ///
    /// Fails only when the actual state could not be collected; individual
    /// apply failures are counted in the report.
    async fn run(&self) -> Result<ReconcileReport>;
}

/// Bound an external call by `timeout`.
pub(crate) async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::timeout(operation, timeout))?
}
