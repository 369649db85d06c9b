//! Prelude module - common imports for embedding keel
//!
//! ```rust
//! use keel::prelude::*;
//! ```

pub use itertools::Itertools;

pub use crate::error::{Error, Result};
pub use crate::plane::{ClusterBackends, ControlPlane};

pub use keel_core::{
    AccessControlEntry, AccessControlEntrySpec, AclResourceType, ClusterProvider, Connector,
    ControlPlaneConfig, KafkaStream, ManagedClusterConfig, Namespace, PatternType, Permission,
    Resource, ResourceQuota, Topic,
};
pub use keel_reconciler::{
    ConnectRuntime, InMemoryBroker, InMemoryConnectRuntime, KafkaAdmin, ReconcileReport,
    ResetMethod, ResetRequest, ResourceKind, TagCatalog, TopicSelector,
};
pub use keel_store::{InMemoryLog, LogAdmin, LogTransport, ResourceStores};
