//! Core types for keel.
//!
//! - **Model**: declarative resource descriptors and their store keys
//! - **Config**: control plane, store, scheduler and managed-cluster settings
//! - **Error**: configuration errors shared by the other crates

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod model;

pub use config::{
    ClusterProvider, ConnectRuntimeConfig, ControlPlaneConfig, ManagedClusterConfig,
    SchedulerConfig, StoreConfig,
};
pub use error::{Error, Result};
pub use model::{
    AccessControlEntry, AccessControlEntrySpec, AclResourceType, Connector, ConnectorSpec,
    KafkaStream, Namespace, NamespaceSpec, ObjectMeta, PatternType, Permission, Resource,
    ResourceQuota, Topic, TopicPhase, TopicSpec, TopicStatus, CONSUMER_BYTE_RATE,
    DEFAULT_BYTE_RATE, NOOP_KEY, PRODUCER_BYTE_RATE,
};
