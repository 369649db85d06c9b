//! Level-triggered reconciliation for keel.
//!
//! Every tick an executor:
//! 1. Reads desired state from the log-backed stores
//! 2. Collects actual state from the broker or connect runtime
//! 3. Diffs the two per resource kind
//! 4. Applies creates and updates, then deletes when the drop policy allows
//!
//! A failed collection skips the tick; a failed apply is counted and the
//! rest of the tick continues. The next tick retries whatever is still off.
//!
//! # Executors
//!
//! - [`TopicExecutor`]: topics, dynamic configs and cloud tags
//! - [`AclExecutor`]: broker bindings expanded from access grants
//! - [`ConnectorExecutor`]: connectors on connect runtimes
//! - [`UserExecutor`]: byte-rate quotas and password resets
//!
//! [`Scheduler`] runs them periodically once the stores are ready.
//! [`ConsumerGroupService`] resets consumer group offsets on demand.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod acl;
pub mod broker;
pub mod connect;
pub mod connector;
pub mod consumer_group;
pub mod diff;
pub mod error;
pub mod executor;
pub mod memory;
pub mod scheduler;
pub mod tags;
pub mod topic;
pub mod user;

#[cfg(test)]
mod testing;

pub use acl::{AclExecutor, expand_entry, expand_stream};
pub use broker::{
    AclBinding, AclOperation, AclPermissionType, AlterConfigOp, BindingResourceType, ConfigEntry,
    ConfigSource, ConsumerGroupState, KafkaAdmin, NewTopicRequest, OffsetSpec, ScramCredential,
    ScramMechanism, TopicDescription, TopicPartition, UserQuotas,
};
pub use connect::{
    ConnectMutation, ConnectRuntime, ConnectorInfo, ConnectorState, HttpConnectRuntime,
    InMemoryConnectRuntime,
};
pub use connector::{ConnectListingCache, ConnectorExecutor};
pub use consumer_group::{ConsumerGroupService, ResetMethod, ResetRequest, TopicSelector};
pub use diff::{Diff, Update};
pub use error::{Error, Result};
pub use executor::{Executor, ReconcileReport, ResourceKind};
pub use memory::{BrokerMutation, InMemoryBroker};
pub use scheduler::{ExecutorsByKind, Scheduler, SchedulerHandle, run_tick};
pub use tags::{InMemoryTagCatalog, TagCatalog, TagChange};
pub use topic::{TopicExecutor, config_delta};
pub use user::{
    Capability, ScramUserSynchronizer, UnsupportedUserSynchronizer, UserExecutor,
    UserSynchronizer, synchronizer_for,
};
