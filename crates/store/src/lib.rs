//! Log-backed stores for keel.
//!
//! Each resource kind lives in its own compacted, single-partition topic.
//! A [`LogBackedStore`] replays that topic into an in-process replica and
//! offers read-your-writes: `create`/`delete` return once the local replica
//! reflects the write. A [`ReadinessGate`] holds back traffic until every
//! store has caught up to the tail observed at startup.
//!
//! # Backends
//!
//! - [`InMemoryLog`]: in-process log with fault injection, used by tests
//! - `KafkaLog` (feature `kafka`): librdkafka-backed transport and admin

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod catalog;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod memory;
pub mod readiness;
pub mod replica;
pub mod store;

pub use catalog::ResourceStores;
pub use error::{Error, Result};
#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
pub use log::{
    CleanupPolicy, LogAdmin, LogReader, LogRecord, LogTopicDescription, LogTopicSpec,
    LogTransport,
};
pub use memory::InMemoryLog;
pub use readiness::{Progress, ReadinessGate, ReadinessProbe};
pub use replica::{Replica, UNKNOWN_OFFSET};
pub use store::{LogBackedStore, Readiness};
