//! Log transport abstraction.
//!
//! A store owns exactly one single-partition, compacted topic. The transport
//! appends keyed records to it and replays it from the earliest offset; the
//! admin side provisions and validates the topic at bootstrap.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// One record of a store topic. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: i64,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Appends to and replays store topics.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Append a record and return the offset assigned by the broker.
    async fn append(&self, topic: &str, key: &str, value: Option<Vec<u8>>) -> Result<i64>;

    /// Open a reader positioned at the earliest offset of `topic`.
    async fn open_reader(&self, topic: &str) -> Result<Box<dyn LogReader>>;
}

/// Sequential reader over a store topic.
#[async_trait]
pub trait LogReader: Send {
    /// Wait for and return the next records, in offset order.
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>>;
}

/// Retention mode of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupPolicy {
    Compact,
    Delete,
    CompactDelete,
    Other(String),
}

impl CleanupPolicy {
    /// Parse a `cleanup.policy` config value.
    pub fn parse(value: &str) -> Self {
        let mut parts: Vec<&str> = value.split(',').map(str::trim).collect();
        parts.sort_unstable();
        match parts.as_slice() {
            ["compact"] => Self::Compact,
            ["delete"] => Self::Delete,
            ["compact", "delete"] => Self::CompactDelete,
            _ => Self::Other(value.to_string()),
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compact => write!(f, "compact"),
            Self::Delete => write!(f, "delete"),
            Self::CompactDelete => write!(f, "compact,delete"),
            Self::Other(value) => write!(f, "{value}"),
        }
    }
}

/// What bootstrap needs to know about an existing store topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTopicDescription {
    pub partitions: i32,
    pub cleanup_policy: CleanupPolicy,
}

/// Creation request for a store topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub configs: BTreeMap<String, String>,
}

impl LogTopicSpec {
    /// Single-partition topic retained by compaction only.
    pub fn compacted(name: impl Into<String>, replication_factor: i16) -> Self {
        let configs = [
            ("cleanup.policy", "compact"),
            ("min.compaction.lag.ms", "0"),
            ("retention.ms", "-1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            name: name.into(),
            partitions: 1,
            replication_factor,
            configs,
        }
    }
}

/// Provisions and validates store topics.
#[async_trait]
pub trait LogAdmin: Send + Sync {
    /// Describe a topic, or `None` if it does not exist.
    async fn describe_log_topic(&self, topic: &str) -> Result<Option<LogTopicDescription>>;

    /// Create a topic.
    async fn create_log_topic(&self, spec: &LogTopicSpec) -> Result<()>;

    /// Number of brokers currently alive in the cluster.
    async fn live_broker_count(&self) -> Result<usize>;
}
