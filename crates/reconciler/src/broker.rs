//! Broker administrative interface used by the executors.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use keel_core::PatternType;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Broker-side quota key for the producer byte rate.
pub const PRODUCER_BYTE_RATE_QUOTA: &str = "producer_byte_rate";

/// Broker-side quota key for the consumer byte rate.
pub const CONSUMER_BYTE_RATE_QUOTA: &str = "consumer_byte_rate";

// ============================================================================
// Topics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub internal: bool,
}

/// Where a topic config value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSource {
    /// Explicitly set on the topic.
    DynamicTopicConfig,
    DynamicBrokerConfig,
    DynamicDefaultBrokerConfig,
    StaticBrokerConfig,
    DefaultConfig,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub name: String,
    pub value: Option<String>,
    pub source: ConfigSource,
}

impl ConfigEntry {
    pub fn dynamic(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            source: ConfigSource::DynamicTopicConfig,
        }
    }

    pub fn is_dynamic_topic_config(&self) -> bool {
        self.source == ConfigSource::DynamicTopicConfig
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopicRequest {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub configs: BTreeMap<String, String>,
}

/// One entry of an incremental config patch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlterConfigOp {
    Set { name: String, value: String },
    Delete { name: String },
}

impl fmt::Display for AlterConfigOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set { name, value } => write!(f, "SET {name}={value}"),
            Self::Delete { name } => write!(f, "DELETE {name}"),
        }
    }
}

// ============================================================================
// ACLs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingResourceType {
    Topic,
    Group,
    TransactionalId,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AclOperation {
    All,
    Read,
    Write,
    Create,
    Delete,
    Alter,
    Describe,
    DescribeConfigs,
    AlterConfigs,
    IdempotentWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AclPermissionType {
    Allow,
    Deny,
}

/// A primitive broker ACL: principal may (not) perform operation on pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclBinding {
    pub resource_type: BindingResourceType,
    pub resource_name: String,
    pub pattern_type: PatternType,
    pub principal: String,
    pub host: String,
    pub operation: AclOperation,
    pub permission: AclPermissionType,
}

impl AclBinding {
    /// Allow `principal` to perform `operation` from any host.
    pub fn allow(
        resource_type: BindingResourceType,
        resource_name: impl Into<String>,
        pattern_type: PatternType,
        principal: impl Into<String>,
        operation: AclOperation,
    ) -> Self {
        Self {
            resource_type,
            resource_name: resource_name.into(),
            pattern_type,
            principal: principal.into(),
            host: "*".to_string(),
            operation,
            permission: AclPermissionType::Allow,
        }
    }
}

impl fmt::Display for AclBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {:?}:{:?}:{} from {}",
            self.permission,
            self.principal,
            self.operation,
            self.resource_type,
            self.resource_name,
            self.host
        )
    }
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramMechanism {
    ScramSha256,
    ScramSha512,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ScramCredential {
    pub user: String,
    pub mechanism: ScramMechanism,
    pub iterations: i32,
    pub password: String,
}

impl fmt::Debug for ScramCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramCredential")
            .field("user", &self.user)
            .field("mechanism", &self.mechanism)
            .field("iterations", &self.iterations)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Byte-rate quotas per user, keyed by quota name.
pub type UserQuotas = BTreeMap<String, BTreeMap<String, f64>>;

// ============================================================================
// Consumer groups
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerGroupState {
    Unknown,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
    Dead,
    Empty,
}

impl fmt::Display for ConsumerGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::PreparingRebalance => "PreparingRebalance",
            Self::CompletingRebalance => "CompletingRebalance",
            Self::Stable => "Stable",
            Self::Dead => "Dead",
            Self::Empty => "Empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Which offset `list_offsets` should resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Earliest,
    Latest,
    /// First offset whose timestamp is at or after this epoch-millis value.
    Timestamp(i64),
}

// ============================================================================
// Admin trait
// ============================================================================

/// Administrative operations on one managed cluster.
#[async_trait]
pub trait KafkaAdmin: Send + Sync {
    /// Names of all topics, internal ones included.
    async fn list_topics(&self) -> Result<Vec<String>>;

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>>;

    /// All config entries of each topic, with their source.
    async fn describe_topic_configs(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, Vec<ConfigEntry>>>;

    async fn create_topics(&self, topics: &[NewTopicRequest]) -> Result<()>;

    async fn delete_topics(&self, names: &[String]) -> Result<()>;

    /// Apply a config patch without touching entries it does not name.
    async fn incremental_alter_configs(&self, topic: &str, ops: &[AlterConfigOp]) -> Result<()>;

    async fn describe_cluster_node_count(&self) -> Result<usize>;

    async fn describe_acls(&self) -> Result<Vec<AclBinding>>;

    async fn create_acls(&self, bindings: &[AclBinding]) -> Result<()>;

    async fn delete_acls(&self, bindings: &[AclBinding]) -> Result<()>;

    async fn describe_user_quotas(&self) -> Result<UserQuotas>;

    async fn alter_user_quotas(&self, user: &str, quotas: &BTreeMap<String, f64>) -> Result<()>;

    async fn upsert_scram_credentials(&self, credential: &ScramCredential) -> Result<()>;

    async fn describe_consumer_group_state(&self, group: &str) -> Result<ConsumerGroupState>;

    async fn list_consumer_group_offsets(&self, group: &str)
    -> Result<BTreeMap<TopicPartition, i64>>;

    async fn list_offsets(
        &self,
        partitions: &[TopicPartition],
        spec: OffsetSpec,
    ) -> Result<BTreeMap<TopicPartition, i64>>;

    async fn alter_consumer_group_offsets(
        &self,
        group: &str,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<()>;
}
