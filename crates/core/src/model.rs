//! Declarative resource model.
//!
//! These are the descriptors operators submit and the stores persist. Each
//! resource knows its own store key and the suffix of the log topic that
//! holds its kind.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reserved log key used to probe the tail offset of a store topic.
///
/// Real store keys always contain a `/`, so this can never collide.
pub const NOOP_KEY: &str = "NOOP";

/// Default byte-rate quota applied to a namespace user when none is declared.
pub const DEFAULT_BYTE_RATE: f64 = 102_400.0;

/// Quota key for the producer byte rate of a namespace user.
pub const PRODUCER_BYTE_RATE: &str = "user/producer_byte_rate";

/// Quota key for the consumer byte rate of a namespace user.
pub const CONSUMER_BYTE_RATE: &str = "user/consumer_byte_rate";

/// A resource kind that can be held in a log-backed store.
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Suffix appended to the store topic prefix, e.g. `topics`.
    const LOG_SUFFIX: &'static str;

    /// Object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Deterministic key of this resource in its store.
    fn store_key(&self) -> String;

    /// Name of the managed cluster this resource belongs to.
    fn cluster(&self) -> &str {
        &self.metadata().cluster
    }
}

/// Metadata shared by every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub cluster: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a namespaced resource.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cluster: cluster.into(),
            ..Self::default()
        }
    }

    fn namespaced_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn cluster_key(&self) -> String {
        format!("{}/{}", self.cluster, self.name)
    }
}

// ============================================================================
// Namespace
// ============================================================================

/// A tenant of a managed cluster, mapped to one broker principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub metadata: ObjectMeta,
    pub spec: NamespaceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSpec {
    /// Broker user the namespace's grants and quotas apply to.
    pub kafka_user: String,
    /// Connect clusters the namespace may deploy connectors to.
    #[serde(default)]
    pub connect_clusters: Vec<String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>, kafka_user: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metadata: ObjectMeta::new(name.clone(), name, cluster),
            spec: NamespaceSpec {
                kafka_user: kafka_user.into(),
                connect_clusters: Vec::new(),
            },
        }
    }

    /// Broker principal of the namespace user.
    pub fn principal(&self) -> String {
        format!("User:{}", self.spec.kafka_user)
    }
}

impl Resource for Namespace {
    const LOG_SUFFIX: &'static str = "namespaces";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.cluster_key()
    }
}

// ============================================================================
// Topic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub metadata: ObjectMeta,
    pub spec: TopicSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TopicStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSpec {
    pub partitions: i32,
    pub replication_factor: i16,
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TopicPhase {
    Pending,
    Success,
    Failed,
}

/// Outcome of the last reconciliation of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStatus {
    pub phase: TopicPhase,
    pub message: String,
    pub last_update_time: DateTime<Utc>,
}

impl TopicStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            phase: TopicPhase::Success,
            message: message.into(),
            last_update_time: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: TopicPhase::Failed,
            message: message.into(),
            last_update_time: Utc::now(),
        }
    }
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        partitions: i32,
        replication_factor: i16,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace, cluster),
            spec: TopicSpec {
                partitions,
                replication_factor,
                configs: BTreeMap::new(),
                tags: Vec::new(),
            },
            status: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.configs.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl Resource for Topic {
    const LOG_SUFFIX: &'static str = "topics";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.cluster_key()
    }
}

// ============================================================================
// Access control entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AclResourceType {
    Topic,
    Group,
    Connect,
    ConnectCluster,
    TransactionalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    Literal,
    Prefixed,
}

impl PatternType {
    /// Whether `name` is covered by a pattern of this type on `resource`.
    pub fn matches(self, resource: &str, name: &str) -> bool {
        match self {
            Self::Literal => resource == name,
            Self::Prefixed => name.starts_with(resource),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Owner,
    Read,
    Write,
}

/// A declarative grant of a permission on a resource pattern to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlEntry {
    pub metadata: ObjectMeta,
    pub spec: AccessControlEntrySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlEntrySpec {
    pub resource_type: AclResourceType,
    pub resource: String,
    pub resource_pattern_type: PatternType,
    pub permission: Permission,
    /// Namespace receiving the grant.
    pub granted_to: String,
}

impl AccessControlEntry {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        spec: AccessControlEntrySpec,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace, cluster),
            spec,
        }
    }

    /// Whether this entry makes `namespace` the owner of `name` of the given type.
    pub fn owns(&self, namespace: &str, resource_type: AclResourceType, name: &str) -> bool {
        self.spec.permission == Permission::Owner
            && self.spec.resource_type == resource_type
            && self.spec.granted_to == namespace
            && self.spec.resource_pattern_type.matches(&self.spec.resource, name)
    }
}

impl Resource for AccessControlEntry {
    const LOG_SUFFIX: &'static str = "access-control-entries";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.namespaced_key()
    }
}

// ============================================================================
// Connectors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub metadata: ObjectMeta,
    pub spec: ConnectorSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSpec {
    /// Name of the connect runtime the connector is deployed to.
    pub connect_cluster: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Connector {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        connect_cluster: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace, cluster),
            spec: ConnectorSpec {
                connect_cluster: connect_cluster.into(),
                config: BTreeMap::new(),
            },
        }
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.config.insert(key.into(), value.into());
        self
    }
}

impl Resource for Connector {
    const LOG_SUFFIX: &'static str = "connectors";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.namespaced_key()
    }
}

// ============================================================================
// Stream applications
// ============================================================================

/// A stream-processing application; its name is the application id prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaStream {
    pub metadata: ObjectMeta,
}

impl KafkaStream {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace, cluster),
        }
    }
}

impl Resource for KafkaStream {
    const LOG_SUFFIX: &'static str = "streams";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.namespaced_key()
    }
}

// ============================================================================
// Resource quotas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BTreeMap<String, String>,
}

impl ResourceQuota {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace, cluster),
            spec: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_quota(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.insert(key.into(), value.into());
        self
    }

    /// Parsed byte rate for `key`, if declared and numeric.
    pub fn byte_rate(&self, key: &str) -> Option<f64> {
        self.spec.get(key).and_then(|v| v.trim().parse::<f64>().ok())
    }
}

impl Resource for ResourceQuota {
    const LOG_SUFFIX: &'static str = "resource-quotas";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn store_key(&self) -> String {
        self.metadata.namespaced_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_keys_never_collide_with_noop() {
        let topic = Topic::new("orders", "ns1", "local", 3, 1);
        let ns = Namespace::new("ns1", "local", "user1");
        let stream = KafkaStream::new("ns1-app", "ns1", "local");

        for key in [topic.store_key(), ns.store_key(), stream.store_key()] {
            assert_ne!(key, NOOP_KEY);
            assert!(key.contains('/'));
        }
    }

    #[test]
    fn test_topic_keyed_by_cluster_acl_keyed_by_namespace() {
        let topic = Topic::new("orders", "ns1", "local", 3, 1);
        assert_eq!(topic.store_key(), "local/orders");

        let acl = AccessControlEntry::new(
            "ns1-own",
            "ns1",
            "local",
            AccessControlEntrySpec {
                resource_type: AclResourceType::Topic,
                resource: "ns1-".to_string(),
                resource_pattern_type: PatternType::Prefixed,
                permission: Permission::Owner,
                granted_to: "ns1".to_string(),
            },
        );
        assert_eq!(acl.store_key(), "ns1/ns1-own");
    }

    #[test]
    fn test_ownership_follows_pattern_type() {
        let acl = AccessControlEntry::new(
            "own",
            "ns1",
            "local",
            AccessControlEntrySpec {
                resource_type: AclResourceType::Topic,
                resource: "ns1-".to_string(),
                resource_pattern_type: PatternType::Prefixed,
                permission: Permission::Owner,
                granted_to: "ns1".to_string(),
            },
        );

        assert!(acl.owns("ns1", AclResourceType::Topic, "ns1-orders"));
        assert!(!acl.owns("ns1", AclResourceType::Topic, "ns2-orders"));
        assert!(!acl.owns("ns2", AclResourceType::Topic, "ns1-orders"));
        assert!(!acl.owns("ns1", AclResourceType::Group, "ns1-orders"));
    }

    #[test]
    fn test_acl_serializes_in_screaming_case() -> Result<(), serde_json::Error> {
        let spec = AccessControlEntrySpec {
            resource_type: AclResourceType::TransactionalId,
            resource: "ns1-".to_string(),
            resource_pattern_type: PatternType::Prefixed,
            permission: Permission::Owner,
            granted_to: "ns1".to_string(),
        };
        let json = serde_json::to_value(&spec)?;
        assert_eq!(json["resourceType"], "TRANSACTIONAL_ID");
        assert_eq!(json["resourcePatternType"], "PREFIXED");
        assert_eq!(json["grantedTo"], "ns1");
        Ok(())
    }

    #[test]
    fn test_quota_byte_rate_parsing() {
        let quota = ResourceQuota::new("quota", "ns1", "local")
            .with_quota(PRODUCER_BYTE_RATE, "204800")
            .with_quota(CONSUMER_BYTE_RATE, "not-a-number");

        assert_eq!(quota.byte_rate(PRODUCER_BYTE_RATE), Some(204_800.0));
        assert_eq!(quota.byte_rate(CONSUMER_BYTE_RATE), None);
    }

    #[test]
    fn test_namespace_principal() {
        let ns = Namespace::new("ns1", "local", "svc-ns1");
        assert_eq!(ns.principal(), "User:svc-ns1");
    }
}
