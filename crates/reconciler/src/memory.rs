//! In-memory broker for tests.
//!
//! Keeps topics, ACLs, quotas, credentials and consumer groups in maps,
//! records every mutation in a journal and can be told to fail a whole
//! operation or every mutation touching one resource name.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::broker::{
    AclBinding, AlterConfigOp, ConfigEntry, ConfigSource, ConsumerGroupState, KafkaAdmin,
    NewTopicRequest, OffsetSpec, ScramCredential, ScramMechanism, TopicDescription,
    TopicPartition, UserQuotas,
};
use crate::error::{Error, Result};

/// A state change applied to the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMutation {
    CreateTopic(String),
    DeleteTopic(String),
    AlterConfigs {
        topic: String,
        ops: Vec<AlterConfigOp>,
    },
    CreateAcl(AclBinding),
    DeleteAcl(AclBinding),
    AlterQuotas {
        user: String,
        quotas: BTreeMap<String, f64>,
    },
    UpsertCredential {
        user: String,
        mechanism: ScramMechanism,
    },
    AlterGroupOffsets {
        group: String,
        offsets: BTreeMap<TopicPartition, i64>,
    },
}

#[derive(Debug, Clone)]
struct BrokerTopic {
    partitions: i32,
    replication_factor: i16,
    internal: bool,
    configs: BTreeMap<String, ConfigEntry>,
}

#[derive(Debug, Clone, Default)]
struct PartitionLog {
    earliest: i64,
    latest: i64,
    /// `(timestamp_ms, offset)` in ascending order.
    timestamps: Vec<(i64, i64)>,
}

#[derive(Debug, Clone)]
struct Group {
    state: ConsumerGroupState,
    offsets: BTreeMap<TopicPartition, i64>,
}

#[derive(Debug)]
struct BrokerState {
    topics: BTreeMap<String, BrokerTopic>,
    acls: BTreeSet<AclBinding>,
    quotas: UserQuotas,
    credentials: BTreeMap<String, ScramCredential>,
    groups: BTreeMap<String, Group>,
    partitions: BTreeMap<TopicPartition, PartitionLog>,
    node_count: usize,
    journal: Vec<BrokerMutation>,
    failing_operations: HashSet<String>,
    failing_resources: HashSet<String>,
}

impl BrokerState {
    fn check(&self, operation: &str) -> Result<()> {
        if self.failing_operations.contains(operation) {
            return Err(Error::broker(operation, "injected failure"));
        }
        Ok(())
    }

    fn check_resource(&self, operation: &str, resource: &str) -> Result<()> {
        self.check(operation)?;
        if self.failing_resources.contains(resource) {
            return Err(Error::broker(
                operation,
                format!("injected failure for '{resource}'"),
            ));
        }
        Ok(())
    }
}

/// In-memory implementation of [`KafkaAdmin`].
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty three-node broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                topics: BTreeMap::new(),
                acls: BTreeSet::new(),
                quotas: BTreeMap::new(),
                credentials: BTreeMap::new(),
                groups: BTreeMap::new(),
                partitions: BTreeMap::new(),
                node_count: 3,
                journal: Vec::new(),
                failing_operations: HashSet::new(),
                failing_resources: HashSet::new(),
            })),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    /// Add a topic without journaling it.
    pub async fn add_topic(&self, name: &str, partitions: i32, replication_factor: i16) {
        let mut state = self.state.lock().await;
        state.topics.insert(
            name.to_string(),
            BrokerTopic {
                partitions,
                replication_factor,
                internal: name.starts_with("__"),
                configs: BTreeMap::new(),
            },
        );
    }

    /// Set a topic config entry without journaling it.
    pub async fn set_topic_config(&self, topic: &str, name: &str, value: &str, source: ConfigSource) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.topics.get_mut(topic) {
            t.configs.insert(
                name.to_string(),
                ConfigEntry {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                    source,
                },
            );
        }
    }

    /// Add an ACL binding without journaling it.
    pub async fn add_acl(&self, binding: AclBinding) {
        self.state.lock().await.acls.insert(binding);
    }

    /// Set a user's quotas without journaling it.
    pub async fn set_quotas(&self, user: &str, quotas: BTreeMap<String, f64>) {
        self.state.lock().await.quotas.insert(user.to_string(), quotas);
    }

    /// Define the offset range of a partition.
    pub async fn set_partition_offsets(&self, partition: TopicPartition, earliest: i64, latest: i64) {
        let mut state = self.state.lock().await;
        let log = state.partitions.entry(partition).or_default();
        log.earliest = earliest;
        log.latest = latest;
    }

    /// Record that `offset` was written at `timestamp_ms`.
    pub async fn add_offset_timestamp(&self, partition: TopicPartition, timestamp_ms: i64, offset: i64) {
        let mut state = self.state.lock().await;
        let log = state.partitions.entry(partition).or_default();
        log.timestamps.push((timestamp_ms, offset));
        log.timestamps.sort_unstable();
    }

    /// Define a consumer group.
    pub async fn set_group(
        &self,
        group: &str,
        state: ConsumerGroupState,
        offsets: BTreeMap<TopicPartition, i64>,
    ) {
        self.state
            .lock()
            .await
            .groups
            .insert(group.to_string(), Group { state, offsets });
    }

    pub async fn set_node_count(&self, count: usize) {
        self.state.lock().await.node_count = count;
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make every call of `operation` (a [`KafkaAdmin`] method name) fail.
    pub async fn fail_operation(&self, operation: &str) {
        self.state
            .lock()
            .await
            .failing_operations
            .insert(operation.to_string());
    }

    /// Make every mutation that targets `resource` fail.
    pub async fn fail_resource(&self, resource: &str) {
        self.state
            .lock()
            .await
            .failing_resources
            .insert(resource.to_string());
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.failing_operations.clear();
        state.failing_resources.clear();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Every mutation applied so far, in order.
    pub async fn journal(&self) -> Vec<BrokerMutation> {
        self.state.lock().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }

    pub async fn acls(&self) -> BTreeSet<AclBinding> {
        self.state.lock().await.acls.clone()
    }

    pub async fn topic_names(&self) -> Vec<String> {
        self.state.lock().await.topics.keys().cloned().collect()
    }

    /// Explicitly set configs of a topic.
    pub async fn dynamic_configs(&self, topic: &str) -> BTreeMap<String, String> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| {
                t.configs
                    .values()
                    .filter(|e| e.is_dynamic_topic_config())
                    .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn partitions_of(&self, topic: &str) -> Option<i32> {
        self.state.lock().await.topics.get(topic).map(|t| t.partitions)
    }

    pub async fn quotas(&self) -> UserQuotas {
        self.state.lock().await.quotas.clone()
    }

    pub async fn credential(&self, user: &str) -> Option<ScramCredential> {
        self.state.lock().await.credentials.get(user).cloned()
    }

    pub async fn group_offsets(&self, group: &str) -> BTreeMap<TopicPartition, i64> {
        self.state
            .lock()
            .await
            .groups
            .get(group)
            .map(|g| g.offsets.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KafkaAdmin for InMemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        state.check("list_topics")?;
        Ok(state.topics.keys().cloned().collect())
    }

    async fn describe_topics(&self, names: &[String]) -> Result<Vec<TopicDescription>> {
        let state = self.state.lock().await;
        state.check("describe_topics")?;
        names
            .iter()
            .map(|name| {
                state
                    .topics
                    .get(name)
                    .map(|t| TopicDescription {
                        name: name.clone(),
                        partitions: t.partitions,
                        replication_factor: t.replication_factor,
                        internal: t.internal,
                    })
                    .ok_or_else(|| {
                        Error::broker("describe_topics", format!("unknown topic '{name}'"))
                    })
            })
            .collect()
    }

    async fn describe_topic_configs(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, Vec<ConfigEntry>>> {
        let state = self.state.lock().await;
        state.check("describe_topic_configs")?;
        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .topics
                    .get(name)
                    .map(|t| (name.clone(), t.configs.values().cloned().collect()))
            })
            .collect())
    }

    async fn create_topics(&self, topics: &[NewTopicRequest]) -> Result<()> {
        let mut state = self.state.lock().await;
        for topic in topics {
            state.check_resource("create_topics", &topic.name)?;
            if state.topics.contains_key(&topic.name) {
                return Err(Error::broker(
                    "create_topics",
                    format!("topic '{}' already exists", topic.name),
                ));
            }
            let brokers = state.node_count;
            if usize::try_from(topic.replication_factor).unwrap_or(0) > brokers {
                return Err(Error::broker(
                    "create_topics",
                    format!(
                        "replication factor {} larger than {brokers} brokers",
                        topic.replication_factor
                    ),
                ));
            }

            let configs = topic
                .configs
                .iter()
                .map(|(k, v)| (k.clone(), ConfigEntry::dynamic(k, v)))
                .collect();
            state.topics.insert(
                topic.name.clone(),
                BrokerTopic {
                    partitions: topic.partitions,
                    replication_factor: topic.replication_factor,
                    internal: false,
                    configs,
                },
            );
            state.journal.push(BrokerMutation::CreateTopic(topic.name.clone()));
        }
        Ok(())
    }

    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for name in names {
            state.check_resource("delete_topics", name)?;
            if state.topics.remove(name).is_none() {
                return Err(Error::broker(
                    "delete_topics",
                    format!("unknown topic '{name}'"),
                ));
            }
            state.journal.push(BrokerMutation::DeleteTopic(name.clone()));
        }
        Ok(())
    }

    async fn incremental_alter_configs(&self, topic: &str, ops: &[AlterConfigOp]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_resource("incremental_alter_configs", topic)?;
        let entry = state.topics.get_mut(topic).ok_or_else(|| {
            Error::broker("incremental_alter_configs", format!("unknown topic '{topic}'"))
        })?;
        for op in ops {
            match op {
                AlterConfigOp::Set { name, value } => {
                    entry
                        .configs
                        .insert(name.clone(), ConfigEntry::dynamic(name, value));
                }
                AlterConfigOp::Delete { name } => {
                    entry.configs.remove(name);
                }
            }
        }
        state.journal.push(BrokerMutation::AlterConfigs {
            topic: topic.to_string(),
            ops: ops.to_vec(),
        });
        Ok(())
    }

    async fn describe_cluster_node_count(&self) -> Result<usize> {
        let state = self.state.lock().await;
        state.check("describe_cluster_node_count")?;
        Ok(state.node_count)
    }

    async fn describe_acls(&self) -> Result<Vec<AclBinding>> {
        let state = self.state.lock().await;
        state.check("describe_acls")?;
        Ok(state.acls.iter().cloned().collect())
    }

    async fn create_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        let mut state = self.state.lock().await;
        for binding in bindings {
            state.check_resource("create_acls", &binding.resource_name)?;
            state.acls.insert(binding.clone());
            state.journal.push(BrokerMutation::CreateAcl(binding.clone()));
        }
        Ok(())
    }

    async fn delete_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        let mut state = self.state.lock().await;
        for binding in bindings {
            state.check_resource("delete_acls", &binding.resource_name)?;
            state.acls.remove(binding);
            state.journal.push(BrokerMutation::DeleteAcl(binding.clone()));
        }
        Ok(())
    }

    async fn describe_user_quotas(&self) -> Result<UserQuotas> {
        let state = self.state.lock().await;
        state.check("describe_user_quotas")?;
        Ok(state.quotas.clone())
    }

    async fn alter_user_quotas(&self, user: &str, quotas: &BTreeMap<String, f64>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_resource("alter_user_quotas", user)?;
        state
            .quotas
            .entry(user.to_string())
            .or_default()
            .extend(quotas.iter().map(|(k, v)| (k.clone(), *v)));
        state.journal.push(BrokerMutation::AlterQuotas {
            user: user.to_string(),
            quotas: quotas.clone(),
        });
        Ok(())
    }

    async fn upsert_scram_credentials(&self, credential: &ScramCredential) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_resource("upsert_scram_credentials", &credential.user)?;
        state
            .credentials
            .insert(credential.user.clone(), credential.clone());
        state.journal.push(BrokerMutation::UpsertCredential {
            user: credential.user.clone(),
            mechanism: credential.mechanism,
        });
        Ok(())
    }

    async fn describe_consumer_group_state(&self, group: &str) -> Result<ConsumerGroupState> {
        let state = self.state.lock().await;
        state.check("describe_consumer_group_state")?;
        Ok(state
            .groups
            .get(group)
            .map_or(ConsumerGroupState::Dead, |g| g.state))
    }

    async fn list_consumer_group_offsets(
        &self,
        group: &str,
    ) -> Result<BTreeMap<TopicPartition, i64>> {
        let state = self.state.lock().await;
        state.check("list_consumer_group_offsets")?;
        Ok(state
            .groups
            .get(group)
            .map(|g| g.offsets.clone())
            .unwrap_or_default())
    }

    async fn list_offsets(
        &self,
        partitions: &[TopicPartition],
        spec: OffsetSpec,
    ) -> Result<BTreeMap<TopicPartition, i64>> {
        let state = self.state.lock().await;
        state.check("list_offsets")?;
        partitions
            .iter()
            .map(|tp| {
                let log = state.partitions.get(tp).ok_or_else(|| {
                    Error::broker("list_offsets", format!("unknown partition '{tp}'"))
                })?;
                let offset = match spec {
                    OffsetSpec::Earliest => log.earliest,
                    OffsetSpec::Latest => log.latest,
                    OffsetSpec::Timestamp(ts) => log
                        .timestamps
                        .iter()
                        .find(|(written, _)| *written >= ts)
                        .map_or(log.latest, |(_, offset)| *offset),
                };
                Ok((tp.clone(), offset))
            })
            .collect()
    }

    async fn alter_consumer_group_offsets(
        &self,
        group: &str,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_resource("alter_consumer_group_offsets", group)?;
        let entry = state.groups.entry(group.to_string()).or_insert(Group {
            state: ConsumerGroupState::Empty,
            offsets: BTreeMap::new(),
        });
        entry
            .offsets
            .extend(offsets.iter().map(|(tp, o)| (tp.clone(), *o)));
        state.journal.push(BrokerMutation::AlterGroupOffsets {
            group: group.to_string(),
            offsets: offsets.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use keel_core::PatternType;

    use super::*;
    use crate::broker::{AclOperation, BindingResourceType};

    #[tokio::test]
    async fn test_created_topic_configs_are_dynamic() -> Result<()> {
        let broker = InMemoryBroker::new();
        broker
            .create_topics(&[NewTopicRequest {
                name: "orders".to_string(),
                partitions: 3,
                replication_factor: 3,
                configs: BTreeMap::from([("retention.ms".to_string(), "1000".to_string())]),
            }])
            .await?;

        let configs = broker.describe_topic_configs(&["orders".to_string()]).await?;
        let entries = configs.get("orders").cloned().unwrap_or_default();
        assert_eq!(entries.len(), 1);
        assert!(entries.iter().all(ConfigEntry::is_dynamic_topic_config));
        assert_eq!(broker.journal().await, vec![BrokerMutation::CreateTopic("orders".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_operation_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_operation("describe_acls").await;
        assert!(matches!(broker.describe_acls().await, Err(Error::Broker { .. })));

        broker.clear_failures().await;
        assert!(broker.describe_acls().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_resource_failure_leaves_state_untouched() {
        let broker = InMemoryBroker::new();
        broker.fail_resource("ns-").await;
        let binding = AclBinding::allow(
            BindingResourceType::Topic,
            "ns-",
            PatternType::Prefixed,
            "User:ns",
            AclOperation::Read,
        );

        assert!(broker.create_acls(&[binding]).await.is_err());
        assert!(broker.acls().await.is_empty());
        assert!(broker.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_offsets_by_timestamp() -> Result<()> {
        let broker = InMemoryBroker::new();
        let tp = TopicPartition::new("orders", 0);
        broker.set_partition_offsets(tp.clone(), 0, 100).await;
        broker.add_offset_timestamp(tp.clone(), 1_000, 10).await;
        broker.add_offset_timestamp(tp.clone(), 2_000, 50).await;

        let partitions = [tp.clone()];
        let found = broker.list_offsets(&partitions, OffsetSpec::Timestamp(1_500)).await?;
        assert_eq!(found.get(&tp), Some(&50));
        let past_end = broker.list_offsets(&partitions, OffsetSpec::Timestamp(9_000)).await?;
        assert_eq!(past_end.get(&tp), Some(&100));
        Ok(())
    }
}
