//! Topic executor.
//!
//! Only explicitly set (dynamic) topic configs take part in the diff, so
//! broker defaults never show up as drift. Updates are incremental patches;
//! partition counts are never altered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use keel_core::{
    AccessControlEntry, AclResourceType, ClusterProvider, ManagedClusterConfig, Resource, Topic,
    TopicStatus,
};
use keel_store::LogBackedStore;
use tracing::{debug, error, info, warn};

use crate::broker::{AlterConfigOp, KafkaAdmin, NewTopicRequest};
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::executor::{Executor, Outcome, ReconcileReport, ResourceKind, bounded};
use crate::tags::TagCatalog;

/// Minimal patch turning `actual` dynamic configs into `desired`.
///
/// Changed or missing entries are set; dynamically set entries absent from
/// `desired` are deleted.
pub fn config_delta(
    desired: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<AlterConfigOp> {
    let sets = desired
        .iter()
        .filter(|(name, value)| actual.get(*name) != Some(*value))
        .map(|(name, value)| AlterConfigOp::Set {
            name: name.clone(),
            value: value.clone(),
        });
    let deletes = actual
        .keys()
        .filter(|name| !desired.contains_key(*name))
        .map(|name| AlterConfigOp::Delete { name: name.clone() });
    sets.chain(deletes).collect()
}

/// Reconciles topics of one cluster.
pub struct TopicExecutor {
    cluster: ManagedClusterConfig,
    admin: Arc<dyn KafkaAdmin>,
    topics: Arc<LogBackedStore<Topic>>,
    acls: Arc<LogBackedStore<AccessControlEntry>>,
    tag_catalog: Option<Arc<dyn TagCatalog>>,
}

impl TopicExecutor {
    pub fn new(
        cluster: ManagedClusterConfig,
        admin: Arc<dyn KafkaAdmin>,
        topics: Arc<LogBackedStore<Topic>>,
        acls: Arc<LogBackedStore<AccessControlEntry>>,
    ) -> Self {
        Self {
            cluster,
            admin,
            topics,
            acls,
            tag_catalog: None,
        }
    }

    /// Synchronize topic tags with `catalog` on providers that have one.
    #[must_use]
    pub fn with_tag_catalog(mut self, catalog: Arc<dyn TagCatalog>) -> Self {
        self.tag_catalog = Some(catalog);
        self
    }

    /// Delete a topic on the broker right away.
    pub async fn delete_topic(&self, topic: &Topic) -> Result<()> {
        if topic.metadata.cluster != self.cluster.name {
            return Err(Error::UnknownCluster {
                cluster: topic.metadata.cluster.clone(),
            });
        }
        let names = [topic.metadata.name.clone()];
        bounded(
            "delete_topics",
            self.cluster.admin_timeout,
            self.admin.delete_topics(&names),
        )
        .await?;
        info!(cluster = %self.cluster.name, topic = %topic.metadata.name, "Topic deleted");
        Ok(())
    }

    /// Explicitly set configs of every non-internal broker topic.
    async fn collect_actual(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let timeout = self.cluster.admin_timeout;
        let names = bounded("list_topics", timeout, self.admin.list_topics()).await?;
        let described = bounded(
            "describe_topics",
            timeout,
            self.admin.describe_topics(&names),
        )
        .await?;
        let names: Vec<String> = described
            .into_iter()
            .filter(|t| !t.internal)
            .map(|t| t.name)
            .collect();
        let mut configs = bounded(
            "describe_topic_configs",
            timeout,
            self.admin.describe_topic_configs(&names),
        )
        .await?;

        Ok(names
            .into_iter()
            .map(|name| {
                let dynamic = configs
                    .remove(&name)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|e| e.is_dynamic_topic_config())
                    .filter_map(|e| e.value.map(|v| (e.name, v)))
                    .collect();
                (name, dynamic)
            })
            .collect())
    }

    async fn create(&self, topic: &Topic) -> bool {
        let request = NewTopicRequest {
            name: topic.metadata.name.clone(),
            partitions: topic.spec.partitions,
            replication_factor: topic.spec.replication_factor,
            configs: topic.spec.configs.clone(),
        };
        let result = bounded(
            "create_topics",
            self.cluster.admin_timeout,
            self.admin.create_topics(std::slice::from_ref(&request)),
        )
        .await;
        self.conclude(topic, Outcome::Created, result).await
    }

    async fn update(&self, topic: &Topic, ops: &[AlterConfigOp]) -> bool {
        debug!(
            cluster = %self.cluster.name,
            topic = %topic.metadata.name,
            ops = %ops.iter().join(", "),
            "Patching topic configs"
        );
        let result = bounded(
            "incremental_alter_configs",
            self.cluster.admin_timeout,
            self.admin.incremental_alter_configs(&topic.metadata.name, ops),
        )
        .await;
        self.conclude(topic, Outcome::Updated, result).await
    }

    /// Log the outcome and record it as the topic's status.
    async fn conclude(&self, topic: &Topic, outcome: Outcome, result: Result<()>) -> bool {
        let (ok, status) = match result {
            Ok(()) => {
                info!(cluster = %self.cluster.name, topic = %topic.metadata.name, action = ?outcome, "Topic applied");
                let message = match outcome {
                    Outcome::Created => "Topic created",
                    Outcome::Updated | Outcome::Deleted => "Topic configs updated",
                };
                (true, TopicStatus::success(message))
            }
            Err(e) => {
                error!(
                    cluster = %self.cluster.name,
                    topic = %topic.metadata.name,
                    action = ?outcome,
                    error = %e,
                    "Failed to apply topic"
                );
                (false, TopicStatus::failed(e.to_string()))
            }
        };

        let mut recorded = topic.clone();
        recorded.status = Some(status);
        if let Err(e) = self.topics.create(&topic.store_key(), recorded).await {
            warn!(topic = %topic.metadata.name, error = %e, "Could not record topic status");
        }
        ok
    }

    async fn delete(&self, name: &str) -> bool {
        let names = [name.to_string()];
        match bounded(
            "delete_topics",
            self.cluster.admin_timeout,
            self.admin.delete_topics(&names),
        )
        .await
        {
            Ok(()) => {
                info!(cluster = %self.cluster.name, topic = name, "Unsynced topic deleted");
                true
            }
            Err(e) => {
                error!(cluster = %self.cluster.name, topic = name, error = %e, "Failed to delete topic");
                false
            }
        }
    }

    /// Add desired-only tags and remove actual-only tags of managed topics.
    async fn sync_tags(
        &self,
        catalog: &dyn TagCatalog,
        topics: impl Iterator<Item = &Topic>,
        report: &mut ReconcileReport,
    ) {
        let actual = match catalog.list_topic_tags(&self.cluster.name).await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "Could not list topic tags");
                return;
            }
        };

        for topic in topics {
            let name = &topic.metadata.name;
            let desired: BTreeSet<String> = topic.spec.tags.iter().cloned().collect();
            let current = actual.get(name).cloned().unwrap_or_default();
            let diff = Diff::of_sets(desired, current);

            if !diff.to_create.is_empty() {
                let tags: Vec<String> = diff.to_create.into_keys().collect();
                match catalog.add_topic_tags(&self.cluster.name, name, &tags).await {
                    Ok(()) => debug!(topic = %name, tags = ?tags, "Tags added"),
                    Err(e) => {
                        error!(cluster = %self.cluster.name, topic = %name, error = %e, "Failed to add tags");
                        report.failed = report.failed.saturating_add(1);
                    }
                }
            }
            for tag in diff.to_delete.keys() {
                if let Err(e) = catalog.remove_topic_tag(&self.cluster.name, name, tag).await {
                    error!(cluster = %self.cluster.name, topic = %name, tag, error = %e, "Failed to remove tag");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }
    }
}

#[async_trait]
impl Executor for TopicExecutor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Topics
    }

    fn cluster(&self) -> &str {
        &self.cluster.name
    }

    async fn run(&self) -> Result<ReconcileReport> {
        if !self.cluster.manage_topics {
            debug!(cluster = %self.cluster.name, "Topic management disabled");
            return Ok(ReconcileReport::skipped());
        }

        let desired: BTreeMap<String, Topic> = self
            .topics
            .list_for_cluster(&self.cluster.name)
            .await
            .into_iter()
            .map(|t| (t.metadata.name.clone(), t))
            .collect();
        let actual = match self.collect_actual().await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "Could not collect topics, skipping tick");
                return Err(e);
            }
        };
        let on_broker: BTreeSet<String> = actual.keys().cloned().collect();

        let diff = Diff::compute(
            desired
                .iter()
                .map(|(name, t)| (name.clone(), t.spec.configs.clone()))
                .collect(),
            actual,
            |wanted, current| config_delta(wanted, current).is_empty(),
        );

        let mut report = ReconcileReport::default();
        let mut present = on_broker;

        for name in diff.to_create.keys() {
            if let Some(topic) = desired.get(name) {
                let ok = self.create(topic).await;
                if ok {
                    present.insert(name.clone());
                }
                report.record(Outcome::Created, ok);
            }
        }

        for (name, update) in &diff.to_update {
            if let Some(topic) = desired.get(name) {
                let ops = config_delta(&update.desired, &update.actual);
                let ok = self.update(topic, &ops).await;
                report.record(Outcome::Updated, ok);
            }
        }

        let grants = self.acls.list_for_cluster(&self.cluster.name).await;
        let unsynced: Vec<&String> = diff
            .to_delete
            .keys()
            .filter(|name| {
                grants
                    .iter()
                    .any(|g| g.owns(&g.spec.granted_to, AclResourceType::Topic, name))
            })
            .collect();
        if self.cluster.drop_unsynced_topics {
            for name in unsynced {
                let ok = self.delete(name).await;
                report.record(Outcome::Deleted, ok);
            }
        } else {
            report.unsynced = unsynced.len();
        }

        if self.cluster.provider == ClusterProvider::ConfluentCloud {
            if let Some(catalog) = &self.tag_catalog {
                let managed = desired.values().filter(|t| present.contains(&t.metadata.name));
                self.sync_tags(catalog.as_ref(), managed, &mut report).await;
            }
        }

        report.log(self.kind(), &self.cluster.name);
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use keel_core::{PatternType, Permission, TopicPhase};

    use super::*;
    use crate::broker::ConfigSource;
    use crate::memory::{BrokerMutation, InMemoryBroker};
    use crate::tags::InMemoryTagCatalog;
    use crate::testing::{CLUSTER, add_namespace, grant, ready_stores};

    fn executor(
        broker: &Arc<InMemoryBroker>,
        stores: &keel_store::ResourceStores,
        cluster: ManagedClusterConfig,
    ) -> TopicExecutor {
        TopicExecutor::new(cluster, broker.clone(), stores.topics.clone(), stores.acls.clone())
    }

    async fn desire(stores: &keel_store::ResourceStores, topic: Topic) -> Topic {
        stores.topics.create(&topic.store_key(), topic).await.unwrap()
    }

    #[test]
    fn test_config_delta_sets_then_deletes() {
        let desired = BTreeMap::from([("retention.ms".to_string(), "1000".to_string())]);
        let actual = BTreeMap::from([
            ("retention.ms".to_string(), "500".to_string()),
            ("segment.ms".to_string(), "100".to_string()),
        ]);

        let ops = config_delta(&desired, &actual);

        assert_eq!(
            ops,
            vec![
                AlterConfigOp::Set {
                    name: "retention.ms".to_string(),
                    value: "1000".to_string()
                },
                AlterConfigOp::Delete {
                    name: "segment.ms".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_config_delta_empty_when_equal() {
        let configs = BTreeMap::from([("cleanup.policy".to_string(), "compact".to_string())]);
        assert!(config_delta(&configs, &configs).is_empty());
    }

    #[tokio::test]
    async fn test_update_patches_configs_without_touching_partitions() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        broker.add_topic("topic1", 3, 3).await;
        broker.set_topic_config("topic1", "retention.ms", "500", ConfigSource::DynamicTopicConfig).await;
        broker.set_topic_config("topic1", "segment.ms", "100", ConfigSource::DynamicTopicConfig).await;
        broker.set_topic_config("topic1", "cleanup.policy", "delete", ConfigSource::DefaultConfig).await;
        desire(
            &stores,
            Topic::new("topic1", "ns", CLUSTER, 3, 3).with_config("retention.ms", "1000"),
        )
        .await;

        let report = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await?;

        assert_eq!(report.updated, 1);
        assert_eq!(
            broker.journal().await,
            vec![BrokerMutation::AlterConfigs {
                topic: "topic1".to_string(),
                ops: vec![
                    AlterConfigOp::Set {
                        name: "retention.ms".to_string(),
                        value: "1000".to_string()
                    },
                    AlterConfigOp::Delete {
                        name: "segment.ms".to_string()
                    },
                ],
            }]
        );
        assert_eq!(broker.partitions_of("topic1").await, Some(3));

        let recorded = stores.topics.find_by_key("local/topic1").await.unwrap();
        assert_eq!(recorded.status.map(|s| s.phase), Some(TopicPhase::Success));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_topic_is_created_with_full_config() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        desire(
            &stores,
            Topic::new("orders", "ns", CLUSTER, 6, 3)
                .with_config("retention.ms", "1000")
                .with_config("min.insync.replicas", "2"),
        )
        .await;
        let topics = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER));

        let report = topics.run().await?;
        assert_eq!(report.created, 1);
        assert_eq!(broker.partitions_of("orders").await, Some(6));
        assert_eq!(broker.dynamic_configs("orders").await.len(), 2);

        let second = topics.run().await?;
        assert!(second.converged());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_create_is_recorded_and_isolated() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        broker.fail_resource("broken").await;
        desire(&stores, Topic::new("broken", "ns", CLUSTER, 1, 1)).await;
        desire(&stores, Topic::new("fine", "ns", CLUSTER, 1, 1)).await;

        let report = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await?;

        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(broker.topic_names().await, vec!["fine".to_string()]);
        let broken = stores.topics.find_by_key("local/broken").await.unwrap();
        assert_eq!(broken.status.map(|s| s.phase), Some(TopicPhase::Failed));
        Ok(())
    }

    #[tokio::test]
    async fn test_unsynced_owned_topic_kept_by_default() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;
        broker.add_topic("ns-stale", 1, 1).await;
        broker.add_topic("foreign", 1, 1).await;

        let report = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await?;

        assert_eq!(report.unsynced, 1);
        assert_eq!(broker.topic_names().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsynced_owned_topic_dropped_when_enabled() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;
        broker.add_topic("ns-stale", 1, 1).await;
        broker.add_topic("foreign", 1, 1).await;
        broker.add_topic("__consumer_offsets", 50, 3).await;

        let cluster = ManagedClusterConfig::new(CLUSTER).drop_unsynced(false, true, false);
        let report = executor(&broker, &stores, cluster).run().await?;

        assert_eq!(report.deleted, 1);
        assert_eq!(
            broker.topic_names().await,
            vec!["__consumer_offsets".to_string(), "foreign".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_management_is_a_noop() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        desire(&stores, Topic::new("orders", "ns", CLUSTER, 1, 1)).await;

        let mut cluster = ManagedClusterConfig::new(CLUSTER);
        cluster.manage_topics = false;
        let report = executor(&broker, &stores, cluster).run().await?;

        assert!(report.skipped);
        assert!(broker.topic_names().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_collect_failure_aborts_tick() {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        desire(&stores, Topic::new("orders", "ns", CLUSTER, 1, 1)).await;
        broker.fail_operation("describe_topic_configs").await;

        let result = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await;

        assert!(result.is_err());
        assert!(broker.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_tags_synced_for_cloud_clusters() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        let catalog = Arc::new(InMemoryTagCatalog::new());
        broker.add_topic("orders", 1, 1).await;
        catalog.tag(CLUSTER, "orders", "LEGACY").await;
        desire(
            &stores,
            Topic::new("orders", "ns", CLUSTER, 1, 1).with_tags(["PII"]),
        )
        .await;

        let cluster = ManagedClusterConfig::new(CLUSTER).provider(ClusterProvider::ConfluentCloud);
        executor(&broker, &stores, cluster)
            .with_tag_catalog(catalog.clone())
            .run()
            .await?;

        assert_eq!(
            catalog.tags_of(CLUSTER, "orders").await,
            BTreeSet::from(["PII".to_string()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_tags_ignored_for_self_managed_clusters() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        let catalog = Arc::new(InMemoryTagCatalog::new());
        desire(
            &stores,
            Topic::new("orders", "ns", CLUSTER, 1, 1).with_tags(["PII"]),
        )
        .await;

        executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER))
            .with_tag_catalog(catalog.clone())
            .run()
            .await?;

        assert!(catalog.journal().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_topic_on_demand() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        broker.add_topic("orders", 1, 1).await;
        let topics = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER));

        topics
            .delete_topic(&Topic::new("orders", "ns", CLUSTER, 1, 1))
            .await?;
        assert!(broker.topic_names().await.is_empty());

        let elsewhere = topics
            .delete_topic(&Topic::new("orders", "ns", "remote", 1, 1))
            .await;
        assert!(matches!(elsewhere, Err(Error::UnknownCluster { .. })));
        Ok(())
    }
}
