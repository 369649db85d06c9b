//! Access-grant executor.
//!
//! Declarative grants are expanded into primitive broker bindings and the
//! diff runs on that expanded form. Streams and connector ownership add
//! implicit bindings. New bindings are always created before stale ones are
//! removed, so a principal never loses access mid-tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{
    AccessControlEntry, AccessControlEntrySpec, AclResourceType, KafkaStream,
    ManagedClusterConfig, Namespace, PatternType, Permission,
};
use keel_store::LogBackedStore;
use tracing::{debug, error, info, warn};

use crate::broker::{AclBinding, AclOperation, BindingResourceType, KafkaAdmin};
use crate::diff::Diff;
use crate::error::Result;
use crate::executor::{Executor, Outcome, ReconcileReport, ResourceKind, bounded};

/// Binding types this executor manages. Anything else is left alone.
const MANAGED_TYPES: [BindingResourceType; 3] = [
    BindingResourceType::Topic,
    BindingResourceType::Group,
    BindingResourceType::TransactionalId,
];

/// Primitive bindings implied by one grant to `principal`.
pub fn expand_entry(spec: &AccessControlEntrySpec, principal: &str) -> Vec<AclBinding> {
    let pattern = spec.resource_pattern_type;
    let on = |resource_type, resource: &str, operations: &[AclOperation]| {
        operations
            .iter()
            .map(|op| AclBinding::allow(resource_type, resource, pattern, principal, *op))
            .collect::<Vec<_>>()
    };

    match (spec.resource_type, spec.permission) {
        (AclResourceType::Topic, Permission::Owner) => on(
            BindingResourceType::Topic,
            &spec.resource,
            &[AclOperation::Read, AclOperation::Write, AclOperation::DescribeConfigs],
        ),
        (AclResourceType::Topic, Permission::Read) => on(
            BindingResourceType::Topic,
            &spec.resource,
            &[AclOperation::Read, AclOperation::DescribeConfigs],
        ),
        (AclResourceType::Topic, Permission::Write) => on(
            BindingResourceType::Topic,
            &spec.resource,
            &[AclOperation::Write, AclOperation::DescribeConfigs],
        ),
        (AclResourceType::Group, _) => on(
            BindingResourceType::Group,
            &spec.resource,
            &[AclOperation::Read],
        ),
        (AclResourceType::TransactionalId, Permission::Owner) => on(
            BindingResourceType::TransactionalId,
            &spec.resource,
            &[AclOperation::Describe, AclOperation::Write],
        ),
        (AclResourceType::Connect, Permission::Owner) => on(
            BindingResourceType::Group,
            &format!("connect-{}", spec.resource),
            &[AclOperation::Read],
        ),
        (AclResourceType::TransactionalId | AclResourceType::Connect, _)
        | (AclResourceType::ConnectCluster, _) => Vec::new(),
    }
}

/// Bindings a stream application needs for its internal topics.
pub fn expand_stream(stream: &KafkaStream, principal: &str) -> Vec<AclBinding> {
    let prefix = &stream.metadata.name;
    vec![
        AclBinding::allow(
            BindingResourceType::Topic,
            prefix,
            PatternType::Prefixed,
            principal,
            AclOperation::Create,
        ),
        AclBinding::allow(
            BindingResourceType::Topic,
            prefix,
            PatternType::Prefixed,
            principal,
            AclOperation::Delete,
        ),
        AclBinding::allow(
            BindingResourceType::TransactionalId,
            prefix,
            PatternType::Prefixed,
            principal,
            AclOperation::Write,
        ),
    ]
}

/// Reconciles broker ACLs of one cluster.
pub struct AclExecutor {
    cluster: ManagedClusterConfig,
    admin: Arc<dyn KafkaAdmin>,
    namespaces: Arc<LogBackedStore<Namespace>>,
    acls: Arc<LogBackedStore<AccessControlEntry>>,
    streams: Arc<LogBackedStore<KafkaStream>>,
}

impl AclExecutor {
    pub fn new(
        cluster: ManagedClusterConfig,
        admin: Arc<dyn KafkaAdmin>,
        namespaces: Arc<LogBackedStore<Namespace>>,
        acls: Arc<LogBackedStore<AccessControlEntry>>,
        streams: Arc<LogBackedStore<KafkaStream>>,
    ) -> Self {
        Self {
            cluster,
            admin,
            namespaces,
            acls,
            streams,
        }
    }

    /// Expanded desired bindings and the set of principals this cluster manages.
    async fn collect_desired(&self) -> (BTreeSet<AclBinding>, BTreeSet<String>) {
        let principals: BTreeMap<String, String> = self
            .namespaces
            .list_for_cluster(&self.cluster.name)
            .await
            .into_iter()
            .map(|ns| (ns.metadata.name.clone(), ns.principal()))
            .collect();

        let mut desired = BTreeSet::new();
        for entry in self.acls.list_for_cluster(&self.cluster.name).await {
            match principals.get(&entry.spec.granted_to) {
                Some(principal) => desired.extend(expand_entry(&entry.spec, principal)),
                None => debug!(
                    cluster = %self.cluster.name,
                    acl = %entry.metadata.name,
                    granted_to = %entry.spec.granted_to,
                    "Grant to unknown namespace ignored"
                ),
            }
        }
        for stream in self.streams.list_for_cluster(&self.cluster.name).await {
            if let Some(principal) = principals.get(&stream.metadata.namespace) {
                desired.extend(expand_stream(&stream, principal));
            }
        }

        (desired, principals.into_values().collect())
    }

    async fn collect_actual(&self, principals: &BTreeSet<String>) -> Result<BTreeSet<AclBinding>> {
        let bindings = bounded(
            "describe_acls",
            self.cluster.admin_timeout,
            self.admin.describe_acls(),
        )
        .await?;

        Ok(bindings
            .into_iter()
            .filter(|b| MANAGED_TYPES.contains(&b.resource_type))
            .filter(|b| principals.contains(&b.principal))
            .collect())
    }

    async fn apply(&self, binding: &AclBinding, outcome: Outcome) -> bool {
        let timeout = self.cluster.admin_timeout;
        let bindings = std::slice::from_ref(binding);
        let result = match outcome {
            Outcome::Deleted => {
                bounded("delete_acls", timeout, self.admin.delete_acls(bindings)).await
            }
            Outcome::Created | Outcome::Updated => {
                bounded("create_acls", timeout, self.admin.create_acls(bindings)).await
            }
        };

        match result {
            Ok(()) => {
                info!(cluster = %self.cluster.name, acl = %binding, action = ?outcome, "ACL applied");
                true
            }
            Err(e) => {
                error!(
                    cluster = %self.cluster.name,
                    acl = %binding,
                    action = ?outcome,
                    error = %e,
                    "Failed to apply ACL"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Executor for AclExecutor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Acls
    }

    fn cluster(&self) -> &str {
        &self.cluster.name
    }

    async fn run(&self) -> Result<ReconcileReport> {
        if !self.cluster.manage_acls {
            debug!(cluster = %self.cluster.name, "ACL management disabled");
            return Ok(ReconcileReport::skipped());
        }

        let (desired, principals) = self.collect_desired().await;
        let actual = match self.collect_actual(&principals).await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "Could not collect ACLs, skipping tick");
                return Err(e);
            }
        };

        let diff = Diff::of_sets(desired, actual);
        let mut report = ReconcileReport::default();

        for binding in diff.to_create.keys() {
            let ok = self.apply(binding, Outcome::Created).await;
            report.record(Outcome::Created, ok);
        }

        if self.cluster.drop_unsynced_acls {
            for binding in diff.to_delete.keys() {
                let ok = self.apply(binding, Outcome::Deleted).await;
                report.record(Outcome::Deleted, ok);
            }
        } else {
            report.unsynced = diff.to_delete.len();
            for binding in diff.to_delete.keys() {
                debug!(cluster = %self.cluster.name, acl = %binding, "Unsynced ACL kept");
            }
        }

        report.log(self.kind(), &self.cluster.name);
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use keel_core::Resource;

    use super::*;
    use crate::memory::{BrokerMutation, InMemoryBroker};
    use crate::testing::{CLUSTER, add_namespace, grant, ready_stores};

    fn executor(
        broker: &Arc<InMemoryBroker>,
        stores: &keel_store::ResourceStores,
        cluster: ManagedClusterConfig,
    ) -> AclExecutor {
        AclExecutor::new(
            cluster,
            broker.clone(),
            stores.namespaces.clone(),
            stores.acls.clone(),
            stores.streams.clone(),
        )
    }

    fn read_prefixed(resource: &str, principal: &str, op: AclOperation) -> AclBinding {
        AclBinding::allow(
            BindingResourceType::Topic,
            resource,
            PatternType::Prefixed,
            principal,
            op,
        )
    }

    // ========================================================================
    // Expansion
    // ========================================================================

    #[test]
    fn test_connect_owner_grants_connect_group() {
        let spec = AccessControlEntrySpec {
            resource_type: AclResourceType::Connect,
            resource: "ns-".to_string(),
            resource_pattern_type: PatternType::Prefixed,
            permission: Permission::Owner,
            granted_to: "ns".to_string(),
        };
        let bindings = expand_entry(&spec, "User:ns");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].resource_type, BindingResourceType::Group);
        assert_eq!(bindings[0].resource_name, "connect-ns-");
        assert_eq!(bindings[0].pattern_type, PatternType::Prefixed);
    }

    #[test]
    fn test_connect_cluster_grants_nothing() {
        let spec = AccessControlEntrySpec {
            resource_type: AclResourceType::ConnectCluster,
            resource: "shared".to_string(),
            resource_pattern_type: PatternType::Literal,
            permission: Permission::Owner,
            granted_to: "ns".to_string(),
        };
        assert!(expand_entry(&spec, "User:ns").is_empty());
    }

    #[test]
    fn test_transactional_owner_expansion() {
        let spec = AccessControlEntrySpec {
            resource_type: AclResourceType::TransactionalId,
            resource: "ns-".to_string(),
            resource_pattern_type: PatternType::Prefixed,
            permission: Permission::Owner,
            granted_to: "ns".to_string(),
        };
        let ops: Vec<AclOperation> = expand_entry(&spec, "User:ns").iter().map(|b| b.operation).collect();
        assert_eq!(ops, vec![AclOperation::Describe, AclOperation::Write]);
    }

    #[test]
    fn test_stream_expansion() {
        let stream = KafkaStream::new("ns-app", "ns", CLUSTER);
        let bindings = expand_stream(&stream, "User:ns");
        assert_eq!(bindings.len(), 3);
        assert!(bindings.iter().all(|b| b.pattern_type == PatternType::Prefixed));
        assert!(bindings.iter().any(|b| b.resource_type == BindingResourceType::TransactionalId
            && b.operation == AclOperation::Write));
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    #[tokio::test]
    async fn test_owner_prefix_expands_to_three_bindings() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;

        let report = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await?;

        assert_eq!(report.created, 3);
        let expected: BTreeSet<AclBinding> = [
            AclOperation::Read,
            AclOperation::Write,
            AclOperation::DescribeConfigs,
        ]
        .into_iter()
        .map(|op| read_prefixed("ns-", "User:ns-user", op))
        .collect();
        assert_eq!(broker.acls().await, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_tick_is_converged() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;
        let acls = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER));

        acls.run().await?;
        let second = acls.run().await?;
        assert!(second.converged());
        assert_eq!(second.unsynced, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsynced_acl_kept_when_drop_disabled() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        let stray = read_prefixed("legacy-", "User:ns-user", AclOperation::Read);
        broker.add_acl(stray.clone()).await;
        let acls = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER));

        let first = acls.run().await?;
        let second = acls.run().await?;

        assert_eq!(first.unsynced, 1);
        assert_eq!(second.unsynced, 1);
        assert_eq!(first.deleted, 0);
        assert!(broker.acls().await.contains(&stray));
        assert!(broker.journal().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_replacing_grant_creates_before_deleting() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Read).await;
        let old = AclBinding::allow(
            BindingResourceType::Topic,
            "ns-orders",
            PatternType::Literal,
            "User:ns-user",
            AclOperation::Read,
        );
        broker.add_acl(old.clone()).await;

        let cluster = ManagedClusterConfig::new(CLUSTER).drop_unsynced(true, false, false);
        let report = executor(&broker, &stores, cluster).run().await?;
        assert_eq!(report.deleted, 1);

        let journal = broker.journal().await;
        let delete_at = journal
            .iter()
            .position(|m| *m == BrokerMutation::DeleteAcl(old.clone()))
            .expect("old grant deleted");
        let new_read = read_prefixed("ns-", "User:ns-user", AclOperation::Read);
        let create_at = journal
            .iter()
            .position(|m| *m == BrokerMutation::CreateAcl(new_read.clone()))
            .expect("new grant created");
        assert!(create_at < delete_at);
        assert!(journal[..delete_at]
            .iter()
            .all(|m| matches!(m, BrokerMutation::CreateAcl(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_principals_are_ignored() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        broker
            .add_acl(read_prefixed("other-", "User:someone-else", AclOperation::Read))
            .await;

        let cluster = ManagedClusterConfig::new(CLUSTER).drop_unsynced(true, true, true);
        let report = executor(&broker, &stores, cluster).run().await?;

        assert_eq!(report.deleted, 0);
        assert_eq!(report.unsynced, 0);
        assert_eq!(broker.acls().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_management_is_a_noop() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;

        let mut cluster = ManagedClusterConfig::new(CLUSTER);
        cluster.manage_acls = false;
        let report = executor(&broker, &stores, cluster).run().await?;

        assert!(report.skipped);
        assert!(broker.acls().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_collect_failure_aborts_tick() {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;
        broker.fail_operation("describe_acls").await;

        let result = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await;

        assert!(result.is_err());
        assert!(broker.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_binding_does_not_block_others() -> Result<()> {
        let stores = ready_stores().await;
        let broker = InMemoryBroker::new_arc();
        add_namespace(&stores, "ns", "ns-user").await;
        grant(&stores, "ns", AclResourceType::Topic, "ns-", PatternType::Prefixed, Permission::Owner).await;
        grant(&stores, "ns", AclResourceType::Group, "ns-", PatternType::Prefixed, Permission::Owner).await;
        broker.fail_resource("ns-").await;
        let stream = KafkaStream::new("ns-app", "ns", CLUSTER);
        stores.streams.create(&stream.store_key(), stream).await?;

        let report = executor(&broker, &stores, ManagedClusterConfig::new(CLUSTER)).run().await?;

        assert_eq!(report.failed, 4);
        assert_eq!(report.created, 3);
        Ok(())
    }
}
