//! Shared fixtures for executor tests.

#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    AccessControlEntry, AccessControlEntrySpec, AclResourceType, Namespace, PatternType,
    Permission, Resource, StoreConfig,
};
use keel_store::{InMemoryLog, LogAdmin, LogTransport, ResourceStores};

pub const CLUSTER: &str = "local";

/// Started and caught-up stores on a fresh in-memory log.
pub async fn ready_stores() -> ResourceStores {
    let log = InMemoryLog::new_arc();
    let transport: Arc<dyn LogTransport> = log.clone();
    let admin: Arc<dyn LogAdmin> = log;
    let config = StoreConfig {
        replication_factor: 1,
        readiness_poll: Duration::from_millis(10),
        ..StoreConfig::default()
    };
    let stores = ResourceStores::open(&transport, &admin, &config);
    if let Err(e) = stores.start_all().await {
        panic!("stores should start: {e}");
    }
    if let Err(e) = stores.readiness_gate(&config).wait_until_ready().await {
        panic!("stores should become ready: {e}");
    }
    stores
}

pub async fn add_namespace(stores: &ResourceStores, name: &str, user: &str) -> Namespace {
    let namespace = Namespace::new(name, CLUSTER, user);
    match stores.namespaces.create(&namespace.store_key(), namespace.clone()).await {
        Ok(ns) => ns,
        Err(e) => panic!("namespace write should succeed: {e}"),
    }
}

pub async fn grant(
    stores: &ResourceStores,
    namespace: &str,
    resource_type: AclResourceType,
    resource: &str,
    pattern: PatternType,
    permission: Permission,
) -> AccessControlEntry {
    let name = format!("{namespace}-{resource_type:?}-{resource}-{permission:?}").to_lowercase();
    let entry = AccessControlEntry::new(
        name,
        namespace,
        CLUSTER,
        AccessControlEntrySpec {
            resource_type,
            resource: resource.to_string(),
            resource_pattern_type: pattern,
            permission,
            granted_to: namespace.to_string(),
        },
    );
    match stores.acls.create(&entry.store_key(), entry.clone()).await {
        Ok(entry) => entry,
        Err(e) => panic!("grant write should succeed: {e}"),
    }
}
