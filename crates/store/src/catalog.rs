//! The full set of stores one control plane instance serves from.

use std::sync::Arc;

use keel_core::{
    AccessControlEntry, Connector, KafkaStream, Namespace, ResourceQuota, StoreConfig, Topic,
};
use tracing::info;

use crate::error::Result;
use crate::log::{LogAdmin, LogTransport};
use crate::readiness::{ReadinessGate, ReadinessProbe};
use crate::store::LogBackedStore;

/// One store per resource kind, all on the same log.
#[derive(Clone)]
pub struct ResourceStores {
    pub namespaces: Arc<LogBackedStore<Namespace>>,
    pub topics: Arc<LogBackedStore<Topic>>,
    pub acls: Arc<LogBackedStore<AccessControlEntry>>,
    pub connectors: Arc<LogBackedStore<Connector>>,
    pub streams: Arc<LogBackedStore<KafkaStream>>,
    pub quotas: Arc<LogBackedStore<ResourceQuota>>,
}

impl ResourceStores {
    /// Open every store on its `<prefix>.<suffix>` topic. Nothing is started.
    pub fn open(
        transport: &Arc<dyn LogTransport>,
        admin: &Arc<dyn LogAdmin>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            namespaces: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
            topics: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
            acls: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
            connectors: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
            streams: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
            quotas: Arc::new(LogBackedStore::open(
                Arc::clone(transport),
                Arc::clone(admin),
                config,
            )),
        }
    }

    /// Start every store, stopping at the first bootstrap failure.
    pub async fn start_all(&self) -> Result<()> {
        self.namespaces.start().await?;
        self.topics.start().await?;
        self.acls.start().await?;
        self.connectors.start().await?;
        self.streams.start().await?;
        self.quotas.start().await?;
        info!("All stores started");
        Ok(())
    }

    /// Every store as a readiness probe.
    pub fn probes(&self) -> Vec<Arc<dyn ReadinessProbe>> {
        vec![
            Arc::clone(&self.namespaces) as Arc<dyn ReadinessProbe>,
            Arc::clone(&self.topics) as Arc<dyn ReadinessProbe>,
            Arc::clone(&self.acls) as Arc<dyn ReadinessProbe>,
            Arc::clone(&self.connectors) as Arc<dyn ReadinessProbe>,
            Arc::clone(&self.streams) as Arc<dyn ReadinessProbe>,
            Arc::clone(&self.quotas) as Arc<dyn ReadinessProbe>,
        ]
    }

    /// Gate over every store, polling at the configured cadence.
    pub fn readiness_gate(&self, config: &StoreConfig) -> ReadinessGate {
        ReadinessGate::new(self.probes(), config.readiness_poll, config.init_timeout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::InMemoryLog;

    #[tokio::test(start_paused = true)]
    async fn test_gate_opens_after_all_stores_catch_up() -> Result<()> {
        let log = InMemoryLog::new_arc();
        let transport: Arc<dyn LogTransport> = log.clone();
        let admin: Arc<dyn LogAdmin> = log.clone();
        let config = StoreConfig {
            replication_factor: 1,
            readiness_poll: Duration::from_millis(50),
            ..StoreConfig::default()
        };

        let stores = ResourceStores::open(&transport, &admin, &config);
        stores.start_all().await?;
        let gate = stores.readiness_gate(&config);
        gate.wait_until_ready().await?;

        assert!(gate.is_ready());
        assert!(stores.topics.is_ready());
        assert!(stores.quotas.is_ready());
        assert!(log.describe_log_topic("keel.access-control-entries").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_per_kind() {
        let log = InMemoryLog::new_arc();
        let transport: Arc<dyn LogTransport> = log.clone();
        let admin: Arc<dyn LogAdmin> = log;
        let stores = ResourceStores::open(&transport, &admin, &StoreConfig::default());

        let names: Vec<String> = stores.probes().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"keel.namespaces".to_string()));
        assert!(names.contains(&"keel.resource-quotas".to_string()));
    }
}
