//! Control plane wiring.
//!
//! Builds one executor of every kind per managed cluster, opens the
//! readiness gate over the stores and hands the executors to the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use keel_core::{ControlPlaneConfig, ManagedClusterConfig};
use keel_reconciler::{
    AclExecutor, ConnectListingCache, ConnectRuntime, ConnectorExecutor, ConsumerGroupService,
    Executor, ExecutorsByKind, HttpConnectRuntime, KafkaAdmin, ReconcileReport, ResourceKind,
    Scheduler, SchedulerHandle, TagCatalog, TopicExecutor, UserExecutor, synchronizer_for,
};
use keel_store::{ReadinessGate, ResourceStores};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// External systems one managed cluster is reconciled against.
#[derive(Clone)]
pub struct ClusterBackends {
    pub admin: Arc<dyn KafkaAdmin>,
    /// Connect runtimes by the name connectors refer to them with.
    pub connects: BTreeMap<String, Arc<dyn ConnectRuntime>>,
    pub tag_catalog: Option<Arc<dyn TagCatalog>>,
}

impl ClusterBackends {
    pub fn new(admin: Arc<dyn KafkaAdmin>) -> Self {
        Self {
            admin,
            connects: BTreeMap::new(),
            tag_catalog: None,
        }
    }

    /// HTTP clients for every connect runtime listed in the cluster config.
    pub fn with_http_connects(mut self, cluster: &ManagedClusterConfig) -> Result<Self> {
        self.connects.extend(HttpConnectRuntime::for_cluster(cluster)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_connect(mut self, name: impl Into<String>, runtime: Arc<dyn ConnectRuntime>) -> Self {
        self.connects.insert(name.into(), runtime);
        self
    }

    #[must_use]
    pub fn with_tag_catalog(mut self, catalog: Arc<dyn TagCatalog>) -> Self {
        self.tag_catalog = Some(catalog);
        self
    }
}

struct ClusterExecutors {
    topics: Arc<TopicExecutor>,
    acls: Arc<AclExecutor>,
    connectors: Arc<ConnectorExecutor>,
    users: Arc<UserExecutor>,
    consumer_groups: Arc<ConsumerGroupService>,
}

impl ClusterExecutors {
    fn build(
        cluster: &ManagedClusterConfig,
        stores: &ResourceStores,
        backends: ClusterBackends,
        listings: &Arc<ConnectListingCache>,
    ) -> Self {
        let mut topics = TopicExecutor::new(
            cluster.clone(),
            Arc::clone(&backends.admin),
            Arc::clone(&stores.topics),
            Arc::clone(&stores.acls),
        );
        if let Some(catalog) = backends.tag_catalog {
            topics = topics.with_tag_catalog(catalog);
        }

        Self {
            topics: Arc::new(topics),
            acls: Arc::new(AclExecutor::new(
                cluster.clone(),
                Arc::clone(&backends.admin),
                Arc::clone(&stores.namespaces),
                Arc::clone(&stores.acls),
                Arc::clone(&stores.streams),
            )),
            connectors: Arc::new(ConnectorExecutor::new(
                cluster.clone(),
                backends.connects,
                Arc::clone(&stores.connectors),
                Arc::clone(&stores.acls),
            )
            .with_listing_cache(Arc::clone(listings))),
            users: Arc::new(UserExecutor::new(
                cluster.clone(),
                synchronizer_for(cluster, Arc::clone(&backends.admin)),
                Arc::clone(&stores.namespaces),
                Arc::clone(&stores.quotas),
            )),
            consumer_groups: Arc::new(ConsumerGroupService::new(
                cluster.name.clone(),
                backends.admin,
                cluster.admin_timeout,
            )),
        }
    }

    fn executor(&self, kind: ResourceKind) -> Arc<dyn Executor> {
        match kind {
            ResourceKind::Topics => self.topics.clone(),
            ResourceKind::Acls => self.acls.clone(),
            ResourceKind::Connectors => self.connectors.clone(),
            ResourceKind::Users => self.users.clone(),
        }
    }
}

/// A running keel instance: stores, executors and their schedule.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    stores: ResourceStores,
    gate: ReadinessGate,
    clusters: BTreeMap<String, ClusterExecutors>,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl ControlPlane {
    /// Wire executors for every configured cluster.
    ///
    /// Every cluster in `config` needs an entry in `backends`.
    pub fn new(
        config: ControlPlaneConfig,
        stores: ResourceStores,
        mut backends: BTreeMap<String, ClusterBackends>,
    ) -> Result<Self> {
        config.validate()?;

        // Listings live for half a tick so the next tick always re-lists.
        let listings = Arc::new(ConnectListingCache::new(config.scheduler.interval / 2));
        let clusters = config
            .clusters
            .iter()
            .map(|cluster| {
                let cluster_backends = backends.remove(&cluster.name).ok_or_else(|| {
                    Error::MissingBackends {
                        cluster: cluster.name.clone(),
                    }
                })?;
                Ok((
                    cluster.name.clone(),
                    ClusterExecutors::build(cluster, &stores, cluster_backends, &listings),
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let gate = stores.readiness_gate(&config.store);
        let (stop, _) = watch::channel(false);
        Ok(Self {
            config,
            stores,
            gate,
            clusters,
            started: AtomicBool::new(false),
            stop,
            scheduler: Mutex::new(None),
        })
    }

    /// Start the stores, wait until they have caught up, then schedule
    /// reconciliation.
    ///
    /// A [`Self::shutdown`] while the stores are still catching up ends the
    /// wait and no reconciliation is scheduled. A plane starts only once.
    pub async fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let mut stop = self.stop.subscribe();
        let catch_up = async {
            self.stores.start_all().await?;
            self.gate.wait_until_ready().await?;
            Ok::<(), Error>(())
        };
        tokio::select! {
            result = catch_up => result?,
            _ = stop.wait_for(|stopped| *stopped) => {
                warn!("Shutdown requested before stores were ready, not scheduling");
                return Ok(());
            }
        }

        let mut scheduler = self.scheduler.lock().await;
        if *self.stop.borrow() {
            return Ok(());
        }
        *scheduler = Some(Scheduler::start(
            self.executors_by_kind(),
            self.gate.subscribe(),
            &self.config.scheduler,
        ));
        info!(clusters = self.clusters.len(), "Control plane started");
        Ok(())
    }

    /// Stop scheduled reconciliation, or a start still waiting on the stores.
    /// Stores keep serving.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
            info!("Control plane stopped");
        }
    }

    /// Converge one kind on one cluster right away.
    pub async fn run_now(&self, kind: ResourceKind, cluster: &str) -> Result<ReconcileReport> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let executor = self.cluster(cluster)?.executor(kind);
        Ok(executor.run().await?)
    }

    /// Whether the stores have caught up and reconciliation may run.
    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn stores(&self) -> &ResourceStores {
        &self.stores
    }

    pub fn topics(&self, cluster: &str) -> Result<Arc<TopicExecutor>> {
        Ok(Arc::clone(&self.cluster(cluster)?.topics))
    }

    pub fn connectors(&self, cluster: &str) -> Result<Arc<ConnectorExecutor>> {
        Ok(Arc::clone(&self.cluster(cluster)?.connectors))
    }

    pub fn users(&self, cluster: &str) -> Result<Arc<UserExecutor>> {
        Ok(Arc::clone(&self.cluster(cluster)?.users))
    }

    pub fn consumer_groups(&self, cluster: &str) -> Result<Arc<ConsumerGroupService>> {
        Ok(Arc::clone(&self.cluster(cluster)?.consumer_groups))
    }

    fn cluster(&self, name: &str) -> Result<&ClusterExecutors> {
        self.clusters
            .get(name)
            .ok_or_else(|| Error::unknown_cluster(name))
    }

    fn executors_by_kind(&self) -> ExecutorsByKind {
        ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let executors = self.clusters.values().map(|c| c.executor(kind)).collect();
                (kind, executors)
            })
            .collect()
    }
}
