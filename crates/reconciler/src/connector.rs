//! Connector executor.
//!
//! Connectors live on connect runtimes that several managed clusters may
//! share. Each distinct runtime URL is listed once per tick and the listing
//! is reused for every runtime name pointing at it. Executors of different
//! clusters share listings through a [`ConnectListingCache`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use keel_core::{AccessControlEntry, AclResourceType, Connector, ManagedClusterConfig};
use keel_store::LogBackedStore;
use moka::future::Cache;
use tracing::{debug, error, info, warn};

use crate::connect::{ConnectRuntime, ConnectorInfo, NAME_CONFIG};
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::executor::{Executor, Outcome, ReconcileReport, ResourceKind, bounded};

type Config = BTreeMap<String, String>;

fn comparable(mut config: Config) -> Config {
    config.remove(NAME_CONFIG);
    config
}

/// Connector listings by runtime URL, shared by every cluster's executor.
///
/// Concurrent lookups of one URL wait for a single listing. Entries live for
/// `max_age` or until something changes the runtime; failures are not kept.
pub struct ConnectListingCache {
    listings: Cache<String, Arc<Vec<ConnectorInfo>>>,
}

impl ConnectListingCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            listings: Cache::builder().max_capacity(1024).time_to_live(max_age).build(),
        }
    }

    /// The runtime's connectors, listed at most once per `max_age`.
    pub async fn list(
        &self,
        runtime: &Arc<dyn ConnectRuntime>,
        timeout: Duration,
    ) -> Result<Arc<Vec<ConnectorInfo>>> {
        let lister = Arc::clone(runtime);
        self.listings
            .try_get_with(runtime.url().to_string(), async move {
                bounded("list_connectors", timeout, lister.list_connectors())
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e: Arc<Error>| Error::connect(runtime.name(), e.to_string()))
    }

    /// Forget the listing of `url` after a change to that runtime.
    pub async fn invalidate(&self, url: &str) {
        self.listings.invalidate(url).await;
    }
}

/// Reconciles connectors of one cluster across its connect runtimes.
pub struct ConnectorExecutor {
    cluster: ManagedClusterConfig,
    runtimes: BTreeMap<String, Arc<dyn ConnectRuntime>>,
    connectors: Arc<LogBackedStore<Connector>>,
    acls: Arc<LogBackedStore<AccessControlEntry>>,
    listings: Option<Arc<ConnectListingCache>>,
}

impl ConnectorExecutor {
    pub fn new(
        cluster: ManagedClusterConfig,
        runtimes: BTreeMap<String, Arc<dyn ConnectRuntime>>,
        connectors: Arc<LogBackedStore<Connector>>,
        acls: Arc<LogBackedStore<AccessControlEntry>>,
    ) -> Self {
        Self {
            cluster,
            runtimes,
            connectors,
            acls,
            listings: None,
        }
    }

    /// Share runtime listings with the executors of other clusters.
    #[must_use]
    pub fn with_listing_cache(mut self, listings: Arc<ConnectListingCache>) -> Self {
        self.listings = Some(listings);
        self
    }

    pub async fn pause(&self, connector: &Connector) -> Result<()> {
        let runtime = self.runtime_of(connector)?;
        let name = &connector.metadata.name;
        bounded("pause", self.cluster.admin_timeout, runtime.pause(name)).await?;
        self.invalidate(runtime.as_ref()).await;
        info!(cluster = %self.cluster.name, connector = %name, "Connector paused");
        Ok(())
    }

    pub async fn resume(&self, connector: &Connector) -> Result<()> {
        let runtime = self.runtime_of(connector)?;
        let name = &connector.metadata.name;
        bounded("resume", self.cluster.admin_timeout, runtime.resume(name)).await?;
        self.invalidate(runtime.as_ref()).await;
        info!(cluster = %self.cluster.name, connector = %name, "Connector resumed");
        Ok(())
    }

    pub async fn restart(&self, connector: &Connector) -> Result<()> {
        let runtime = self.runtime_of(connector)?;
        let name = &connector.metadata.name;
        bounded("restart", self.cluster.admin_timeout, runtime.restart(name)).await?;
        self.invalidate(runtime.as_ref()).await;
        info!(cluster = %self.cluster.name, connector = %name, "Connector restarted");
        Ok(())
    }

    /// Remove a connector from its runtime right away.
    pub async fn delete_connector(&self, connector: &Connector) -> Result<()> {
        let runtime = self.runtime_of(connector)?;
        let name = &connector.metadata.name;
        bounded("delete", self.cluster.admin_timeout, runtime.delete(name)).await?;
        self.invalidate(runtime.as_ref()).await;
        info!(cluster = %self.cluster.name, connector = %name, "Connector deleted");
        Ok(())
    }

    async fn invalidate(&self, runtime: &dyn ConnectRuntime) {
        if let Some(listings) = &self.listings {
            listings.invalidate(runtime.url()).await;
        }
    }

    async fn list(&self, runtime: &Arc<dyn ConnectRuntime>) -> Result<Arc<Vec<ConnectorInfo>>> {
        let timeout = self.cluster.admin_timeout;
        match &self.listings {
            Some(listings) => listings.list(runtime, timeout).await,
            None => bounded("list_connectors", timeout, runtime.list_connectors())
                .await
                .map(Arc::new),
        }
    }

    fn runtime_of(&self, connector: &Connector) -> Result<&Arc<dyn ConnectRuntime>> {
        if connector.metadata.cluster != self.cluster.name {
            return Err(Error::UnknownCluster {
                cluster: connector.metadata.cluster.clone(),
            });
        }
        self.runtimes
            .get(&connector.spec.connect_cluster)
            .ok_or_else(|| Error::not_found("connect runtime", &connector.spec.connect_cluster))
    }

    /// Connector listings per runtime name. Runtimes sharing a URL are
    /// listed once; a runtime that cannot be listed is left out.
    async fn collect_actual(&self) -> BTreeMap<String, Arc<Vec<ConnectorInfo>>> {
        let by_url = self
            .runtimes
            .iter()
            .map(|(name, runtime)| (runtime.url(), name))
            .into_group_map();

        let mut actual = BTreeMap::new();
        for (url, names) in by_url {
            let Some(runtime) = names.first().and_then(|n| self.runtimes.get(*n)) else {
                continue;
            };
            match self.list(runtime).await {
                Ok(listing) => {
                    for name in names {
                        actual.insert(name.clone(), Arc::clone(&listing));
                    }
                }
                Err(e) => warn!(
                    cluster = %self.cluster.name,
                    url,
                    error = %e,
                    "Could not list connectors, skipping runtime this tick"
                ),
            }
        }
        actual
    }

    async fn apply(&self, runtime: &dyn ConnectRuntime, name: &str, outcome: Outcome, config: Option<&Config>) -> bool {
        let timeout = self.cluster.admin_timeout;
        let result = match (outcome, config) {
            (Outcome::Deleted, _) | (_, None) => {
                bounded("delete", timeout, runtime.delete(name)).await
            }
            (Outcome::Created | Outcome::Updated, Some(config)) => {
                bounded("put_config", timeout, runtime.put_config(name, config)).await
            }
        };

        match result {
            Ok(()) => {
                info!(
                    cluster = %self.cluster.name,
                    runtime = runtime.name(),
                    connector = name,
                    action = ?outcome,
                    "Connector applied"
                );
                true
            }
            Err(e) => {
                error!(
                    cluster = %self.cluster.name,
                    runtime = runtime.name(),
                    connector = name,
                    action = ?outcome,
                    error = %e,
                    "Failed to apply connector"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Executor for ConnectorExecutor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Connectors
    }

    fn cluster(&self) -> &str {
        &self.cluster.name
    }

    async fn run(&self) -> Result<ReconcileReport> {
        if !self.cluster.manage_connectors {
            debug!(cluster = %self.cluster.name, "Connector management disabled");
            return Ok(ReconcileReport::skipped());
        }

        let mut desired: BTreeMap<String, BTreeMap<String, Config>> = BTreeMap::new();
        for connector in self.connectors.list_for_cluster(&self.cluster.name).await {
            if !self.runtimes.contains_key(&connector.spec.connect_cluster) {
                warn!(
                    cluster = %self.cluster.name,
                    connector = %connector.metadata.name,
                    runtime = %connector.spec.connect_cluster,
                    "Connector targets an unknown connect runtime"
                );
                continue;
            }
            desired
                .entry(connector.spec.connect_cluster.clone())
                .or_default()
                .insert(connector.metadata.name, comparable(connector.spec.config));
        }

        let desired_anywhere: BTreeSet<String> =
            desired.values().flat_map(|c| c.keys().cloned()).collect();
        let actual = self.collect_actual().await;
        let grants = self.acls.list_for_cluster(&self.cluster.name).await;
        let mut report = ReconcileReport::default();
        let mut handled = BTreeSet::new();

        for (runtime_name, runtime) in &self.runtimes {
            let Some(listing) = actual.get(runtime_name) else {
                continue;
            };
            let wanted = desired.remove(runtime_name).unwrap_or_default();
            let current: BTreeMap<String, Config> = listing
                .iter()
                .map(|c| (c.name.clone(), comparable(c.config.clone())))
                .collect();

            let diff = Diff::compute(wanted, current, |a, b| a == b);

            for (name, config) in &diff.to_create {
                let ok = self.apply(runtime.as_ref(), name, Outcome::Created, Some(config)).await;
                report.record(Outcome::Created, ok);
            }
            for (name, update) in &diff.to_update {
                let ok = self
                    .apply(runtime.as_ref(), name, Outcome::Updated, Some(&update.desired))
                    .await;
                report.record(Outcome::Updated, ok);
            }

            let mut unsynced: Vec<&String> = diff
                .to_delete
                .keys()
                .filter(|name| !desired_anywhere.contains(*name))
                .filter(|name| {
                    grants
                        .iter()
                        .any(|g| g.owns(&g.spec.granted_to, AclResourceType::Connect, name))
                })
                .collect();
            // Aliases of one deployment report the same leftovers.
            unsynced.retain(|name| handled.insert((runtime.url().to_string(), (*name).clone())));
            let mut changed = !diff.to_create.is_empty() || !diff.to_update.is_empty();
            if self.cluster.drop_unsynced_connectors {
                changed |= !unsynced.is_empty();
                for name in unsynced {
                    let ok = self.apply(runtime.as_ref(), name, Outcome::Deleted, None).await;
                    report.record(Outcome::Deleted, ok);
                }
            } else {
                report.unsynced = report.unsynced.saturating_add(unsynced.len());
            }
            if changed {
                self.invalidate(runtime.as_ref()).await;
            }
        }

        report.log(self.kind(), &self.cluster.name);
        Ok(report)
    }
}
