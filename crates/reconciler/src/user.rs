//! Namespace users: byte-rate quotas and password resets.
//!
//! What can be done to users depends on who operates the cluster, so the
//! work goes through a [`UserSynchronizer`] chosen from the provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{
    ClusterProvider, ManagedClusterConfig, Namespace, ResourceQuota, CONSUMER_BYTE_RATE,
    DEFAULT_BYTE_RATE, PRODUCER_BYTE_RATE,
};
use keel_store::LogBackedStore;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, error, info, warn};

use crate::broker::{
    KafkaAdmin, ScramCredential, ScramMechanism, UserQuotas, CONSUMER_BYTE_RATE_QUOTA,
    PRODUCER_BYTE_RATE_QUOTA,
};
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::executor::{Executor, Outcome, ReconcileReport, ResourceKind, bounded};

const PASSWORD_LENGTH: usize = 32;
const SCRAM_ITERATIONS: i32 = 4096;

type Quotas = BTreeMap<String, f64>;

/// User operations a provider may or may not offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Quotas,
    PasswordReset,
}

/// Provider-specific access to broker users.
#[async_trait]
pub trait UserSynchronizer: Send + Sync {
    fn supports(&self, capability: Capability) -> bool;

    /// Quotas currently set, by user.
    async fn list_quotas(&self) -> Result<UserQuotas>;

    async fn apply_quotas(&self, user: &str, quotas: &Quotas) -> Result<()>;

    /// Replace the user's credential with `password`.
    async fn set_password(&self, user: &str, password: &str) -> Result<()>;
}

/// Users managed through SCRAM credentials and client quotas.
pub struct ScramUserSynchronizer {
    admin: Arc<dyn KafkaAdmin>,
    timeout: Duration,
}

impl ScramUserSynchronizer {
    pub fn new(admin: Arc<dyn KafkaAdmin>, timeout: Duration) -> Self {
        Self { admin, timeout }
    }
}

#[async_trait]
impl UserSynchronizer for ScramUserSynchronizer {
    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    async fn list_quotas(&self) -> Result<UserQuotas> {
        bounded("describe_user_quotas", self.timeout, self.admin.describe_user_quotas()).await
    }

    async fn apply_quotas(&self, user: &str, quotas: &Quotas) -> Result<()> {
        bounded(
            "alter_user_quotas",
            self.timeout,
            self.admin.alter_user_quotas(user, quotas),
        )
        .await
    }

    async fn set_password(&self, user: &str, password: &str) -> Result<()> {
        let credential = ScramCredential {
            user: user.to_string(),
            mechanism: ScramMechanism::ScramSha512,
            iterations: SCRAM_ITERATIONS,
            password: password.to_string(),
        };
        bounded(
            "upsert_scram_credentials",
            self.timeout,
            self.admin.upsert_scram_credentials(&credential),
        )
        .await
    }
}

/// Providers that expose no user management.
pub struct UnsupportedUserSynchronizer {
    provider: ClusterProvider,
}

impl UnsupportedUserSynchronizer {
    pub const fn new(provider: ClusterProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl UserSynchronizer for UnsupportedUserSynchronizer {
    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    async fn list_quotas(&self) -> Result<UserQuotas> {
        Err(Error::unsupported("list_quotas", self.provider.to_string()))
    }

    async fn apply_quotas(&self, _user: &str, _quotas: &Quotas) -> Result<()> {
        Err(Error::unsupported("apply_quotas", self.provider.to_string()))
    }

    async fn set_password(&self, _user: &str, _password: &str) -> Result<()> {
        Err(Error::unsupported("reset_password", self.provider.to_string()))
    }
}

/// Pick the synchronizer matching the cluster's provider.
pub fn synchronizer_for(
    cluster: &ManagedClusterConfig,
    admin: Arc<dyn KafkaAdmin>,
) -> Arc<dyn UserSynchronizer> {
    match cluster.provider {
        ClusterProvider::SelfManaged => {
            Arc::new(ScramUserSynchronizer::new(admin, cluster.admin_timeout))
        }
        provider @ (ClusterProvider::ConfluentCloud | ClusterProvider::Unsupported) => {
            Arc::new(UnsupportedUserSynchronizer::new(provider))
        }
    }
}

/// Only the byte rates are ours; other quotas on the user are left alone.
fn managed_quotas(quotas: Quotas) -> Quotas {
    quotas
        .into_iter()
        .filter(|(key, _)| key == PRODUCER_BYTE_RATE_QUOTA || key == CONSUMER_BYTE_RATE_QUOTA)
        .collect()
}

fn same_quotas(a: &Quotas, b: &Quotas) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|((ka, va), (kb, vb))| ka == kb && (va - vb).abs() < f64::EPSILON)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Reconciles per-user quotas of one cluster and resets passwords on demand.
pub struct UserExecutor {
    cluster: ManagedClusterConfig,
    synchronizer: Arc<dyn UserSynchronizer>,
    namespaces: Arc<LogBackedStore<Namespace>>,
    quotas: Arc<LogBackedStore<ResourceQuota>>,
}

impl UserExecutor {
    pub fn new(
        cluster: ManagedClusterConfig,
        synchronizer: Arc<dyn UserSynchronizer>,
        namespaces: Arc<LogBackedStore<Namespace>>,
        quotas: Arc<LogBackedStore<ResourceQuota>>,
    ) -> Self {
        Self {
            cluster,
            synchronizer,
            namespaces,
            quotas,
        }
    }

    /// Give the namespace user a fresh random password and return it.
    ///
    /// The password is not stored anywhere; this is the only time it is seen.
    pub async fn reset_password(&self, namespace: &str) -> Result<String> {
        if !self.synchronizer.supports(Capability::PasswordReset) {
            return Err(Error::unsupported(
                "reset_password",
                self.cluster.provider.to_string(),
            ));
        }
        let key = format!("{}/{namespace}", self.cluster.name);
        let namespace = self
            .namespaces
            .find_by_key(&key)
            .await
            .ok_or_else(|| Error::not_found("namespace", key))?;

        let password = generate_password();
        self.synchronizer
            .set_password(&namespace.spec.kafka_user, &password)
            .await?;
        info!(
            cluster = %self.cluster.name,
            namespace = %namespace.metadata.name,
            user = %namespace.spec.kafka_user,
            "Password reset"
        );
        Ok(password)
    }

    /// Declared quotas per namespace user, defaulting unset rates.
    async fn collect_desired(&self) -> BTreeMap<String, Quotas> {
        let declared: BTreeMap<String, ResourceQuota> = self
            .quotas
            .list_for_cluster(&self.cluster.name)
            .await
            .into_iter()
            .map(|q| (q.metadata.namespace.clone(), q))
            .collect();

        self.namespaces
            .list_for_cluster(&self.cluster.name)
            .await
            .into_iter()
            .map(|ns| {
                let quota = declared.get(&ns.metadata.name);
                let rate = |key: &str| quota.and_then(|q| q.byte_rate(key)).unwrap_or(DEFAULT_BYTE_RATE);
                let quotas = BTreeMap::from([
                    (PRODUCER_BYTE_RATE_QUOTA.to_string(), rate(PRODUCER_BYTE_RATE)),
                    (CONSUMER_BYTE_RATE_QUOTA.to_string(), rate(CONSUMER_BYTE_RATE)),
                ]);
                (ns.spec.kafka_user, quotas)
            })
            .collect()
    }

    async fn apply(&self, user: &str, quotas: &Quotas, outcome: Outcome) -> bool {
        match self.synchronizer.apply_quotas(user, quotas).await {
            Ok(()) => {
                info!(cluster = %self.cluster.name, user, quotas = ?quotas, action = ?outcome, "Quotas applied");
                true
            }
            Err(e) => {
                error!(cluster = %self.cluster.name, user, error = %e, "Failed to apply quotas");
                false
            }
        }
    }
}

#[async_trait]
impl Executor for UserExecutor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Users
    }

    fn cluster(&self) -> &str {
        &self.cluster.name
    }

    async fn run(&self) -> Result<ReconcileReport> {
        if !self.cluster.manage_users || !self.synchronizer.supports(Capability::Quotas) {
            debug!(cluster = %self.cluster.name, provider = %self.cluster.provider, "User management disabled");
            return Ok(ReconcileReport::skipped());
        }

        let desired = self.collect_desired().await;
        let actual: BTreeMap<String, Quotas> = match self.synchronizer.list_quotas().await {
            Ok(all) => all
                .into_iter()
                .filter(|(user, _)| desired.contains_key(user))
                .map(|(user, quotas)| (user, managed_quotas(quotas)))
                .filter(|(_, quotas)| !quotas.is_empty())
                .collect(),
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "Could not collect quotas, skipping tick");
                return Err(e);
            }
        };

        // Users are never removed; to_delete is always empty here.
        let diff = Diff::compute(desired, actual, same_quotas);
        let mut report = ReconcileReport::default();

        for (user, quotas) in &diff.to_create {
            let ok = self.apply(user, quotas, Outcome::Created).await;
            report.record(Outcome::Created, ok);
        }
        for (user, update) in &diff.to_update {
            let ok = self.apply(user, &update.desired, Outcome::Updated).await;
            report.record(Outcome::Updated, ok);
        }

        report.log(self.kind(), &self.cluster.name);
        Ok(report)
    }
}
