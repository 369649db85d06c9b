//! Control plane configuration.
//!
//! Loaded from TOML (or JSON, chosen by file extension). Every field has a
//! default so a minimal file only needs to list the managed clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub clusters: Vec<ManagedClusterConfig>,
}

impl ControlPlaneConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config_parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::config_read(path, e.to_string()))?;

        if path.extension().is_some_and(|e| e == "json") {
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| Error::config_parse(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Look up a managed cluster by name.
    pub fn cluster(&self, name: &str) -> Option<&ManagedClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Reject configurations the control plane cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.scheduler.validate()?;

        let mut seen = BTreeSet::new();
        for cluster in &self.clusters {
            cluster.validate()?;
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate cluster name '{}'",
                    cluster.name
                )));
            }
        }
        Ok(())
    }
}

/// Settings for the log-backed stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix of every store topic, e.g. `keel.topics`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Desired replication factor of store topics, clamped to the live broker count.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i16,

    /// Bound on waiting for the broker to acknowledge a write.
    #[serde(rename = "write_timeout_ms", with = "duration_ms", default = "default_write_timeout")]
    pub write_timeout: Duration,

    /// Bound on waiting for the local replica to observe a write.
    #[serde(rename = "sync_timeout_ms", with = "duration_ms", default = "default_sync_timeout")]
    pub sync_timeout: Duration,

    /// Bound on a single catch-up attempt at startup.
    #[serde(rename = "init_timeout_ms", with = "duration_ms", default = "default_init_timeout")]
    pub init_timeout: Duration,

    /// How often the readiness gate polls the stores.
    #[serde(rename = "readiness_poll_ms", with = "duration_ms", default = "default_readiness_poll")]
    pub readiness_poll: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            replication_factor: default_replication_factor(),
            write_timeout: default_write_timeout(),
            sync_timeout: default_sync_timeout(),
            init_timeout: default_init_timeout(),
            readiness_poll: default_readiness_poll(),
        }
    }
}

impl StoreConfig {
    /// Full name of the store topic for a kind suffix.
    pub fn topic_for(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.topic_prefix)
    }

    fn validate(&self) -> Result<()> {
        if self.topic_prefix.trim().is_empty() {
            return Err(Error::invalid_config("store.topic_prefix must not be empty"));
        }
        if self.replication_factor < 1 {
            return Err(Error::invalid_config(
                "store.replication_factor must be at least 1",
            ));
        }
        for (name, value) in [
            ("store.write_timeout_ms", self.write_timeout),
            ("store.sync_timeout_ms", self.sync_timeout),
            ("store.init_timeout_ms", self.init_timeout),
            ("store.readiness_poll_ms", self.readiness_poll),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Settings for the reconciliation scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "interval_ms", with = "duration_ms", default = "default_interval")]
    pub interval: Duration,

    #[serde(rename = "initial_delay_ms", with = "duration_ms", default = "default_initial_delay")]
    pub initial_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            initial_delay: default_initial_delay(),
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::invalid_config("scheduler.interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Who operates a managed cluster; decides which admin capabilities exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterProvider {
    #[default]
    SelfManaged,
    ConfluentCloud,
    Unsupported,
}

impl fmt::Display for ClusterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfManaged => write!(f, "self-managed"),
            Self::ConfluentCloud => write!(f, "confluent-cloud"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// One broker deployment under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedClusterConfig {
    pub name: String,

    #[serde(default)]
    pub provider: ClusterProvider,

    #[serde(default = "enabled")]
    pub manage_topics: bool,
    #[serde(default = "enabled")]
    pub manage_acls: bool,
    #[serde(default = "enabled")]
    pub manage_users: bool,
    #[serde(default = "enabled")]
    pub manage_connectors: bool,

    #[serde(default)]
    pub drop_unsynced_acls: bool,
    #[serde(default)]
    pub drop_unsynced_topics: bool,
    #[serde(default)]
    pub drop_unsynced_connectors: bool,

    /// Bound on every admin call issued against this cluster.
    #[serde(rename = "admin_timeout_ms", with = "duration_ms", default = "default_admin_timeout")]
    pub admin_timeout: Duration,

    /// Connect runtimes reachable from this cluster, by name.
    #[serde(default)]
    pub connects: BTreeMap<String, ConnectRuntimeConfig>,
}

impl ManagedClusterConfig {
    /// A cluster with every kind managed and nothing dropped.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: ClusterProvider::default(),
            manage_topics: true,
            manage_acls: true,
            manage_users: true,
            manage_connectors: true,
            drop_unsynced_acls: false,
            drop_unsynced_topics: false,
            drop_unsynced_connectors: false,
            admin_timeout: default_admin_timeout(),
            connects: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn provider(mut self, provider: ClusterProvider) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub const fn drop_unsynced(mut self, acls: bool, topics: bool, connectors: bool) -> Self {
        self.drop_unsynced_acls = acls;
        self.drop_unsynced_topics = topics;
        self.drop_unsynced_connectors = connectors;
        self
    }

    #[must_use]
    pub fn connect(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.connects.insert(
            name.into(),
            ConnectRuntimeConfig {
                url: url.into(),
                username: None,
                password: None,
            },
        );
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("cluster name must not be empty"));
        }
        if self.admin_timeout.is_zero() {
            return Err(Error::invalid_config(format!(
                "cluster '{}': admin_timeout_ms must be positive",
                self.name
            )));
        }
        for (name, connect) in &self.connects {
            if connect.url.trim().is_empty() {
                return Err(Error::invalid_config(format!(
                    "cluster '{}': connect runtime '{name}' has no url",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Location and credentials of a connect runtime REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRuntimeConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_topic_prefix() -> String {
    "keel".to_string()
}

const fn default_replication_factor() -> i16 {
    3
}

const fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_sync_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_init_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_readiness_poll() -> Duration {
    Duration::from_secs(1)
}

const fn default_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_admin_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn enabled() -> bool {
    true
}

/// Serialization helper for Duration as milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
