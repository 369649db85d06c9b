//! Connect runtime client.
//!
//! A connect runtime hosts connector workloads behind a REST API. Several
//! managed clusters may share one runtime, so callers list a runtime once
//! per URL and filter the result themselves.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{ConnectRuntimeConfig, ManagedClusterConfig};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Config key carrying the connector name, ignored when comparing configs.
pub const NAME_CONFIG: &str = "name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Running,
    Paused,
    Failed,
    Unassigned,
    Restarting,
    Unknown,
}

impl FromStr for ConnectorState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "RUNNING" => Self::Running,
            "PAUSED" => Self::Paused,
            "FAILED" => Self::Failed,
            "UNASSIGNED" => Self::Unassigned,
            "RESTARTING" => Self::Restarting,
            _ => Self::Unknown,
        })
    }
}

/// A connector as reported by its runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub name: String,
    pub config: BTreeMap<String, String>,
    pub state: ConnectorState,
}

/// REST-managed host of connector workloads.
#[async_trait]
pub trait ConnectRuntime: Send + Sync {
    /// Runtime name as configured on the cluster.
    fn name(&self) -> &str;

    /// Base URL; runtimes with the same URL are the same deployment.
    fn url(&self) -> &str;

    /// Every connector deployed on the runtime with its config and state.
    async fn list_connectors(&self) -> Result<Vec<ConnectorInfo>>;

    /// Create or replace a connector config.
    async fn put_config(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn resume(&self, name: &str) -> Result<()>;

    /// Restart the connector and all of its tasks.
    async fn restart(&self, name: &str) -> Result<()>;
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExpandedConnector {
    info: ExpandedInfo,
    #[serde(default)]
    status: Option<ExpandedStatus>,
}

#[derive(Debug, Deserialize)]
struct ExpandedInfo {
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ExpandedStatus {
    connector: ConnectorStatus,
}

#[derive(Debug, Deserialize)]
struct ConnectorStatus {
    state: String,
}

/// [`ConnectRuntime`] speaking the connect REST API.
#[derive(Debug, Clone)]
pub struct HttpConnectRuntime {
    name: String,
    base: Url,
    username: Option<String>,
    password: Option<String>,
    http_client: reqwest::Client,
}

impl HttpConnectRuntime {
    pub fn new(name: impl Into<String>, config: &ConnectRuntimeConfig, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let base = Url::parse(&config.url)
            .map_err(|e| Error::connect(&name, format!("invalid url '{}': {e}", config.url)))?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::connect(&name, e.to_string()))?;

        Ok(Self {
            name,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            http_client,
        })
    }

    /// One client per connect runtime configured on `cluster`.
    pub fn for_cluster(
        cluster: &ManagedClusterConfig,
    ) -> Result<BTreeMap<String, Arc<dyn ConnectRuntime>>> {
        cluster
            .connects
            .iter()
            .map(|(name, config)| {
                let runtime: Arc<dyn ConnectRuntime> =
                    Arc::new(Self::new(name, config, cluster.admin_timeout)?);
                Ok((name.clone(), runtime))
            })
            .collect()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::connect(&self.name, "base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::connect(&self.name, format!("{operation}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::connect(
            &self.name,
            format!("{operation}: HTTP {status}: {body}"),
        ))
    }

    async fn connector_action(&self, operation: &str, method: Method, name: &str, action: &str) -> Result<()> {
        let url = self.endpoint(&["connectors", name, action])?;
        debug!(runtime = %self.name, connector = name, operation, "Connect request");
        self.send(operation, self.request(method, url)).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectRuntime for HttpConnectRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        self.base.as_str()
    }

    async fn list_connectors(&self) -> Result<Vec<ConnectorInfo>> {
        let url = self.endpoint(&["connectors"])?;
        let request = self
            .request(Method::GET, url)
            .query(&[("expand", "info"), ("expand", "status")]);
        let listing: BTreeMap<String, ExpandedConnector> = self
            .send("list_connectors", request)
            .await?
            .json()
            .await
            .map_err(|e| Error::connect(&self.name, format!("invalid connector listing: {e}")))?;

        Ok(listing
            .into_iter()
            .map(|(name, expanded)| ConnectorInfo {
                name,
                config: expanded.info.config,
                state: expanded
                    .status
                    .and_then(|s| s.connector.state.parse().ok())
                    .unwrap_or(ConnectorState::Unknown),
            })
            .collect())
    }

    async fn put_config(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        let url = self.endpoint(&["connectors", name, "config"])?;
        self.send("put_config", self.request(Method::PUT, url).json(config))
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&["connectors", name])?;
        self.send("delete", self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.connector_action("pause", Method::PUT, name, "pause").await
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.connector_action("resume", Method::PUT, name, "resume").await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&["connectors", name, "restart"])?;
        let request = self
            .request(Method::POST, url)
            .query(&[("includeTasks", "true"), ("onlyFailed", "false")]);
        self.send("restart", request).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// A change applied to an in-memory connect runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMutation {
    Put(String),
    Delete(String),
    Pause(String),
    Resume(String),
    Restart(String),
}

/// In-memory [`ConnectRuntime`] with a change journal and failure injection.
#[derive(Clone)]
pub struct InMemoryConnectRuntime {
    name: String,
    url: String,
    connectors: Arc<Mutex<BTreeMap<String, ConnectorInfo>>>,
    journal: Arc<Mutex<Vec<ConnectMutation>>>,
    list_calls: Arc<AtomicUsize>,
    failing_connectors: Arc<Mutex<HashSet<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryConnectRuntime {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            connectors: Arc::default(),
            journal: Arc::default(),
            list_calls: Arc::default(),
            failing_connectors: Arc::default(),
            unavailable: Arc::default(),
        }
    }

    pub fn new_arc(name: impl Into<String>, url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name, url))
    }

    /// Another handle on the same deployment under a different runtime name.
    pub fn alias(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Deploy a connector without journaling it.
    pub async fn add(&self, name: &str, config: BTreeMap<String, String>, state: ConnectorState) {
        let mut config = config;
        config.insert(NAME_CONFIG.to_string(), name.to_string());
        self.connectors.lock().await.insert(
            name.to_string(),
            ConnectorInfo {
                name: name.to_string(),
                config,
                state,
            },
        );
    }

    pub async fn connector(&self, name: &str) -> Option<ConnectorInfo> {
        self.connectors.lock().await.get(name).cloned()
    }

    pub async fn journal(&self) -> Vec<ConnectMutation> {
        self.journal.lock().await.clone()
    }

    /// Number of `list_connectors` calls served.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make every call fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every mutation of `name` fail.
    pub async fn fail_connector(&self, name: &str) {
        self.failing_connectors.lock().await.insert(name.to_string());
    }

    async fn check(&self, operation: &str, connector: Option<&str>) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::connect(&self.name, format!("{operation}: runtime unavailable")));
        }
        if let Some(name) = connector {
            if self.failing_connectors.lock().await.contains(name) {
                return Err(Error::connect(
                    &self.name,
                    format!("{operation}: injected failure for '{name}'"),
                ));
            }
        }
        Ok(())
    }

    async fn set_state(&self, operation: &str, name: &str, state: ConnectorState) -> Result<()> {
        self.check(operation, Some(name)).await?;
        let mut connectors = self.connectors.lock().await;
        let connector = connectors
            .get_mut(name)
            .ok_or_else(|| Error::not_found("connector", name))?;
        connector.state = state;
        Ok(())
    }
}

#[async_trait]
impl ConnectRuntime for InMemoryConnectRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn list_connectors(&self) -> Result<Vec<ConnectorInfo>> {
        self.check("list_connectors", None).await?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.connectors.lock().await.values().cloned().collect())
    }

    async fn put_config(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        self.check("put_config", Some(name)).await?;
        let mut config = config.clone();
        config.insert(NAME_CONFIG.to_string(), name.to_string());
        self.connectors
            .lock()
            .await
            .entry(name.to_string())
            .and_modify(|c| c.config.clone_from(&config))
            .or_insert_with(|| ConnectorInfo {
                name: name.to_string(),
                config: config.clone(),
                state: ConnectorState::Running,
            });
        self.journal.lock().await.push(ConnectMutation::Put(name.to_string()));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.check("delete", Some(name)).await?;
        if self.connectors.lock().await.remove(name).is_none() {
            return Err(Error::not_found("connector", name));
        }
        self.journal.lock().await.push(ConnectMutation::Delete(name.to_string()));
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.set_state("pause", name, ConnectorState::Paused).await?;
        self.journal.lock().await.push(ConnectMutation::Pause(name.to_string()));
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<()> {
        self.set_state("resume", name, ConnectorState::Running).await?;
        self.journal.lock().await.push(ConnectMutation::Resume(name.to_string()));
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.set_state("restart", name, ConnectorState::Running).await?;
        self.journal.lock().await.push(ConnectMutation::Restart(name.to_string()));
        Ok(())
    }
}
