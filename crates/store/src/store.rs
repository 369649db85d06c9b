//! Log-backed store: a consistent, queryable view of one resource kind.
//!
//! The compacted topic is the source of truth. A dedicated task replays it
//! into a [`Replica`]; writers append and then wait until that task has
//! observed their offset, which gives read-your-writes within the process.
//!
//! Lifecycle: `Uninitialized --start()--> CatchingUp --poll_ready()--> Ready`.
//! The transition to `Ready` happens exactly once.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{NOOP_KEY, Resource, StoreConfig};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::log::{CleanupPolicy, LogAdmin, LogReader, LogTopicSpec, LogTransport};
use crate::readiness::{Progress, ReadinessProbe};
use crate::replica::{Replica, UNKNOWN_OFFSET};

const CONSUMER_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Readiness state of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Uninitialized,
    CatchingUp,
    Ready,
}

impl Readiness {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::CatchingUp => 1,
            Self::Ready => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::CatchingUp,
            _ => Self::Ready,
        }
    }
}

/// Materialized view of one resource kind backed by a compacted topic.
pub struct LogBackedStore<T: Resource> {
    topic: String,
    transport: Arc<dyn LogTransport>,
    admin: Arc<dyn LogAdmin>,
    config: StoreConfig,
    replica: Arc<RwLock<Replica<T>>>,
    observed_tx: Arc<watch::Sender<i64>>,
    observed_rx: watch::Receiver<i64>,
    last_written: AtomicI64,
    readiness: AtomicU8,
    writer: Mutex<()>,
    consumer: OnceLock<AbortHandle>,
}

impl<T: Resource> LogBackedStore<T> {
    /// Store for `T` on the topic `<prefix>.<suffix>`.
    pub fn open(
        transport: Arc<dyn LogTransport>,
        admin: Arc<dyn LogAdmin>,
        config: &StoreConfig,
    ) -> Self {
        Self::new(config.topic_for(T::LOG_SUFFIX), transport, admin, config)
    }

    /// Store for `T` on an explicit topic.
    pub fn new(
        topic: impl Into<String>,
        transport: Arc<dyn LogTransport>,
        admin: Arc<dyn LogAdmin>,
        config: &StoreConfig,
    ) -> Self {
        let (observed_tx, observed_rx) = watch::channel(UNKNOWN_OFFSET);
        Self {
            topic: topic.into(),
            transport,
            admin,
            config: config.clone(),
            replica: Arc::new(RwLock::new(Replica::new())),
            observed_tx: Arc::new(observed_tx),
            observed_rx,
            last_written: AtomicI64::new(UNKNOWN_OFFSET),
            readiness: AtomicU8::new(Readiness::Uninitialized.as_u8()),
            writer: Mutex::new(()),
            consumer: OnceLock::new(),
        }
    }

    /// Name of the backing topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::from_u8(self.readiness.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// Highest offset applied to the local replica.
    pub fn last_observed_offset(&self) -> i64 {
        *self.observed_rx.borrow()
    }

    /// Offset of the last acknowledged write or probe, or `-1` if unknown.
    pub fn last_written_offset(&self) -> i64 {
        self.last_written.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            observed: self.last_observed_offset(),
            target: self.last_written_offset(),
        }
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Provision or validate the topic, start replaying it and probe its tail.
    ///
    /// Fails on configuration problems with the topic. A failed tail probe is
    /// not fatal: [`Self::poll_ready`] probes again.
    pub async fn start(&self) -> Result<()> {
        if self.readiness() != Readiness::Uninitialized {
            debug!(topic = %self.topic, "Store already started");
            return Ok(());
        }

        self.ensure_topic().await?;

        let reader = self.transport.open_reader(&self.topic).await?;
        let handle = tokio::spawn(consume(
            reader,
            Arc::clone(&self.replica),
            Arc::clone(&self.observed_tx),
            self.topic.clone(),
        ));
        if self.consumer.set(handle.abort_handle()).is_err() {
            handle.abort();
            return Err(Error::transport("start", "store consumer already running"));
        }
        self.readiness
            .store(Readiness::CatchingUp.as_u8(), Ordering::SeqCst);
        info!(topic = %self.topic, "Store replay started");

        let _writer = self.writer.lock().await;
        if let Err(e) = self.append_acknowledged(NOOP_KEY, None).await {
            warn!(topic = %self.topic, error = %e, "Tail probe failed, will retry");
        }
        Ok(())
    }

    async fn ensure_topic(&self) -> Result<()> {
        match self.admin.describe_log_topic(&self.topic).await? {
            Some(description) => {
                if description.partitions != 1 {
                    return Err(Error::invalid_log_topic(
                        &self.topic,
                        format!(
                            "expected exactly 1 partition, found {}",
                            description.partitions
                        ),
                    ));
                }
                if description.cleanup_policy != CleanupPolicy::Compact {
                    return Err(Error::invalid_log_topic(
                        &self.topic,
                        format!(
                            "cleanup.policy must be 'compact', found '{}'",
                            description.cleanup_policy
                        ),
                    ));
                }
                debug!(topic = %self.topic, "Store topic validated");
                Ok(())
            }
            None => {
                let brokers = self.admin.live_broker_count().await?;
                let available = i16::try_from(brokers).unwrap_or(i16::MAX);
                if available < 1 {
                    return Err(Error::transport(
                        "create_topic",
                        format!("no live brokers to host '{}'", self.topic),
                    ));
                }

                let desired = self.config.replication_factor;
                let replication = desired.min(available);
                if replication < desired {
                    warn!(
                        topic = %self.topic,
                        desired,
                        replication,
                        "Clamping store topic replication factor to live broker count"
                    );
                }

                self.admin
                    .create_log_topic(&LogTopicSpec::compacted(&self.topic, replication))
                    .await?;
                info!(topic = %self.topic, replication, "Created store topic");
                Ok(())
            }
        }
    }

    /// Make one bounded attempt to catch up to the probed tail.
    ///
    /// Returns `Ok(false)` while still catching up. Marking the store ready a
    /// second time is an invariant violation and fails with `AlreadyReady`.
    pub async fn poll_ready(&self, timeout: Duration) -> Result<bool> {
        match self.readiness() {
            Readiness::Ready => return Ok(true),
            Readiness::Uninitialized => {
                return Err(Error::NotStarted {
                    topic: self.topic.clone(),
                });
            }
            Readiness::CatchingUp => {}
        }

        let target = match self.probe_target().await {
            Ok(target) => target,
            Err(e) if e.is_ambiguous() => return Ok(false),
            Err(e) => return Err(e),
        };

        match self.wait_for_offset(target, timeout).await {
            Ok(()) => {
                self.mark_ready()?;
                info!(topic = %self.topic, offset = target, "Store caught up");
                Ok(true)
            }
            Err(e) if e.is_ambiguous() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn mark_ready(&self) -> Result<()> {
        self.readiness
            .compare_exchange(
                Readiness::CatchingUp.as_u8(),
                Readiness::Ready.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| {
                error!(topic = %self.topic, "Store marked ready twice");
                Error::already_ready(&self.topic)
            })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Upsert `value` under `key` and wait until this replica reflects it.
    pub async fn create(&self, key: &str, value: T) -> Result<T> {
        check_key(key)?;
        let payload = serde_json::to_vec(&value)?;
        self.append_and_sync(key, Some(payload)).await?;
        Ok(value)
    }

    /// Write a tombstone for `key` and wait until this replica reflects it.
    pub async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.append_and_sync(key, None).await?;
        Ok(())
    }

    /// Wait until the replica has caught up to the last known tail.
    ///
    /// When the last written offset is unknown, a fresh `NOOP` probe
    /// establishes it first.
    pub async fn sync(&self) -> Result<i64> {
        self.ensure_started()?;
        let target = self.probe_target().await?;
        self.wait_for_offset(target, self.config.sync_timeout).await?;
        Ok(target)
    }

    async fn append_and_sync(&self, key: &str, value: Option<Vec<u8>>) -> Result<i64> {
        self.ensure_started()?;
        let _writer = self.writer.lock().await;
        let offset = self.append_acknowledged(key, value).await?;
        self.wait_for_offset(offset, self.config.sync_timeout).await?;
        debug!(topic = %self.topic, key, offset, "Write observed");
        Ok(offset)
    }

    async fn probe_target(&self) -> Result<i64> {
        let _writer = self.writer.lock().await;
        match self.last_written_offset() {
            UNKNOWN_OFFSET => self.append_acknowledged(NOOP_KEY, None).await,
            known => Ok(known),
        }
    }

    /// Append and record the acknowledged offset. Caller holds `writer`.
    async fn append_acknowledged(&self, key: &str, value: Option<Vec<u8>>) -> Result<i64> {
        let append = self.transport.append(&self.topic, key, value);
        match tokio::time::timeout(self.config.write_timeout, append).await {
            Ok(Ok(offset)) => {
                self.last_written.store(offset, Ordering::SeqCst);
                Ok(offset)
            }
            Ok(Err(e)) => {
                self.forget_last_written();
                Err(e)
            }
            Err(_) => {
                self.forget_last_written();
                warn!(topic = %self.topic, key, "Write not acknowledged in time");
                Err(Error::WriteTimeout {
                    topic: self.topic.clone(),
                    timeout: self.config.write_timeout,
                })
            }
        }
    }

    async fn wait_for_offset(&self, target: i64, timeout: Duration) -> Result<()> {
        let mut observed = self.observed_rx.clone();
        match tokio::time::timeout(timeout, observed.wait_for(|o| *o >= target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::transport("sync", "store consumer stopped")),
            Err(_) => {
                self.forget_last_written();
                let observed = self.last_observed_offset();
                warn!(topic = %self.topic, target, observed, "Replica did not catch up in time");
                Err(Error::SyncTimeout {
                    topic: self.topic.clone(),
                    target,
                    observed,
                    timeout,
                })
            }
        }
    }

    fn forget_last_written(&self) {
        self.last_written.store(UNKNOWN_OFFSET, Ordering::SeqCst);
    }

    fn ensure_started(&self) -> Result<()> {
        if self.readiness() == Readiness::Uninitialized {
            return Err(Error::NotStarted {
                topic: self.topic.clone(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// All values, in key order. Served from the replica.
    pub async fn list(&self) -> Vec<T> {
        self.replica.read().await.values()
    }

    /// Value under `key`, if present in the replica.
    pub async fn find_by_key(&self, key: &str) -> Option<T> {
        self.replica.read().await.get(key).cloned()
    }

    /// Values belonging to one managed cluster.
    pub async fn list_for_cluster(&self, cluster: &str) -> Vec<T> {
        self.replica
            .read()
            .await
            .entries()
            .values()
            .filter(|v| v.cluster() == cluster)
            .cloned()
            .collect()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        self.replica.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.replica.read().await.is_empty()
    }
}

impl<T: Resource> Drop for LogBackedStore<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.get() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<T: Resource> ReadinessProbe for LogBackedStore<T> {
    fn name(&self) -> &str {
        &self.topic
    }

    fn is_ready(&self) -> bool {
        Self::is_ready(self)
    }

    fn progress(&self) -> Progress {
        Self::progress(self)
    }

    async fn poll_ready(&self, timeout: Duration) -> Result<bool> {
        Self::poll_ready(self, timeout).await
    }
}

fn check_key(key: &str) -> Result<()> {
    if key == NOOP_KEY {
        return Err(Error::ReservedKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Replay task: applies records in log order, then advances the watermark.
async fn consume<T: Resource>(
    mut reader: Box<dyn LogReader>,
    replica: Arc<RwLock<Replica<T>>>,
    observed_tx: Arc<watch::Sender<i64>>,
    topic: String,
) {
    loop {
        let batch = match reader.next_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to read store topic, retrying");
                tokio::time::sleep(CONSUMER_RETRY_BACKOFF).await;
                continue;
            }
        };

        let observed = {
            let mut replica = replica.write().await;
            for record in batch {
                let decoded = match record.value {
                    Some(bytes) if record.key != NOOP_KEY => {
                        serde_json::from_slice::<T>(&bytes).map(Some)
                    }
                    _ => Ok(None),
                };
                match decoded {
                    Ok(value) => {
                        replica.apply_record(record.offset, &record.key, value);
                    }
                    Err(e) => {
                        error!(
                            topic = %topic,
                            key = %record.key,
                            offset = record.offset,
                            error = %e,
                            "Skipping undecodable store record"
                        );
                        replica.skip_record(record.offset);
                    }
                }
            }
            replica.last_observed()
        };

        observed_tx.send_if_modified(|current| {
            if observed > *current {
                *current = observed;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use keel_core::Topic;

    use super::*;
    use crate::memory::InMemoryLog;

    const TOPIC: &str = "keel.topics";

    fn config() -> StoreConfig {
        StoreConfig {
            replication_factor: 1,
            write_timeout: Duration::from_millis(200),
            sync_timeout: Duration::from_millis(200),
            ..StoreConfig::default()
        }
    }

    fn store_on(log: &InMemoryLog) -> LogBackedStore<Topic> {
        let log = Arc::new(log.clone());
        LogBackedStore::open(log.clone(), log, &config())
    }

    async fn ready_store(log: &InMemoryLog) -> Result<LogBackedStore<Topic>> {
        let store = store_on(log);
        store.start().await?;
        assert!(store.poll_ready(Duration::from_secs(1)).await?);
        Ok(store)
    }

    fn topic(name: &str, retention: &str) -> Topic {
        Topic::new(name, "ns1", "local", 3, 1).with_config("retention.ms", retention)
    }

    #[tokio::test]
    async fn test_read_your_writes() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        let value = topic("orders", "1000");
        store.create("local/orders", value.clone()).await?;

        assert_eq!(store.find_by_key("local/orders").await, Some(value));
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_removes() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        store.create("local/orders", topic("orders", "1000")).await?;
        store.delete("local/orders").await?;

        assert_eq!(store.find_by_key("local/orders").await, None);
        assert!(store.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_rebuilds_state_in_fresh_process() -> Result<()> {
        let log = InMemoryLog::new();
        {
            let store = ready_store(&log).await?;
            store.create("local/a", topic("a", "1")).await?;
            store.create("local/a", topic("a", "2")).await?;
            store.create("local/b", topic("b", "3")).await?;
            store.delete("local/b").await?;
        }

        let restarted = ready_store(&log).await?;
        let values = restarted.list().await;
        assert_eq!(values.len(), 1);
        assert_eq!(
            values.first().and_then(|t| t.spec.configs.get("retention.ms")).map(String::as_str),
            Some("2")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_noop_key_is_reserved() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        let result = store.create(NOOP_KEY, topic("x", "1")).await;
        assert!(matches!(result, Err(Error::ReservedKey { .. })));
        assert!(matches!(store.delete(NOOP_KEY).await, Err(Error::ReservedKey { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_require_start() {
        let log = InMemoryLog::new();
        let store = store_on(&log);
        let result = store.create("local/a", topic("a", "1")).await;
        assert!(matches!(result, Err(Error::NotStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_forgets_last_written_offset() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;
        assert!(store.last_written_offset() >= 0);

        log.set_ack_delay(Some(Duration::from_secs(5))).await;
        let result = store.create("local/a", topic("a", "1")).await;

        assert!(matches!(result, Err(Error::WriteTimeout { .. })));
        assert_eq!(store.last_written_offset(), UNKNOWN_OFFSET);
        // The write itself is durable.
        assert!(log.records(TOPIC).await.iter().any(|r| r.key == "local/a"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_then_recovery_via_probe() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        log.set_replay_paused(true);
        let result = store.create("local/a", topic("a", "1")).await;
        assert!(matches!(result, Err(Error::SyncTimeout { .. })));
        assert_eq!(store.last_written_offset(), UNKNOWN_OFFSET);

        log.set_replay_paused(false);
        let tail = store.sync().await?;
        assert!(store.last_observed_offset() >= tail);
        assert!(store.find_by_key("local/a").await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_creates_compacted_single_partition_topic() -> Result<()> {
        let log = InMemoryLog::new();
        let _store = ready_store(&log).await?;

        let configs = log.topic_configs(TOPIC).await.unwrap_or_default();
        assert_eq!(configs.get("cleanup.policy").map(String::as_str), Some("compact"));
        let description = log.describe_log_topic(TOPIC).await?;
        assert_eq!(description.map(|d| d.partitions), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_clamps_replication_to_live_brokers() -> Result<()> {
        let log = InMemoryLog::new();
        log.set_broker_count(1);
        let transport = Arc::new(log.clone());
        let store: LogBackedStore<Topic> = LogBackedStore::open(
            transport.clone(),
            transport,
            &StoreConfig {
                replication_factor: 3,
                ..config()
            },
        );

        store.start().await?;
        assert!(log.describe_log_topic(TOPIC).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_partitioned_topic() {
        let log = InMemoryLog::new();
        let configs = BTreeMap::from([("cleanup.policy".to_string(), "compact".to_string())]);
        log.create_topic_with(TOPIC, 3, configs).await;

        let store = store_on(&log);
        let result = store.start().await;
        assert!(matches!(result, Err(Error::InvalidLogTopic { .. })));
        assert_eq!(store.readiness(), Readiness::Uninitialized);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_delete_retention() {
        let log = InMemoryLog::new();
        let configs = BTreeMap::from([("cleanup.policy".to_string(), "delete".to_string())]);
        log.create_topic_with(TOPIC, 1, configs).await;

        let result = store_on(&log).start().await;
        assert!(matches!(result, Err(Error::InvalidLogTopic { .. })));
    }

    #[tokio::test]
    async fn test_ready_transition_happens_once() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        assert_eq!(store.readiness(), Readiness::Ready);
        // Polling again is a no-op, forcing the transition is not.
        assert!(store.poll_ready(Duration::from_millis(10)).await?);
        assert!(matches!(store.mark_ready(), Err(Error::AlreadyReady { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_ready_before_start_fails() {
        let log = InMemoryLog::new();
        let store = store_on(&log);
        let result = store.poll_ready(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::NotStarted { .. })));
    }

    #[tokio::test]
    async fn test_existing_records_are_visible_once_ready() -> Result<()> {
        let log = InMemoryLog::new();
        let configs = BTreeMap::from([("cleanup.policy".to_string(), "compact".to_string())]);
        log.create_topic_with(TOPIC, 1, configs).await;
        let payload = serde_json::to_vec(&topic("orders", "7"))?;
        log.append(TOPIC, "local/orders", Some(payload)).await?;

        let store = ready_store(&log).await?;
        assert!(store.find_by_key("local/orders").await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() -> Result<()> {
        let log = InMemoryLog::new();
        let configs = BTreeMap::from([("cleanup.policy".to_string(), "compact".to_string())]);
        log.create_topic_with(TOPIC, 1, configs).await;
        log.append(TOPIC, "local/garbage", Some(b"{not json".to_vec())).await?;

        let store = ready_store(&log).await?;
        assert!(store.find_by_key("local/garbage").await.is_none());
        assert!(store.last_observed_offset() >= 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_for_cluster_filters() -> Result<()> {
        let log = InMemoryLog::new();
        let store = ready_store(&log).await?;

        store.create("local/a", topic("a", "1")).await?;
        let mut remote = topic("b", "1");
        remote.metadata.cluster = "remote".to_string();
        store.create("remote/b", remote).await?;

        assert_eq!(store.list_for_cluster("local").await.len(), 1);
        assert_eq!(store.list_for_cluster("remote").await.len(), 1);
        assert_eq!(store.len().await, 2);
        Ok(())
    }
}
