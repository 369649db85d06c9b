//! In-memory log for tests and single-process deployments.
//!
//! Behaves like a single-broker-per-topic log: offsets are dense per topic,
//! readers replay from the earliest retained record, and `compact()` keeps
//! the latest record per key. Faults can be injected to exercise the
//! ambiguous-write paths of the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::error::{Error, Result};
use crate::log::{
    CleanupPolicy, LogAdmin, LogReader, LogRecord, LogTopicDescription, LogTopicSpec,
    LogTransport,
};

#[derive(Debug, Default)]
struct TopicLog {
    partitions: i32,
    configs: BTreeMap<String, String>,
    records: Vec<LogRecord>,
    next_offset: i64,
}

struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    changes: watch::Sender<u64>,
    broker_count: AtomicUsize,
    ack_delay: Mutex<Option<Duration>>,
    replay_paused: AtomicBool,
    fail_appends: AtomicBool,
}

/// In-memory implementation of [`LogTransport`] and [`LogAdmin`].
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<Inner>,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    /// Create an empty log backed by a single broker.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                changes,
                broker_count: AtomicUsize::new(1),
                ack_delay: Mutex::new(None),
                replay_paused: AtomicBool::new(false),
                fail_appends: AtomicBool::new(false),
            }),
        }
    }

    /// Create an empty log wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Set the number of live brokers reported to bootstrap.
    pub fn set_broker_count(&self, count: usize) {
        self.inner.broker_count.store(count, Ordering::SeqCst);
    }

    /// Delay acknowledgements of appends. The record is stored immediately.
    pub async fn set_ack_delay(&self, delay: Option<Duration>) {
        *self.inner.ack_delay.lock().await = delay;
    }

    /// Stop or resume delivering records to readers.
    pub fn set_replay_paused(&self, paused: bool) {
        self.inner.replay_paused.store(paused, Ordering::SeqCst);
        self.bump();
    }

    /// Make every append fail without storing anything.
    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Create a topic directly, bypassing validation.
    pub async fn create_topic_with(
        &self,
        topic: &str,
        partitions: i32,
        configs: BTreeMap<String, String>,
    ) {
        let mut topics = self.inner.topics.lock().await;
        topics.insert(
            topic.to_string(),
            TopicLog {
                partitions,
                configs,
                ..TopicLog::default()
            },
        );
    }

    /// Configuration of a topic, if it exists.
    pub async fn topic_configs(&self, topic: &str) -> Option<BTreeMap<String, String>> {
        let topics = self.inner.topics.lock().await;
        topics.get(topic).map(|t| t.configs.clone())
    }

    /// All retained records of a topic.
    pub async fn records(&self, topic: &str) -> Vec<LogRecord> {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    /// Keep only the latest record per key in every topic.
    pub async fn compact(&self) {
        let mut topics = self.inner.topics.lock().await;
        for log in topics.values_mut() {
            let mut latest: HashMap<String, i64> = HashMap::new();
            for record in &log.records {
                latest.insert(record.key.clone(), record.offset);
            }
            log.records
                .retain(|r| latest.get(&r.key).is_some_and(|offset| *offset == r.offset));
        }
    }

    fn bump(&self) {
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[async_trait]
impl LogTransport for InMemoryLog {
    async fn append(&self, topic: &str, key: &str, value: Option<Vec<u8>>) -> Result<i64> {
        if self.inner.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::transport("append", "broker rejected the write"));
        }

        let offset = {
            let mut topics = self.inner.topics.lock().await;
            let log = topics
                .get_mut(topic)
                .ok_or_else(|| Error::transport("append", format!("unknown topic '{topic}'")))?;
            let offset = log.next_offset;
            log.records.push(LogRecord {
                offset,
                key: key.to_string(),
                value,
            });
            log.next_offset = offset.saturating_add(1);
            offset
        };
        self.bump();

        let delay = *self.inner.ack_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(offset)
    }

    async fn open_reader(&self, topic: &str) -> Result<Box<dyn LogReader>> {
        let topics = self.inner.topics.lock().await;
        if !topics.contains_key(topic) {
            return Err(Error::transport(
                "open_reader",
                format!("unknown topic '{topic}'"),
            ));
        }
        Ok(Box::new(InMemoryReader {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            next_offset: 0,
            changes: self.inner.changes.subscribe(),
        }))
    }
}

struct InMemoryReader {
    inner: Arc<Inner>,
    topic: String,
    next_offset: i64,
    changes: watch::Receiver<u64>,
}

#[async_trait]
impl LogReader for InMemoryReader {
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>> {
        loop {
            self.changes.borrow_and_update();

            if !self.inner.replay_paused.load(Ordering::SeqCst) {
                let topics = self.inner.topics.lock().await;
                let log = topics.get(&self.topic).ok_or_else(|| {
                    Error::transport("next_batch", format!("topic '{}' was removed", self.topic))
                })?;
                let batch: Vec<LogRecord> = log
                    .records
                    .iter()
                    .filter(|r| r.offset >= self.next_offset)
                    .cloned()
                    .collect();
                if let Some(last) = batch.last() {
                    self.next_offset = last.offset.saturating_add(1);
                    return Ok(batch);
                }
            }

            self.changes
                .changed()
                .await
                .map_err(|e| Error::transport("next_batch", e.to_string()))?;
        }
    }
}

#[async_trait]
impl LogAdmin for InMemoryLog {
    async fn describe_log_topic(&self, topic: &str) -> Result<Option<LogTopicDescription>> {
        let topics = self.inner.topics.lock().await;
        Ok(topics.get(topic).map(|log| LogTopicDescription {
            partitions: log.partitions,
            cleanup_policy: log
                .configs
                .get("cleanup.policy")
                .map_or(CleanupPolicy::Delete, |v| CleanupPolicy::parse(v)),
        }))
    }

    async fn create_log_topic(&self, spec: &LogTopicSpec) -> Result<()> {
        let brokers = self.inner.broker_count.load(Ordering::SeqCst);
        let replication = usize::try_from(spec.replication_factor).unwrap_or(0);
        if replication == 0 || replication > brokers {
            return Err(Error::transport(
                "create_topic",
                format!(
                    "replication factor {} invalid with {brokers} live brokers",
                    spec.replication_factor
                ),
            ));
        }

        let mut topics = self.inner.topics.lock().await;
        if topics.contains_key(&spec.name) {
            return Err(Error::transport(
                "create_topic",
                format!("topic '{}' already exists", spec.name),
            ));
        }
        topics.insert(
            spec.name.clone(),
            TopicLog {
                partitions: spec.partitions,
                configs: spec.configs.clone(),
                ..TopicLog::default()
            },
        );
        Ok(())
    }

    async fn live_broker_count(&self) -> Result<usize> {
        Ok(self.inner.broker_count.load(Ordering::SeqCst))
    }
}
