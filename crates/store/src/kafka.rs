//! Kafka-backed log transport and admin, built on librdkafka.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, ResourceSpecifier, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::log::{
    CleanupPolicy, LogAdmin, LogReader, LogRecord, LogTopicDescription, LogTopicSpec,
    LogTransport,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the Kafka cluster that hosts the store topics.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaLogConfig {
    pub bootstrap_servers: String,
    /// Extra librdkafka properties, e.g. `security.protocol`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl KafkaLogConfig {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    /// Clients that only look at metadata must never make the broker
    /// auto-create the topic they ask about.
    fn metadata_client_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config.set("allow.auto.create.topics", "false");
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.metadata_client_config();
        config.set("acks", "all").set("enable.idempotence", "true");
        config
    }
}

/// [`LogTransport`] and [`LogAdmin`] over a real Kafka cluster.
pub struct KafkaLog {
    config: KafkaLogConfig,
    producer: FutureProducer,
    metadata: Arc<BaseConsumer>,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaLog {
    pub fn connect(config: KafkaLogConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| Error::transport("create_producer", e.to_string()))?;
        let metadata: BaseConsumer = config
            .metadata_client_config()
            .create()
            .map_err(|e| Error::transport("create_metadata_client", e.to_string()))?;
        let admin: AdminClient<DefaultClientContext> = config
            .client_config()
            .create()
            .map_err(|e| Error::transport("create_admin", e.to_string()))?;

        info!(bootstrap = %config.bootstrap_servers, "Connected Kafka log");
        Ok(Self {
            config,
            producer,
            metadata: Arc::new(metadata),
            admin,
        })
    }

    async fn metadata_for(&self, topic: Option<String>) -> Result<rdkafka::metadata::Metadata> {
        let client = Arc::clone(&self.metadata);
        tokio::task::spawn_blocking(move || client.fetch_metadata(topic.as_deref(), METADATA_TIMEOUT))
        .await
        .map_err(|e| Error::transport("fetch_metadata", e.to_string()))?
        .map_err(|e| Error::transport("fetch_metadata", e.to_string()))
    }
}

#[async_trait]
impl LogTransport for KafkaLog {
    async fn append(&self, topic: &str, key: &str, value: Option<Vec<u8>>) -> Result<i64> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).key(key);
        if let Some(payload) = value.as_deref() {
            record = record.payload(payload);
        }

        let (_partition, offset) = self
            .producer
            .send(record, Duration::from_secs(0))
            .await
            .map_err(|(e, _)| Error::transport("append", e.to_string()))?;
        Ok(offset)
    }

    async fn open_reader(&self, topic: &str) -> Result<Box<dyn LogReader>> {
        let consumer: StreamConsumer = self
            .config
            .client_config()
            .set("group.id", format!("keel-replica-{topic}"))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| Error::transport("create_consumer", e.to_string()))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, 0, Offset::Beginning)
            .map_err(|e| Error::transport("assign", e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| Error::transport("assign", e.to_string()))?;

        debug!(topic, "Opened Kafka store reader");
        Ok(Box::new(KafkaReader { consumer }))
    }
}

struct KafkaReader {
    consumer: StreamConsumer,
}

#[async_trait]
impl LogReader for KafkaReader {
    async fn next_batch(&mut self) -> Result<Vec<LogRecord>> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::transport("consume", e.to_string()))?;

        let key = message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        Ok(vec![LogRecord {
            offset: message.offset(),
            key,
            value: message.payload().map(<[u8]>::to_vec),
        }])
    }
}

#[async_trait]
impl LogAdmin for KafkaLog {
    async fn describe_log_topic(&self, topic: &str) -> Result<Option<LogTopicDescription>> {
        let metadata = self.metadata_for(Some(topic.to_string())).await?;
        let Some(found) = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
        else {
            return Ok(None);
        };
        let partitions = i32::try_from(found.partitions().len()).unwrap_or(i32::MAX);

        let results = self
            .admin
            .describe_configs(&[ResourceSpecifier::Topic(topic)], &AdminOptions::new())
            .await
            .map_err(|e| Error::transport("describe_configs", e.to_string()))?;
        let cleanup_policy = results
            .into_iter()
            .find_map(std::result::Result::ok)
            .and_then(|resource| {
                resource
                    .get("cleanup.policy")
                    .and_then(|entry| entry.value.clone())
            })
            .map_or(CleanupPolicy::Delete, |v| CleanupPolicy::parse(&v));

        Ok(Some(LogTopicDescription {
            partitions,
            cleanup_policy,
        }))
    }

    async fn create_log_topic(&self, spec: &LogTopicSpec) -> Result<()> {
        let mut new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(i32::from(spec.replication_factor)),
        );
        for (key, value) in &spec.configs {
            new_topic = new_topic.set(key, value);
        }

        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| Error::transport("create_topic", e.to_string()))?;
        for result in results {
            result.map_err(|(name, code)| {
                Error::transport("create_topic", format!("'{name}': {code}"))
            })?;
        }
        Ok(())
    }

    async fn live_broker_count(&self) -> Result<usize> {
        let metadata = self.metadata_for(None).await?;
        Ok(metadata.brokers().len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> KafkaLogConfig {
        KafkaLogConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            properties: BTreeMap::from([("security.protocol".to_string(), "plaintext".to_string())]),
        }
    }

    #[test]
    fn test_metadata_lookups_never_auto_create_topics() {
        let metadata = config().metadata_client_config();

        assert_eq!(metadata.get("allow.auto.create.topics"), Some("false"));
        assert_eq!(metadata.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(metadata.get("security.protocol"), Some("plaintext"));
    }

    #[test]
    fn test_producer_is_idempotent_and_never_auto_creates() {
        let producer = config().producer_config();

        assert_eq!(producer.get("allow.auto.create.topics"), Some("false"));
        assert_eq!(producer.get("enable.idempotence"), Some("true"));
        assert_eq!(producer.get("acks"), Some("all"));
    }
}
