//! Kafka source: one partition queue per shard

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::error::KafkaError;
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connector::{EventSource, ShardReader, SourceRecord, StartingPosition};
use crate::error::{ProcessorError, Result};

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_METADATA_TIMEOUT_MS: u64 = 10_000;

/// Configuration for the Kafka source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    /// Deployment region, appended to the client id
    #[serde(default)]
    pub region: Option<String>,
    /// How long a shard waits for the first record of a batch
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_ms: u64,
    /// Additional rdkafka consumer settings
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_metadata_timeout() -> u64 {
    DEFAULT_METADATA_TIMEOUT_MS
}

impl KafkaSourceConfig {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            group_id: "telemetry-aggregator".to_string(),
            region: None,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            metadata_timeout_ms: DEFAULT_METADATA_TIMEOUT_MS,
            extra_config: HashMap::new(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let client_id = match &self.region {
            Some(region) => format!("{}-{}", self.group_id, region),
            None => self.group_id.clone(),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("client.id", client_id)
            // Read positions are tracked by checkpoints
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");

        for (key, value) in &self.extra_config {
            client_config.set(key, value);
        }
        client_config
    }
}

/// Kafka topic read as one shard per partition
///
/// Every partition of the topic is assigned explicitly; there is no group
/// rebalancing, so shard ownership stays fixed for the life of the pipeline.
pub struct KafkaSource {
    config: KafkaSourceConfig,
    consumer: Option<Arc<StreamConsumer>>,
    driver: Option<JoinHandle<()>>,
}

impl KafkaSource {
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self {
            config,
            consumer: None,
            driver: None,
        }
    }

    fn partition_ids(&self, consumer: &StreamConsumer) -> Result<Vec<i32>> {
        let metadata = consumer.fetch_metadata(
            Some(&self.config.topic),
            Timeout::After(Duration::from_millis(self.config.metadata_timeout_ms)),
        )?;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.config.topic)
            .ok_or_else(|| ProcessorError::Configuration {
                source: format!("topic '{}' not found", self.config.topic).into(),
            })?;

        let mut ids: Vec<i32> = topic.partitions().iter().map(|p| p.id()).collect();
        if ids.is_empty() {
            return Err(ProcessorError::Configuration {
                source: format!("topic '{}' has no partitions", self.config.topic).into(),
            });
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn start_offset(position: &StartingPosition, partition: i32) -> Offset {
    match position {
        StartingPosition::Earliest => Offset::Beginning,
        StartingPosition::Latest => Offset::End,
        StartingPosition::Resume(token) => u32::try_from(partition)
            .ok()
            .and_then(|p| token.offset(p))
            .map_or(Offset::Beginning, Offset::Offset),
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn open_shards(&mut self, position: &StartingPosition) -> Result<Vec<Box<dyn ShardReader>>> {
        let consumer: Arc<StreamConsumer> = Arc::new(
            self.config
                .client_config()
                .create()
                .map_err(|e| ProcessorError::Configuration { source: Box::new(e) })?,
        );

        let partitions = self.partition_ids(&consumer)?;

        // Queues are split off before assignment so no message lands on the main queue
        let mut readers: Vec<Box<dyn ShardReader>> = Vec::with_capacity(partitions.len());
        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            let queue = consumer
                .split_partition_queue(&self.config.topic, *partition)
                .ok_or_else(|| ProcessorError::Unexpected(format!(
                    "could not split queue for partition {}",
                    partition
                )))?;
            assignment.add_partition_offset(
                &self.config.topic,
                *partition,
                start_offset(position, *partition),
            )?;
            readers.push(Box::new(KafkaShardReader {
                partition: *partition as u32,
                queue,
                poll_timeout: Duration::from_millis(self.config.poll_timeout_ms),
            }));
        }
        consumer.assign(&assignment)?;

        // The main queue still has to be polled to serve callbacks and errors
        let main = consumer.clone();
        self.driver = Some(tokio::spawn(async move {
            loop {
                match main.recv().await {
                    Ok(message) => warn!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "Message delivered on the main consumer queue"
                    ),
                    Err(e) => warn!(error = %e, "Kafka consumer error"),
                }
            }
        }));
        self.consumer = Some(consumer);

        info!(
            topic = %self.config.topic,
            partitions = ?partitions,
            position = %position,
            "Opened Kafka shards"
        );
        Ok(readers)
    }
}

impl Drop for KafkaSource {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct KafkaShardReader {
    partition: u32,
    queue: StreamPartitionQueue<rdkafka::consumer::DefaultConsumerContext>,
    poll_timeout: Duration,
}

#[async_trait]
impl ShardReader for KafkaShardReader {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>> {
        let mut batch = Vec::new();

        while batch.len() < max {
            // Only the first record is waited for
            let wait = if batch.is_empty() {
                self.poll_timeout
            } else {
                Duration::from_millis(1)
            };

            match tokio::time::timeout(wait, self.queue.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => batch.push(SourceRecord {
                    partition: self.partition,
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }),
                Ok(Err(KafkaError::PartitionEOF(_))) => break,
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    debug!(partition = self.partition, error = %e, "Ending batch early");
                    break;
                }
            }
        }

        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ResumeToken;
    use std::collections::BTreeMap;

    #[test]
    fn test_start_offsets() {
        assert_eq!(start_offset(&StartingPosition::Earliest, 0), Offset::Beginning);
        assert_eq!(start_offset(&StartingPosition::Latest, 0), Offset::End);

        let token = ResumeToken::new(BTreeMap::from([(1, 42)]));
        let position = StartingPosition::Resume(token);
        assert_eq!(start_offset(&position, 1), Offset::Offset(42));
        assert_eq!(start_offset(&position, 0), Offset::Beginning);
    }

    #[test]
    fn test_client_config() {
        let mut config = KafkaSourceConfig::new("broker:9092", "events");
        config.region = Some("eu-west-1".to_string());
        config
            .extra_config
            .insert("fetch.min.bytes".to_string(), "1".to_string());

        let client = config.client_config();
        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client.get("client.id"), Some("telemetry-aggregator-eu-west-1"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("fetch.min.bytes"), Some("1"));
    }
}
