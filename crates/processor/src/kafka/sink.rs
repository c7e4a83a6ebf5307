//! Kafka sink for metric records

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use telemetry_types::MetricRecord;
use tracing::debug;

use crate::connector::MetricSink;
use crate::error::{ProcessorError, Result};

const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 30_000;

/// Configuration for the Kafka metric sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSinkConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    pub topic: String,
    pub client_id: String,
    /// Deployment region, appended to the client id
    #[serde(default)]
    pub region: Option<String>,
    /// Delivery timeout of a single record
    #[serde(default = "default_message_timeout")]
    pub message_timeout_ms: u64,
    /// Additional rdkafka producer settings
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

fn default_message_timeout() -> u64 {
    DEFAULT_MESSAGE_TIMEOUT_MS
}

impl KafkaSinkConfig {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            client_id: "telemetry-aggregator".to_string(),
            region: None,
            message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            extra_config: HashMap::new(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let client_id = match &self.region {
            Some(region) => format!("{}-{}", self.client_id, region),
            None => self.client_id.clone(),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", client_id)
            .set("acks", "all")
            // Keeps per-partition order across internal retries
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", self.message_timeout_ms.to_string());

        for (key, value) in &self.extra_config {
            client_config.set(key, value);
        }
        client_config
    }
}

/// Writes metric records as JSON keyed by metric name
pub struct KafkaMetricSink {
    config: KafkaSinkConfig,
    producer: FutureProducer,
}

impl KafkaMetricSink {
    pub fn new(config: KafkaSinkConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .client_config()
            .create()
            .map_err(|e| ProcessorError::Configuration { source: Box::new(e) })?;

        Ok(Self { config, producer })
    }
}

#[async_trait]
impl MetricSink for KafkaMetricSink {
    async fn send_batch(&mut self, records: &[MetricRecord]) -> Result<()> {
        let payloads = records
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Enqueue the whole batch before waiting so it can share produce requests
        let mut deliveries = Vec::with_capacity(records.len());
        for (record, payload) in records.iter().zip(&payloads) {
            let message = FutureRecord::to(&self.config.topic)
                .key(record.partition_key())
                .payload(payload);
            let delivery = self
                .producer
                .send_result(message)
                .map_err(|(e, _)| ProcessorError::from(e))?;
            deliveries.push(delivery);
        }

        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(e.into()),
                Err(_) => {
                    return Err(ProcessorError::Kafka {
                        source: "delivery future canceled".into(),
                    })
                }
            }
        }

        debug!(topic = %self.config.topic, records = records.len(), "Delivered metric batch");
        Ok(())
    }
}
