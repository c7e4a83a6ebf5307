//! Kafka connectors
//!
//! [`KafkaSource`] reads the inbound topic as one shard per partition and
//! [`KafkaMetricSink`] writes metric records keyed by metric name, so every
//! metric lands on a single partition and keeps its order.

mod sink;
mod source;

pub use sink::{KafkaMetricSink, KafkaSinkConfig};
pub use source::{KafkaSource, KafkaSourceConfig};
