//! Windowed stream aggregation for game telemetry
//!
//! This crate turns a partitioned stream of game events into per-minute
//! metric records. Events are deduplicated by `event_id` inside event-time
//! tumbling windows, and each window is counted once the watermark passes its
//! end.
//!
//! - [`pipeline`]: the running pipeline and its builder
//! - [`connector`]: source and sink seams, with in-memory implementations
//! - [`kafka`]: Kafka source and sink
//! - [`aggregation`]: the metric queries and their window state
//! - [`state`]: checkpoint files and restore
//! - [`metrics`]: Prometheus counters and the metrics endpoint

pub mod aggregation;
pub mod config;
pub mod connector;
pub mod core;
pub mod deduplication;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod payload;
pub mod pipeline;
pub mod state;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use core::{EventTimeAssigner, StreamEvent};

pub use window::{TumblingWindowAssigner, WindowBounds};

pub use watermark::{Watermark, WatermarkTracker};

pub use error::{AggregationError, ProcessorError, Result as ProcessorResult, StateError, WindowError};

pub use config::{
    CheckpointConfig, ProcessorConfig, SinkAdapterConfig, WatermarkConfig, WindowConfig,
};

pub use aggregation::{QueryDefinition, WindowAggregate};

pub use connector::{EventSource, MetricSink, ResumeToken, ShardReader, StartingPosition};

pub use pipeline::{PipelineHandle, PipelineStats, StreamPipeline, StreamPipelineBuilder};

pub use kafka::{KafkaMetricSink, KafkaSinkConfig, KafkaSource, KafkaSourceConfig};

pub use state::{CheckpointStore, PipelineSnapshot};
