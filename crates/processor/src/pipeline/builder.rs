//! Stream pipeline builder for fluent API configuration

use std::path::PathBuf;
use std::time::Duration;

use super::executor::StreamPipeline;
use crate::aggregation::QueryDefinition;
use crate::config::ProcessorConfig;
use crate::connector::{EventSource, MetricSink, StartingPosition};
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;
use crate::state::CheckpointStore;

/// Builder for a [`StreamPipeline`]
///
/// A source and a sink are required; everything else has defaults. All four
/// metric queries run unless [`with_queries`](Self::with_queries) narrows
/// them down.
///
/// # Example
///
/// ```rust,no_run
/// use telemetry_processor::connector::{MemorySink, MemorySource, StartingPosition};
/// use telemetry_processor::pipeline::StreamPipelineBuilder;
///
/// # async fn example() -> anyhow::Result<()> {
/// let sink = MemorySink::new();
/// let handle = StreamPipelineBuilder::new()
///     .with_parallelism(2)
///     .with_source(MemorySource::new(2))
///     .with_sink(sink.clone())
///     .with_starting_position(StartingPosition::Earliest)
///     .build()?
///     .start()
///     .await?;
///
/// let stats = handle.wait().await?;
/// println!("emitted {} records", stats.records_emitted);
/// # Ok(())
/// # }
/// ```
pub struct StreamPipelineBuilder {
    config: ProcessorConfig,
    source: Option<Box<dyn EventSource>>,
    sink: Option<Box<dyn MetricSink>>,
    starting_position: StartingPosition,
    checkpoint_store: Option<CheckpointStore>,
    metrics: Option<PipelineMetrics>,
    queries: Vec<QueryDefinition>,
}

impl Default for StreamPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: ProcessorConfig::default(),
            source: None,
            sink: None,
            starting_position: StartingPosition::default(),
            checkpoint_store: None,
            metrics: None,
            queries: QueryDefinition::all(),
        }
    }

    /// Replace the whole processor configuration
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of keyed window workers
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    pub fn with_window_size(mut self, size: Duration) -> Self {
        self.config.window.size_ms = size.as_millis() as u64;
        self
    }

    /// Set how far the partition watermark trails the newest event time
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.config.window.allowed_lateness_ms = lateness.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.watermark.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.sink.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.sink.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_source(mut self, source: impl EventSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Where to start reading when there is no checkpoint to resume from
    pub fn with_starting_position(mut self, position: StartingPosition) -> Self {
        self.starting_position = position;
        self
    }

    /// Store checkpoints in `dir`
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint.dir = Some(dir.into());
        self
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint.interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Update these counters instead of a private set
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_queries(mut self, queries: Vec<QueryDefinition>) -> Self {
        self.queries = queries;
        self
    }

    /// Validate the configuration and assemble the pipeline
    pub fn build(self) -> Result<StreamPipeline> {
        self.config.validate()?;

        let source = self.source.ok_or_else(|| ProcessorError::Configuration {
            source: "a source is required".into(),
        })?;
        let sink = self.sink.ok_or_else(|| ProcessorError::Configuration {
            source: "a sink is required".into(),
        })?;

        if self.queries.is_empty() {
            return Err(ProcessorError::Configuration {
                source: "at least one query is required".into(),
            });
        }
        // Query state is checkpointed by metric name
        for (i, query) in self.queries.iter().enumerate() {
            if self.queries[..i].iter().any(|q| q.metric == query.metric) {
                return Err(ProcessorError::Configuration {
                    source: format!("query {} is defined twice", query.metric).into(),
                });
            }
        }

        let checkpoints = self.checkpoint_store.or_else(|| {
            self.config
                .checkpoint
                .dir
                .as_ref()
                .map(|dir| CheckpointStore::new(dir, self.config.checkpoint.max_checkpoints))
        });

        Ok(StreamPipeline {
            config: self.config,
            source,
            sink,
            starting_position: self.starting_position,
            checkpoints,
            metrics: self.metrics.unwrap_or_default(),
            queries: self.queries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{MemorySink, MemorySource};

    #[test]
    fn test_builder_requires_source_and_sink() {
        let err = StreamPipelineBuilder::new()
            .with_sink(MemorySink::new())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("source is required"));

        let err = StreamPipelineBuilder::new()
            .with_source(MemorySource::new(1))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("sink is required"));
    }

    #[test]
    fn test_builder_validates_config() {
        let result = StreamPipelineBuilder::new()
            .with_source(MemorySource::new(1))
            .with_sink(MemorySink::new())
            .with_parallelism(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_duplicate_queries() {
        let result = StreamPipelineBuilder::new()
            .with_source(MemorySource::new(1))
            .with_sink(MemorySink::new())
            .with_queries(vec![QueryDefinition::total_events(), QueryDefinition::total_events()])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let pipeline = StreamPipelineBuilder::new()
            .with_source(MemorySource::new(1))
            .with_sink(MemorySink::new())
            .with_checkpoint_dir("/tmp/telemetry-checkpoints")
            .with_batch_size(10)
            .build()
            .unwrap();

        assert_eq!(pipeline.queries().len(), 4);
        assert_eq!(pipeline.config().sink.batch_size, 10);
        assert_eq!(pipeline.config().parallelism, 4);
        assert!(pipeline.checkpoints.is_some());
    }
}
