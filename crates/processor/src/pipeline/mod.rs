//! Stream processing pipeline
//!
//! The pipeline reads a partitioned source of telemetry events and writes
//! per-window metric records to a sink:
//!
//! - one partition reader per source shard decodes records, assigns event
//!   time and generates the partition watermark
//! - window workers deduplicate events by `event_id` within tumbling windows
//!   and count the survivors per query when the global watermark closes a
//!   window
//! - one task per query merges the partial counts of all workers, applies
//!   the HAVING threshold and emits records
//! - the sink adapter batches records and retries transient sink failures
//! - the checkpoint coordinator takes consistent snapshots using aligned
//!   barriers
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry_processor::connector::{MemorySink, MemorySource, StartingPosition};
//! use telemetry_processor::pipeline::StreamPipelineBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let source = MemorySource::unbounded(4);
//! let handle = StreamPipelineBuilder::new()
//!     .with_source(source.clone())
//!     .with_sink(MemorySink::new())
//!     .with_starting_position(StartingPosition::Earliest)
//!     .with_checkpoint_dir("/var/lib/telemetry/checkpoints")
//!     .with_checkpoint_interval(Duration::from_secs(60))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let checkpoint_id = handle.trigger_checkpoint().await?;
//! println!("checkpoint {checkpoint_id} stored");
//!
//! handle.cancel();
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

mod barrier;
mod coordinator;
mod messages;
mod partition;
mod query;
mod sink;
mod window_worker;

pub mod builder;
pub mod executor;

pub use builder::StreamPipelineBuilder;
pub use executor::{PipelineHandle, PipelineStats, StreamPipeline};
