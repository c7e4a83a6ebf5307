//! Checkpoint state
//!
//! Checkpoints are taken with barriers that travel in-band through every
//! pipeline channel. Each stage snapshots its state once the barrier has
//! arrived on all of its inputs, so the combined [`PipelineSnapshot`] is a
//! consistent cut: source offsets, partition event-time progress, buffered
//! window candidates and per-query merge state all describe the same point
//! of the input.

mod checkpoint;
mod snapshot;

pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
pub use snapshot::{PipelineSnapshot, SourcePosition, WorkerSnapshot};
