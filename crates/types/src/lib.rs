//! Core types and data models for the game telemetry metrics pipeline
//!
//! This crate provides the records that cross the pipeline's boundaries: the
//! telemetry events read from the inbound stream and the metric records written
//! to the outbound stream.

pub mod errors;
pub mod events;
pub mod metrics;

pub use errors::{DecodeError, Result};
pub use events::{EventRecord, GameEvent};
pub use metrics::{MetricName, MetricRecord, METRIC_UNIT_COUNT, OUTPUT_TYPE_METRICS};
