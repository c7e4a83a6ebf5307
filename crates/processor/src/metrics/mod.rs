//! Prometheus metrics for the aggregation pipeline
//!
//! Counters live in [`PipelineMetrics`] and are shared by every pipeline
//! task. They double as the source of [`PipelineStats`](crate::pipeline::PipelineStats),
//! so a pipeline that is never scraped still reports its progress.

mod counters;
mod server;

pub use counters::{MetricsRegistry, PipelineMetrics};
pub use server::{HealthStatus, MetricsServer, MetricsServerConfig};

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to start metrics server: {0}")]
    ServerStartError(String),

    #[error("Failed to bind to address {address}: {source}")]
    BindError {
        address: String,
        source: std::io::Error,
    },

    #[error("Metric encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
