//! Configuration types for the stream processor
//!
//! These structures are passed explicitly to the components that need them;
//! nothing in the processor reads process-wide configuration.

use crate::error::{ProcessorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Watermark configuration
    #[serde(default)]
    pub watermark: WatermarkConfig,

    /// Sink adapter configuration
    #[serde(default)]
    pub sink: SinkAdapterConfig,

    /// Checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Number of keyed window workers
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Capacity of the channels between pipeline stages
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum records read from a shard per poll
    #[serde(default = "default_max_records_per_poll")]
    pub max_records_per_poll: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            watermark: WatermarkConfig::default(),
            sink: SinkAdapterConfig::default(),
            checkpoint: CheckpointConfig::default(),
            parallelism: default_parallelism(),
            buffer_size: default_buffer_size(),
            max_records_per_poll: default_max_records_per_poll(),
        }
    }
}

impl ProcessorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.sink.validate()?;
        self.checkpoint.validate()?;

        if self.parallelism == 0 {
            return Err(ProcessorError::Configuration {
                source: "parallelism must be greater than 0".into(),
            });
        }

        if self.buffer_size == 0 {
            return Err(ProcessorError::Configuration {
                source: "buffer_size must be greater than 0".into(),
            });
        }

        if self.max_records_per_poll == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_records_per_poll must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

/// Tumbling window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window width in milliseconds
    #[serde(default = "default_window_size")]
    pub size_ms: u64,

    /// Allowed lateness in milliseconds; the partition watermark trails the
    /// partition's maximum event time by this amount
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_window_size(),
            allowed_lateness_ms: default_allowed_lateness(),
        }
    }
}

impl WindowConfig {
    pub fn tumbling(size_ms: u64) -> Self {
        Self {
            size_ms,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "tumbling window size must be greater than 0".into(),
            });
        }
        if self.size_ms > i64::MAX as u64 || self.allowed_lateness_ms > i64::MAX as u64 {
            return Err(ProcessorError::Configuration {
                source: "window size and lateness must fit in a signed 64-bit millisecond value".into(),
            });
        }
        Ok(())
    }
}

/// Watermark configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Exclude partitions that stay silent this long from the global
    /// minimum; disabled when unset
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl WatermarkConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Sink adapter batching and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkAdapterConfig {
    /// Maximum records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush interval for partially filled batches (milliseconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Maximum retries for a failed batch before the pipeline fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries (milliseconds)
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    /// Backoff cap (milliseconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for SinkAdapterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl SinkAdapterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ProcessorError::Configuration {
                source: "sink batch_size must be greater than 0".into(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "sink flush_interval_ms must be greater than 0".into(),
            });
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Exponential backoff for the given retry attempt, capped at `max_backoff_ms`
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(retry.min(10));
        let backoff_ms = self.base_backoff_ms.saturating_mul(multiplier);
        Duration::from_millis(backoff_ms.min(self.max_backoff_ms))
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files; checkpointing is off when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Interval between periodic checkpoints (milliseconds); only a final
    /// checkpoint on cancellation is taken when unset
    #[serde(default)]
    pub interval_ms: Option<u64>,

    /// Number of checkpoint files kept on disk
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: None,
            interval_ms: None,
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dir.is_some() && self.max_checkpoints == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_checkpoints must be greater than 0".into(),
            });
        }
        if self.interval_ms == Some(0) {
            return Err(ProcessorError::Configuration {
                source: "checkpoint interval must be greater than 0".into(),
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_buffer_size() -> usize {
    10_000
}

fn default_max_records_per_poll() -> usize {
    10_000
}

fn default_window_size() -> u64 {
    60_000
}

fn default_allowed_lateness() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_max_checkpoints() -> usize {
    5
}
