//! Error types for the stream processor
//!
//! This module provides error handling for all processor operations including
//! windowing, aggregation, checkpoint state and the stream connectors.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Aggregation-related errors
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Checkpoint state errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Execution errors
    #[error("execution error: {source}")]
    Execution {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An event record could not be encoded or decoded
    #[error("record error: {0}")]
    Decode(#[from] telemetry_types::DecodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Kafka-related errors
    #[error("kafka error: {source}")]
    Kafka {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A pipeline stage hung up before the pipeline finished
    #[error("channel closed: {stage}")]
    ChannelClosed { stage: String },

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProcessorError {
    /// Transient connector failures are retried with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProcessorError::Kafka { .. } | ProcessorError::Io(_))
    }
}

/// Window assignment and management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// Window size is invalid
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: u64 },

    /// Event arrived too late after watermark
    #[error("late event: event timestamp {event_time} is before watermark {watermark}, late by {late_by}ms")]
    LateEvent {
        event_time: i64,
        watermark: i64,
        late_by: i64,
    },
}

/// Aggregation computation errors
#[derive(Error, Debug)]
pub enum AggregationError {
    /// Numeric overflow during aggregation
    #[error("numeric overflow in {operation}: {details}")]
    NumericOverflow { operation: String, details: String },

    /// Aggregation state is corrupted
    #[error("corrupted aggregation state for {aggregation_type}: {details}")]
    CorruptedState {
        aggregation_type: String,
        details: String,
    },
}

/// Checkpoint state errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// Checkpoint creation failed
    #[error("checkpoint failed at {checkpoint_id}: {reason}")]
    CheckpointFailed {
        checkpoint_id: String,
        reason: String,
    },

    /// Checkpoint restoration failed
    #[error("restore failed from checkpoint {checkpoint_id}: {reason}")]
    RestoreFailed {
        checkpoint_id: String,
        reason: String,
    },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for aggregation operations
pub type AggregationResult<T> = std::result::Result<T, AggregationError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for ProcessorError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        ProcessorError::Kafka {
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_error_display() {
        let err = WindowError::InvalidWindowSize { size: 0 };
        assert!(err.to_string().contains("invalid window size"));

        let err = WindowError::LateEvent {
            event_time: 1_000,
            watermark: 5_000,
            late_by: 4_000,
        };
        assert!(err.to_string().contains("late by 4000ms"));
    }

    #[test]
    fn test_state_error_display() {
        let err = StateError::CheckpointFailed {
            checkpoint_id: "ckpt-1".to_string(),
            reason: "checksum mismatch".to_string(),
        };
        assert!(err.to_string().contains("ckpt-1"));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_processor_error_from_window_error() {
        let window_err = WindowError::InvalidWindowSize { size: 0 };
        let processor_err: ProcessorError = window_err.into();
        assert!(matches!(processor_err, ProcessorError::Window(_)));
    }

    #[test]
    fn test_processor_error_from_decode_error() {
        let decode_err = telemetry_types::DecodeError::MissingField("event_id");
        let processor_err: ProcessorError = decode_err.into();
        assert!(matches!(processor_err, ProcessorError::Decode(_)));
        assert!(processor_err.to_string().contains("event_id"));
        assert!(!processor_err.is_retriable());
    }

    #[test]
    fn test_retriable_classification() {
        let io = ProcessorError::Io(std::io::Error::new(std::io::ErrorKind::Other, "reset"));
        assert!(io.is_retriable());

        let config = ProcessorError::Configuration {
            source: "missing stream".into(),
        };
        assert!(!config.is_retriable());
    }
}
