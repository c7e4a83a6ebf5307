//! Error types for decoding wire records

use thiserror::Error;

/// Result type alias for decoding operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Errors raised while decoding an inbound record
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed event record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Event record is missing required field '{0}'")]
    MissingField(&'static str),
}
