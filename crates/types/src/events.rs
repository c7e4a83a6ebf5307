//! Telemetry event types read from the inbound stream

use crate::errors::{DecodeError, Result};
use serde::{Deserialize, Serialize};

/// A single game telemetry event as emitted by a game client or backend
///
/// `event_data` is an opaque payload. Producers send it either as a JSON
/// document encoded in a string or as an inline JSON value; both forms are
/// kept verbatim and interpreted only when a query looks a field up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Logical identity of the occurrence; may be delivered more than once
    pub event_id: String,
    /// Discriminator used for filtering (`login`, `user_knockout`, ...)
    pub event_type: String,
    #[serde(default)]
    pub event_version: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    /// Event time in epoch milliseconds
    pub event_timestamp: i64,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub event_data: Option<serde_json::Value>,
}

impl GameEvent {
    /// Create an event with the required fields only
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        event_timestamp: i64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            event_version: None,
            event_name: None,
            event_timestamp,
            app_version: None,
            event_data: None,
        }
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    pub fn with_event_version(mut self, event_version: impl Into<String>) -> Self {
        self.event_version = Some(event_version.into());
        self
    }

    pub fn with_event_data(mut self, event_data: serde_json::Value) -> Self {
        self.event_data = Some(event_data);
        self
    }
}

/// Inbound stream record: the nested event plus record-level attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: GameEvent,
    /// Application that produced the event
    #[serde(default)]
    pub application_id: Option<String>,
}

impl EventRecord {
    pub fn new(event: GameEvent, application_id: impl Into<String>) -> Self {
        Self {
            event,
            application_id: Some(application_id.into()),
        }
    }

    /// Decode a record from its JSON wire form
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let record: EventRecord = serde_json::from_slice(bytes)?;
        if record.event.event_id.is_empty() {
            return Err(DecodeError::MissingField("event_id"));
        }
        Ok(record)
    }

    /// Encode the record to its JSON wire form
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn event_timestamp(&self) -> i64 {
        self.event.event_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_full_record() {
        let raw = json!({
            "event": {
                "event_version": "1.0.0",
                "event_id": "A",
                "event_type": "user_knockout",
                "event_name": "knockout",
                "event_timestamp": 1_700_000_000_000_i64,
                "app_version": "1.2.0",
                "event_data": "{\"spell_id\":\"fireball\"}"
            },
            "application_id": "app-1"
        });

        let record = EventRecord::from_slice(raw.to_string().as_bytes()).unwrap();
        assert_eq!(record.event_id(), "A");
        assert_eq!(record.event_type(), "user_knockout");
        assert_eq!(record.event_timestamp(), 1_700_000_000_000);
        assert_eq!(record.application_id.as_deref(), Some("app-1"));
        assert_eq!(
            record.event.event_data,
            Some(json!("{\"spell_id\":\"fireball\"}"))
        );
    }

    #[test]
    fn test_decode_optional_fields_missing() {
        let raw = r#"{"event":{"event_id":"B","event_type":"login","event_timestamp":5}}"#;
        let record = EventRecord::from_slice(raw.as_bytes()).unwrap();

        assert_eq!(record.application_id, None);
        assert_eq!(record.event.app_version, None);
        assert_eq!(record.event.event_data, None);
    }

    #[test]
    fn test_decode_missing_required_field() {
        let raw = r#"{"event":{"event_id":"B","event_timestamp":5}}"#;
        let err = EventRecord::from_slice(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Malformed"));

        let raw = r#"{"event":{"event_id":"","event_type":"login","event_timestamp":5}}"#;
        let err = EventRecord::from_slice(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("event_id")));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(EventRecord::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_encode_decode_preserves_inline_payload() {
        let record = EventRecord::new(
            GameEvent::new("C", "iap_transaction", 42)
                .with_app_version("2.0")
                .with_event_data(json!({"currency_type": "gems"})),
            "app-2",
        );

        let decoded = EventRecord::from_slice(&record.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
