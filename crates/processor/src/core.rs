//! Core event processing structures
//!
//! - [`StreamEvent`]: an inbound record annotated with its event time and
//!   source position
//! - [`EventTimeAssigner`]: stamps records with event time and advances the
//!   partition watermark

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use telemetry_types::EventRecord;

use crate::payload::{FieldPath, PayloadFields};
use crate::watermark::{PartitionWatermark, Watermark};

/// An inbound record with stream processing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// The decoded record
    pub record: EventRecord,
    /// Event time in epoch milliseconds
    pub event_time: i64,
    /// Source partition the record was read from
    pub partition: u32,
    /// Position of the record within its partition
    pub offset: i64,
}

impl StreamEvent {
    pub fn event_id(&self) -> &str {
        self.record.event_id()
    }

    pub fn event_type(&self) -> &str {
        self.record.event_type()
    }

    pub fn application_id(&self) -> Option<&str> {
        self.record.application_id.as_deref()
    }

    pub fn app_version(&self) -> Option<&str> {
        self.record.event.app_version.as_deref()
    }

    /// Read a string field from the event payload
    pub fn payload_field(&self, path: &FieldPath) -> Option<String> {
        self.record.event.extract_str(path)
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamEvent {{ id: {}, type: {}, event_time: {}, partition: {}, offset: {} }}",
            self.event_id(),
            self.event_type(),
            self.event_time,
            self.partition,
            self.offset
        )
    }
}

/// Assigns event time to records of one partition
///
/// The event time is the record's `event_timestamp`. Every assignment feeds
/// the partition watermark, which is returned when it advances.
#[derive(Debug, Clone)]
pub struct EventTimeAssigner {
    partition: u32,
    watermark: PartitionWatermark,
}

impl EventTimeAssigner {
    pub fn new(partition: u32, allowed_lateness: Duration) -> Self {
        Self {
            partition,
            watermark: PartitionWatermark::new(allowed_lateness),
        }
    }

    /// Resume from a previously observed maximum event time
    pub fn restore(partition: u32, allowed_lateness: Duration, max_timestamp: Option<i64>) -> Self {
        Self {
            partition,
            watermark: PartitionWatermark::restore(allowed_lateness, max_timestamp),
        }
    }

    /// Annotate a record; also returns the partition watermark if it advanced
    pub fn assign(&mut self, record: EventRecord, offset: i64) -> (StreamEvent, Option<Watermark>) {
        let event_time = record.event_timestamp();
        let advanced = self.watermark.on_event(event_time);
        let event = StreamEvent {
            record,
            event_time,
            partition: self.partition,
            offset,
        };
        (event, advanced)
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn current_watermark(&self) -> Watermark {
        self.watermark.current()
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.watermark.max_timestamp()
    }
}
