//! Statistics for deduplication operations

use serde::{Deserialize, Serialize};

/// Counters kept by a [`WindowDeduplicator`](super::WindowDeduplicator)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    /// Total number of events offered to the deduplicator
    pub events_checked: u64,

    /// Number of distinct (window, event_id) pairs admitted
    pub unique_events: u64,

    /// Number of deliveries collapsed into an existing candidate
    pub duplicates_found: u64,

    /// Duplicates that displaced the buffered candidate by carrying an
    /// earlier event time
    pub candidates_replaced: u64,
}

impl DeduplicationStats {
    /// Calculate the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.events_checked == 0 {
            0.0
        } else {
            self.duplicates_found as f64 / self.events_checked as f64
        }
    }

    pub fn merge(&mut self, other: &DeduplicationStats) {
        self.events_checked += other.events_checked;
        self.unique_events += other.unique_events;
        self.duplicates_found += other.duplicates_found;
        self.candidates_replaced += other.candidates_replaced;
    }
}
