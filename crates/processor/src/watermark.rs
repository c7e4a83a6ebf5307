//! Event-time watermarks
//!
//! Every source partition tracks the largest event time it has seen and trails
//! it by the allowed lateness; that value is the partition watermark and it
//! never moves backwards. Downstream workers fold the partition watermarks
//! they receive into a global watermark, the minimum across all live
//! partitions, which decides when windows close and which events are late.
//!
//! # Example
//!
//! ```rust
//! use telemetry_processor::watermark::{PartitionWatermark, WatermarkTracker};
//! use std::time::Duration;
//!
//! let mut p0 = PartitionWatermark::new(Duration::from_secs(5));
//! let mut tracker = WatermarkTracker::new([0, 1]);
//!
//! let wm = p0.on_event(65_000).unwrap();
//! assert_eq!(wm.timestamp, 60_000);
//!
//! // Partition 1 has not reported yet, so the global watermark holds back
//! assert_eq!(tracker.update(0, wm), None);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Represents a watermark timestamp
///
/// A watermark asserts that no further events with a smaller event time are
/// expected. Events below the global watermark are late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Returns the maximum possible watermark (end of time)
    pub fn max() -> Self {
        Self { timestamp: i64::MAX }
    }

    /// Converts the watermark to a DateTime, if representable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Checks if this watermark is before the given timestamp
    pub fn is_before(&self, timestamp: i64) -> bool {
        self.timestamp < timestamp
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Returns true if this is the maximum watermark
    pub fn is_max(&self) -> bool {
        self.timestamp == i64::MAX
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            write!(f, "Watermark(-inf)")
        } else if self.is_max() {
            write!(f, "Watermark(+inf)")
        } else {
            match self.to_datetime() {
                Some(dt) => write!(f, "Watermark({})", dt.to_rfc3339()),
                None => write!(f, "Watermark({}ms)", self.timestamp),
            }
        }
    }
}

/// Bounded out-of-orderness watermark for a single partition
///
/// Owned by the worker reading the partition; nothing else mutates it.
#[derive(Debug, Clone)]
pub struct PartitionWatermark {
    lateness_ms: i64,
    max_timestamp: Option<i64>,
    current: Watermark,
}

impl PartitionWatermark {
    /// Creates a partition watermark trailing the maximum event time by `allowed_lateness`
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            lateness_ms: i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX),
            max_timestamp: None,
            current: Watermark::min(),
        }
    }

    /// Restores the partition from a previously observed maximum event time
    pub fn restore(allowed_lateness: Duration, max_timestamp: Option<i64>) -> Self {
        let mut watermark = Self::new(allowed_lateness);
        if let Some(ts) = max_timestamp {
            watermark.on_event(ts);
        }
        watermark
    }

    /// Observes an event time; returns the new watermark if it advanced
    pub fn on_event(&mut self, timestamp: i64) -> Option<Watermark> {
        let max_ts = self.max_timestamp.map_or(timestamp, |m| m.max(timestamp));
        self.max_timestamp = Some(max_ts);

        let candidate = Watermark::new(max_ts.saturating_sub(self.lateness_ms));
        if candidate > self.current {
            self.current = candidate;
            trace!(watermark = %candidate, "Advanced partition watermark");
            Some(candidate)
        } else {
            None
        }
    }

    /// Current partition watermark
    pub fn current(&self) -> Watermark {
        self.current
    }

    /// Largest event time observed so far
    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionState {
    watermark: Watermark,
    idle: bool,
    finished: bool,
}

/// Global watermark as the minimum over partition watermarks
///
/// Partitions are registered up front so the global watermark cannot run
/// ahead of a partition that has not reported yet. Finished partitions leave
/// the reduction; idle partitions leave it until they report again.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    partitions: HashMap<u32, PartitionState>,
    current: Watermark,
}

impl WatermarkTracker {
    pub fn new(partitions: impl IntoIterator<Item = u32>) -> Self {
        Self {
            partitions: partitions
                .into_iter()
                .map(|p| {
                    (
                        p,
                        PartitionState {
                            watermark: Watermark::min(),
                            idle: false,
                            finished: false,
                        },
                    )
                })
                .collect(),
            current: Watermark::min(),
        }
    }

    /// Starts from a known global watermark (used on restore)
    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.current = watermark;
        for state in self.partitions.values_mut() {
            state.watermark = state.watermark.max(watermark);
        }
        self
    }

    /// Records a partition watermark; returns the global watermark if it advanced
    pub fn update(&mut self, partition: u32, watermark: Watermark) -> Option<Watermark> {
        let state = self.partitions.entry(partition).or_insert(PartitionState {
            watermark: Watermark::min(),
            idle: false,
            finished: false,
        });
        if watermark < state.watermark {
            trace!(partition, %watermark, "Ignoring stale partition watermark");
        }
        state.watermark = state.watermark.max(watermark);
        state.idle = false;
        self.recompute()
    }

    /// Removes an idle partition from the reduction until it reports again
    pub fn mark_idle(&mut self, partition: u32) -> Option<Watermark> {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.idle = true;
        }
        self.recompute()
    }

    /// Removes a partition that will never report again
    pub fn finish(&mut self, partition: u32) -> Option<Watermark> {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.finished = true;
        }
        self.recompute()
    }

    /// True once every partition has finished
    pub fn all_finished(&self) -> bool {
        self.partitions.values().all(|s| s.finished)
    }

    /// Current global watermark
    pub fn current(&self) -> Watermark {
        self.current
    }

    pub fn partition_watermark(&self, partition: u32) -> Option<Watermark> {
        self.partitions.get(&partition).map(|s| s.watermark)
    }

    /// An event is late when its time is below the global watermark
    pub fn is_late(&self, timestamp: i64) -> bool {
        timestamp < self.current.timestamp
    }

    /// How far behind the global watermark an event is; 0 when on time
    pub fn lateness(&self, timestamp: i64) -> i64 {
        if self.is_late(timestamp) {
            self.current.timestamp.saturating_sub(timestamp)
        } else {
            0
        }
    }

    fn recompute(&mut self) -> Option<Watermark> {
        let min = self
            .partitions
            .values()
            .filter(|s| !s.finished && !s.idle)
            .map(|s| s.watermark)
            .min()?;

        if min > self.current {
            self.current = min;
            debug!(watermark = %min, "Advanced watermark");
            Some(min)
        } else {
            None
        }
    }
}

/// Statistics for late event handling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LateEventStats {
    /// Number of dropped late events
    pub dropped_count: u64,
    /// Largest observed lateness in milliseconds
    pub max_lateness_ms: i64,
    /// Sum of lateness, used for the average
    pub total_lateness_ms: i64,
}

impl LateEventStats {
    pub fn record(&mut self, lateness_ms: i64) {
        self.dropped_count += 1;
        self.max_lateness_ms = self.max_lateness_ms.max(lateness_ms);
        self.total_lateness_ms = self.total_lateness_ms.saturating_add(lateness_ms);
    }

    /// Average lateness in milliseconds
    pub fn average_lateness_ms(&self) -> i64 {
        if self.dropped_count == 0 {
            0
        } else {
            self.total_lateness_ms / self.dropped_count as i64
        }
    }

    pub fn merge(&mut self, other: &LateEventStats) {
        self.dropped_count += other.dropped_count;
        self.max_lateness_ms = self.max_lateness_ms.max(other.max_lateness_ms);
        self.total_lateness_ms = self.total_lateness_ms.saturating_add(other.total_lateness_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lateness() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark::new(1000);
        let w2 = Watermark::new(2000);
        assert!(w1 < w2);
        assert!(w1.is_before(1500));
        assert_eq!(w1.max(w2), w2);
        assert!(Watermark::min().is_min());
        assert!(Watermark::max().is_max());
        assert_eq!(Watermark::default(), Watermark::min());
    }

    #[test]
    fn test_partition_watermark_basic() {
        let mut wm = PartitionWatermark::new(lateness());
        assert_eq!(wm.current(), Watermark::min());

        assert_eq!(wm.on_event(10_000), Some(Watermark::new(5_000)));
        assert_eq!(wm.max_timestamp(), Some(10_000));
    }

    #[test]
    fn test_partition_watermark_uses_max_not_latest() {
        let mut wm = PartitionWatermark::new(lateness());
        wm.on_event(20_000);

        // An older event must not pull the watermark back
        assert_eq!(wm.on_event(12_000), None);
        assert_eq!(wm.current(), Watermark::new(15_000));

        assert_eq!(wm.on_event(21_000), Some(Watermark::new(16_000)));
    }

    #[test]
    fn test_partition_watermark_restore() {
        let wm = PartitionWatermark::restore(lateness(), Some(65_000));
        assert_eq!(wm.current(), Watermark::new(60_000));

        let empty = PartitionWatermark::restore(lateness(), None);
        assert!(empty.current().is_min());
    }

    #[test]
    fn test_partition_watermark_saturates() {
        let mut wm = PartitionWatermark::new(lateness());
        assert_eq!(wm.on_event(i64::MIN + 10), None);
        assert!(wm.current().is_min());
    }

    #[test]
    fn test_tracker_min_of_partitions() {
        let mut tracker = WatermarkTracker::new([0, 1]);

        assert_eq!(tracker.update(0, Watermark::new(10_000)), None);
        assert!(tracker.current().is_min());

        assert_eq!(tracker.update(1, Watermark::new(4_000)), Some(Watermark::new(4_000)));
        assert_eq!(tracker.update(1, Watermark::new(20_000)), Some(Watermark::new(10_000)));
        assert_eq!(tracker.current(), Watermark::new(10_000));
    }

    #[test]
    fn test_tracker_monotonicity() {
        let mut tracker = WatermarkTracker::new([0]);
        tracker.update(0, Watermark::new(10_000));

        assert_eq!(tracker.update(0, Watermark::new(5_000)), None);
        assert_eq!(tracker.current(), Watermark::new(10_000));
        assert_eq!(tracker.partition_watermark(0), Some(Watermark::new(10_000)));
    }

    #[test]
    fn test_tracker_finished_partitions_leave_reduction() {
        let mut tracker = WatermarkTracker::new([0, 1]);
        tracker.update(0, Watermark::new(30_000));

        assert_eq!(tracker.finish(1), Some(Watermark::new(30_000)));
        assert!(!tracker.all_finished());

        tracker.finish(0);
        assert!(tracker.all_finished());
        assert_eq!(tracker.current(), Watermark::new(30_000));
    }

    #[test]
    fn test_tracker_idle_partition() {
        let mut tracker = WatermarkTracker::new([0, 1]);
        tracker.update(0, Watermark::new(50_000));
        tracker.update(1, Watermark::new(1_000));

        assert_eq!(tracker.mark_idle(1), Some(Watermark::new(50_000)));

        // Partition 1 resumes behind the global watermark; no regression
        assert_eq!(tracker.update(1, Watermark::new(2_000)), None);
        assert_eq!(tracker.current(), Watermark::new(50_000));
    }

    #[test]
    fn test_late_detection() {
        let mut tracker = WatermarkTracker::new([0]);
        assert!(!tracker.is_late(i64::MIN));

        tracker.update(0, Watermark::new(60_000));
        assert!(tracker.is_late(59_999));
        assert!(!tracker.is_late(60_000));
        assert_eq!(tracker.lateness(55_000), 5_000);
        assert_eq!(tracker.lateness(61_000), 0);
    }

    #[test]
    fn test_tracker_with_restored_watermark() {
        let tracker = WatermarkTracker::new([0, 1]).with_watermark(Watermark::new(120_000));
        assert_eq!(tracker.current(), Watermark::new(120_000));
        assert!(tracker.is_late(100_000));
    }

    #[test]
    fn test_late_event_stats() {
        let mut stats = LateEventStats::default();
        stats.record(100);
        stats.record(300);
        assert_eq!(stats.dropped_count, 2);
        assert_eq!(stats.max_lateness_ms, 300);
        assert_eq!(stats.average_lateness_ms(), 200);

        let mut total = LateEventStats::default();
        total.merge(&stats);
        assert_eq!(total, stats);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::min().to_string(), "Watermark(-inf)");
        assert!(Watermark::new(0).to_string().contains("1970-01-01"));
    }
}
