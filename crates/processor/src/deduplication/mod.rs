//! Per-window event deduplication
//!
//! Inbound delivery is at-least-once, so the same `event_id` can show up
//! several times and out of order. Within each tumbling window the
//! deduplicator keeps a single candidate per `event_id`: the one with the
//! earliest event time, the first arrival winning ties. Candidates stay
//! buffered until the window closes because a better duplicate can still
//! arrive before the watermark passes the window end.
//!
//! ```rust
//! use telemetry_processor::deduplication::{DedupOutcome, WindowDeduplicator};
//! use telemetry_processor::window::WindowBounds;
//! # use telemetry_processor::core::StreamEvent;
//! # use telemetry_types::{EventRecord, GameEvent};
//! # fn event(id: &str, ts: i64) -> StreamEvent {
//! #     StreamEvent { record: EventRecord::new(GameEvent::new(id, "login", ts), "app"), event_time: ts, partition: 0, offset: 0 }
//! # }
//!
//! let window = WindowBounds::new(0, 60_000);
//! let mut dedup = WindowDeduplicator::new();
//!
//! assert_eq!(dedup.insert(window, event("A", 10)), DedupOutcome::Admitted);
//! assert_eq!(dedup.insert(window, event("A", 10)), DedupOutcome::Duplicate);
//!
//! let survivors = dedup.close(&window);
//! assert_eq!(survivors.len(), 1);
//! ```

mod stats;

pub use stats::DeduplicationStats;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::core::StreamEvent;
use crate::watermark::Watermark;
use crate::window::WindowBounds;

/// What happened to an event offered to the deduplicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First delivery of this id in the window
    Admitted,
    /// A duplicate with an earlier event time displaced the buffered candidate
    Replaced,
    /// A duplicate that lost the ranking and was discarded
    Duplicate,
}

#[derive(Debug, Clone)]
struct Candidate {
    event: StreamEvent,
    arrival: u64,
}

#[derive(Debug, Clone, Default)]
struct WindowBuffer {
    candidates: HashMap<String, Candidate>,
}

/// Buffered candidates of one window, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowBufferSnapshot {
    pub window: WindowBounds,
    pub events: Vec<StreamEvent>,
}

/// Rank-1 retention per (window, event_id)
#[derive(Debug, Default)]
pub struct WindowDeduplicator {
    windows: BTreeMap<WindowBounds, WindowBuffer>,
    next_arrival: u64,
    stats: DeduplicationStats,
}

impl WindowDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event to the buffer of `window`
    pub fn insert(&mut self, window: WindowBounds, event: StreamEvent) -> DedupOutcome {
        self.stats.events_checked += 1;
        let arrival = self.next_arrival;
        self.next_arrival += 1;

        let buffer = self.windows.entry(window).or_default();
        match buffer.candidates.get_mut(event.event_id()) {
            None => {
                buffer
                    .candidates
                    .insert(event.event_id().to_string(), Candidate { event, arrival });
                self.stats.unique_events += 1;
                DedupOutcome::Admitted
            }
            Some(existing) if event.event_time < existing.event.event_time => {
                trace!(
                    event_id = event.event_id(),
                    window = %window.id(),
                    "Earlier duplicate replaced buffered candidate"
                );
                *existing = Candidate { event, arrival };
                self.stats.duplicates_found += 1;
                self.stats.candidates_replaced += 1;
                DedupOutcome::Replaced
            }
            Some(_) => {
                self.stats.duplicates_found += 1;
                DedupOutcome::Duplicate
            }
        }
    }

    /// Remove a window and return its surviving events in arrival order
    pub fn close(&mut self, window: &WindowBounds) -> Vec<StreamEvent> {
        self.windows
            .remove(window)
            .map(Self::drain_in_arrival_order)
            .unwrap_or_default()
    }

    /// Close every window whose end the watermark has reached, oldest first
    pub fn close_until(&mut self, watermark: Watermark) -> Vec<(WindowBounds, Vec<StreamEvent>)> {
        let closeable: Vec<WindowBounds> = self
            .windows
            .keys()
            .take_while(|w| w.is_closed_by(watermark))
            .copied()
            .collect();

        closeable
            .into_iter()
            .map(|window| {
                let events = self.close(&window);
                (window, events)
            })
            .collect()
    }

    /// Windows currently buffering events
    pub fn open_windows(&self) -> Vec<WindowBounds> {
        self.windows.keys().copied().collect()
    }

    /// Total number of buffered candidates
    pub fn buffered_events(&self) -> usize {
        self.windows.values().map(|b| b.candidates.len()).sum()
    }

    pub fn stats(&self) -> &DeduplicationStats {
        &self.stats
    }

    /// Copy of every open buffer, for checkpointing
    pub fn snapshot(&self) -> Vec<WindowBufferSnapshot> {
        self.windows
            .iter()
            .map(|(window, buffer)| WindowBufferSnapshot {
                window: *window,
                events: Self::drain_in_arrival_order(buffer.clone()),
            })
            .collect()
    }

    /// Re-insert buffered candidates taken from a snapshot
    pub fn restore(&mut self, buffers: Vec<WindowBufferSnapshot>) {
        for snapshot in buffers {
            for event in snapshot.events {
                self.insert(snapshot.window, event);
            }
        }
    }

    fn drain_in_arrival_order(buffer: WindowBuffer) -> Vec<StreamEvent> {
        let mut candidates: Vec<Candidate> = buffer.candidates.into_values().collect();
        candidates.sort_by_key(|c| c.arrival);
        candidates.into_iter().map(|c| c.event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::{EventRecord, GameEvent};

    fn event(id: &str, ts: i64, offset: i64) -> StreamEvent {
        StreamEvent {
            record: EventRecord::new(GameEvent::new(id, "login", ts), "app"),
            event_time: ts,
            partition: 0,
            offset,
        }
    }

    fn window() -> WindowBounds {
        WindowBounds::new(0, 60_000)
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut dedup = WindowDeduplicator::new();
        assert_eq!(dedup.insert(window(), event("A", 0, 0)), DedupOutcome::Admitted);
        assert_eq!(dedup.insert(window(), event("A", 0, 1)), DedupOutcome::Duplicate);
        assert_eq!(dedup.insert(window(), event("A", 0, 2)), DedupOutcome::Duplicate);
        assert_eq!(dedup.insert(window(), event("B", 5, 3)), DedupOutcome::Admitted);

        let survivors = dedup.close(&window());
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].event_id(), "A");
        assert_eq!(survivors[1].event_id(), "B");

        let stats = dedup.stats();
        assert_eq!(stats.events_checked, 4);
        assert_eq!(stats.unique_events, 2);
        assert_eq!(stats.duplicates_found, 2);
    }

    #[test]
    fn test_earliest_event_time_wins() {
        let mut dedup = WindowDeduplicator::new();
        dedup.insert(window(), event("A", 500, 0));
        assert_eq!(dedup.insert(window(), event("A", 100, 1)), DedupOutcome::Replaced);
        assert_eq!(dedup.insert(window(), event("A", 300, 2)), DedupOutcome::Duplicate);

        let survivors = dedup.close(&window());
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].event_time, 100);
        assert_eq!(survivors[0].offset, 1);
        assert_eq!(dedup.stats().candidates_replaced, 1);
    }

    #[test]
    fn test_tie_keeps_first_arrival() {
        let mut dedup = WindowDeduplicator::new();
        dedup.insert(window(), event("A", 100, 7));
        dedup.insert(window(), event("A", 100, 8));

        let survivors = dedup.close(&window());
        assert_eq!(survivors[0].offset, 7);
    }

    #[test]
    fn test_same_id_in_different_windows_is_kept() {
        let mut dedup = WindowDeduplicator::new();
        let w2 = WindowBounds::new(60_000, 120_000);
        dedup.insert(window(), event("A", 10, 0));
        assert_eq!(dedup.insert(w2, event("A", 60_010, 1)), DedupOutcome::Admitted);
        assert_eq!(dedup.open_windows(), vec![window(), w2]);
    }

    #[test]
    fn test_close_until_watermark() {
        let mut dedup = WindowDeduplicator::new();
        let w2 = WindowBounds::new(60_000, 120_000);
        dedup.insert(window(), event("A", 10, 0));
        dedup.insert(w2, event("B", 60_010, 1));

        assert!(dedup.close_until(Watermark::new(59_999)).is_empty());

        let closed = dedup.close_until(Watermark::new(60_000));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, window());
        assert_eq!(dedup.open_windows(), vec![w2]);

        // Closing again is a no-op
        assert!(dedup.close(&window()).is_empty());
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut dedup = WindowDeduplicator::new();
        dedup.insert(window(), event("A", 10, 0));
        dedup.insert(window(), event("B", 20, 1));
        dedup.insert(window(), event("A", 10, 2));

        let snapshot = dedup.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].events.len(), 2);

        let mut restored = WindowDeduplicator::new();
        restored.restore(snapshot);
        assert_eq!(restored.buffered_events(), 2);

        // A replayed duplicate is still absorbed after restore
        assert_eq!(restored.insert(window(), event("A", 10, 0)), DedupOutcome::Duplicate);
    }
}
