//! Window bounds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::watermark::Watermark;

/// Half-open event-time interval `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: i64,
    /// End time of the window (exclusive)
    pub end: i64,
}

impl WindowBounds {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Window width in milliseconds
    pub fn size_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// A window may close once the watermark reaches its end
    pub fn is_closed_by(&self, watermark: Watermark) -> bool {
        watermark.timestamp >= self.end
    }

    /// Window start as a UTC timestamp
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start)
    }

    /// Stable identifier used in logs and checkpoints
    pub fn id(&self) -> String {
        format!("{}_{}", self.start, self.end)
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            DateTime::from_timestamp_millis(self.start),
            DateTime::from_timestamp_millis(self.end),
        ) {
            (Some(start), Some(end)) => write!(
                f,
                "[{} - {})",
                start.format("%Y-%m-%d %H:%M:%S%.3f"),
                end.format("%Y-%m-%d %H:%M:%S%.3f")
            ),
            _ => write!(f, "[{} - {})", self.start, self.end),
        }
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds_contains() {
        let bounds = WindowBounds::new(0, 60_000);
        assert!(bounds.contains(0));
        assert!(bounds.contains(59_999));
        assert!(!bounds.contains(60_000));
        assert!(!bounds.contains(-1));
        assert_eq!(bounds.size_ms(), 60_000);
    }

    #[test]
    fn test_window_closed_by_watermark() {
        let bounds = WindowBounds::new(0, 60_000);
        assert!(!bounds.is_closed_by(Watermark::new(59_999)));
        assert!(bounds.is_closed_by(Watermark::new(60_000)));
        assert!(bounds.is_closed_by(Watermark::max()));
        assert!(!bounds.is_closed_by(Watermark::min()));
    }

    #[test]
    fn test_window_ordering() {
        let w1 = WindowBounds::new(0, 60_000);
        let w2 = WindowBounds::new(60_000, 120_000);
        assert!(w1 < w2);
        assert_eq!(w1.id(), "0_60000");
    }

    #[test]
    fn test_window_display() {
        let bounds = WindowBounds::new(0, 60_000);
        assert_eq!(
            bounds.to_string(),
            "[1970-01-01 00:00:00.000 - 1970-01-01 00:01:00.000)"
        );
        assert_eq!(bounds.start_time().unwrap().timestamp_millis(), 0);
    }
}
