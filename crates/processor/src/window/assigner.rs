//! Window assignment

use super::types::WindowBounds;
use crate::error::{WindowError, WindowResult};

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows. Each event is assigned to
/// exactly one window based on its timestamp; a timestamp on a boundary
/// starts the next window.
///
/// # Example
/// ```text
/// Window size: 60s
/// Event at 59_999  -> Window [0, 60_000)
/// Event at 60_000  -> Window [60_000, 120_000)
/// Event at -1      -> Window [-60_000, 0)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    size_ms: i64,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    pub fn new(size_ms: u64) -> WindowResult<Self> {
        if size_ms == 0 || size_ms > i64::MAX as u64 {
            return Err(WindowError::InvalidWindowSize { size: size_ms });
        }
        Ok(Self {
            size_ms: size_ms as i64,
        })
    }

    /// Window containing `timestamp`; floors toward negative infinity
    pub fn window_for(&self, timestamp: i64) -> WindowBounds {
        let start = timestamp.div_euclid(self.size_ms).saturating_mul(self.size_ms);
        WindowBounds::new(start, start.saturating_add(self.size_ms))
    }
}
