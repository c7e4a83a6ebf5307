//! Windowing for stream processing
//!
//! Events are bucketed into tumbling windows: fixed-size, non-overlapping,
//! half-open intervals of event time. Each event belongs to exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----)[---)[---)[---)[---)[---)
//! ```
//!
//! A window is open until the global watermark reaches its end; it is then
//! closed exactly once and its state is discarded.

mod assigner;
mod types;

pub use assigner::TumblingWindowAssigner;
pub use types::WindowBounds;
