//! Windowed aggregation
//!
//! Aggregators fold values into mergeable, serializable accumulators. The
//! pipeline counts each query's groups per window worker, ships the
//! accumulators to the query's task and merges them there, so HAVING
//! thresholds are applied to the complete count of a group.
//!
//! # Examples
//!
//! ```rust
//! use telemetry_processor::aggregation::{CountAccumulator, GroupKey, QueryDefinition, WindowAggregate};
//! use telemetry_processor::watermark::Watermark;
//! use telemetry_processor::window::WindowBounds;
//!
//! let key = GroupKey { application_id: Some("app".into()), app_version: None, dimension: None };
//! let window = WindowBounds::new(0, 60_000);
//!
//! let mut logins = WindowAggregate::new(QueryDefinition::total_logins());
//! logins.merge_partial(window, vec![(key.clone(), CountAccumulator::new(1))]).unwrap();
//! logins.merge_partial(window, vec![(key, CountAccumulator::new(1))]).unwrap();
//!
//! let records = logins.advance(Watermark::new(60_000)).unwrap();
//! assert_eq!(records[0].metric_unit_value_int, 2);
//! ```

mod count;
mod query;
mod trait_;
mod window_aggregate;

pub use count::{CountAccumulator, CountAggregator};
pub use query::{Dimension, GroupKey, PartialCounts, QueryDefinition};
pub use trait_::Aggregator;
pub use window_aggregate::{AggregateStats, WindowAggregate, WindowAggregateSnapshot};
