use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::AggregationResult;

/// Core trait for all aggregators
///
/// Aggregators fold values incrementally and expose their state as an
/// accumulator that can be shipped to another task and merged there. The
/// window workers build partial results this way and each query task merges
/// the partials of every worker before finalizing.
pub trait Aggregator: Send + Sync + Debug {
    /// The type of values this aggregator accepts
    type Input;

    /// The type of the final aggregation result
    type Output: Clone;

    /// The type of the internal accumulator state (must be serializable)
    type Accumulator: Clone + Serialize + for<'de> Deserialize<'de>;

    /// Update the aggregator with a new value
    fn update(&mut self, value: &Self::Input) -> AggregationResult<()>;

    /// Compute the final aggregation result
    fn finalize(&self) -> AggregationResult<Self::Output>;

    /// Get the current accumulator state (for shipping/merging)
    fn accumulator(&self) -> Self::Accumulator;

    /// Merge another accumulator into this one
    fn merge(&mut self, other: Self::Accumulator) -> AggregationResult<()>;
}
