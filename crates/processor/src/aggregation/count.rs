use super::trait_::Aggregator;
use crate::error::{AggregationError, AggregationResult};

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;

/// Accumulator for count aggregation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountAccumulator {
    count: u64,
}

impl CountAccumulator {
    pub fn new(count: u64) -> Self {
        Self { count }
    }

    pub fn value(&self) -> u64 {
        self.count
    }
}

/// Count aggregator - counts the values it is fed
///
/// # Examples
///
/// ```
/// use telemetry_processor::aggregation::{Aggregator, CountAggregator};
///
/// let mut agg = CountAggregator::<&str>::new();
/// agg.update(&"a").unwrap();
/// agg.update(&"b").unwrap();
///
/// assert_eq!(agg.finalize().unwrap(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct CountAggregator<T> {
    count: u64,
    _phantom: PhantomData<fn(&T)>,
}

impl<T> CountAggregator<T> {
    /// Create a new count aggregator
    pub fn new() -> Self {
        Self {
            count: 0,
            _phantom: PhantomData,
        }
    }

    fn add(&mut self, n: u64) -> AggregationResult<()> {
        self.count = self
            .count
            .checked_add(n)
            .ok_or_else(|| AggregationError::NumericOverflow {
                operation: "count".to_string(),
                details: format!("{} + {}", self.count, n),
            })?;
        Ok(())
    }
}

impl<T> Default for CountAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Aggregator for CountAggregator<T> {
    type Input = T;
    type Output = u64;
    type Accumulator = CountAccumulator;

    fn update(&mut self, _value: &T) -> AggregationResult<()> {
        self.add(1)
    }

    fn finalize(&self) -> AggregationResult<u64> {
        Ok(self.count)
    }

    fn accumulator(&self) -> CountAccumulator {
        CountAccumulator { count: self.count }
    }

    fn merge(&mut self, other: CountAccumulator) -> AggregationResult<()> {
        self.add(other.count)
    }
}
