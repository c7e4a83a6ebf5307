//! Per-query merge state across window workers

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use telemetry_types::{MetricName, MetricRecord};
use tracing::{debug, trace};

use super::count::CountAggregator;
use super::query::{GroupKey, PartialCounts, QueryDefinition};
use super::trait_::Aggregator;
use crate::core::StreamEvent;
use crate::error::{AggregationError, AggregationResult};
use crate::watermark::Watermark;
use crate::window::WindowBounds;

/// Counters kept by a [`WindowAggregate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub partials_merged: u64,
    /// Partials for windows that were already emitted
    pub stale_partials: u64,
    pub windows_closed: u64,
    pub records_emitted: u64,
    /// Groups suppressed by the HAVING threshold
    pub groups_filtered: u64,
}

/// Serializable form of a [`WindowAggregate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregateSnapshot {
    pub metric: MetricName,
    pub frontier: Watermark,
    pub windows: Vec<(WindowBounds, PartialCounts)>,
}

/// Merges the partial counts of one query and emits each window once
///
/// Windows are emitted when [`advance`](Self::advance) is called with a
/// watermark at or past their end. The highest such watermark is kept as the
/// closed frontier: partials for windows behind it are dropped, so replaying
/// a close never emits a window twice.
#[derive(Debug)]
pub struct WindowAggregate {
    query: QueryDefinition,
    windows: BTreeMap<WindowBounds, HashMap<GroupKey, CountAggregator<StreamEvent>>>,
    frontier: Watermark,
    stats: AggregateStats,
}

impl WindowAggregate {
    pub fn new(query: QueryDefinition) -> Self {
        Self {
            query,
            windows: BTreeMap::new(),
            frontier: Watermark::min(),
            stats: AggregateStats::default(),
        }
    }

    pub fn query(&self) -> &QueryDefinition {
        &self.query
    }

    pub fn frontier(&self) -> Watermark {
        self.frontier
    }

    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Fold one worker's partial counts for `window`
    ///
    /// Returns `false` when the window was already emitted.
    pub fn merge_partial(
        &mut self,
        window: WindowBounds,
        partials: PartialCounts,
    ) -> AggregationResult<bool> {
        if window.is_closed_by(self.frontier) {
            trace!(
                metric = %self.query.metric,
                window = %window,
                "Ignoring partial for emitted window"
            );
            self.stats.stale_partials += 1;
            return Ok(false);
        }

        let groups = self.windows.entry(window).or_default();
        for (key, acc) in partials {
            groups.entry(key).or_default().merge(acc)?;
        }
        self.stats.partials_merged += 1;
        Ok(true)
    }

    /// Emit every window the watermark closes, oldest first
    ///
    /// Records of a window are sorted by grouping key.
    pub fn advance(&mut self, watermark: Watermark) -> AggregationResult<Vec<MetricRecord>> {
        if watermark <= self.frontier {
            return Ok(Vec::new());
        }
        self.frontier = watermark;

        let closed: Vec<WindowBounds> = self
            .windows
            .keys()
            .take_while(|w| w.is_closed_by(watermark))
            .copied()
            .collect();

        let mut records = Vec::new();
        for window in closed {
            let Some(groups) = self.windows.remove(&window) else {
                continue;
            };

            let mut counted = Vec::with_capacity(groups.len());
            for (key, agg) in groups {
                counted.push((key, agg.finalize()?));
            }
            counted.sort_by(|a, b| a.0.cmp(&b.0));

            let before = records.len();
            for (key, count) in counted {
                if self.query.passes_having(count) {
                    records.push(self.query.to_record(&window, &key, count));
                } else {
                    self.stats.groups_filtered += 1;
                }
            }

            self.stats.windows_closed += 1;
            debug!(
                metric = %self.query.metric,
                window = %window,
                records = records.len() - before,
                "Closed window"
            );
        }

        self.stats.records_emitted += records.len() as u64;
        Ok(records)
    }

    pub fn snapshot(&self) -> WindowAggregateSnapshot {
        let windows = self
            .windows
            .iter()
            .map(|(window, groups)| {
                let mut partials: PartialCounts = groups
                    .iter()
                    .map(|(key, agg)| (key.clone(), agg.accumulator()))
                    .collect();
                partials.sort_by(|a, b| a.0.cmp(&b.0));
                (*window, partials)
            })
            .collect();

        WindowAggregateSnapshot {
            metric: self.query.metric,
            frontier: self.frontier,
            windows,
        }
    }

    /// Replace the merge state with a snapshot of the same query
    pub fn restore(&mut self, snapshot: WindowAggregateSnapshot) -> AggregationResult<()> {
        if snapshot.metric != self.query.metric {
            return Err(AggregationError::CorruptedState {
                aggregation_type: self.query.metric.to_string(),
                details: format!("snapshot belongs to {}", snapshot.metric),
            });
        }

        self.windows.clear();
        self.frontier = snapshot.frontier;
        for (window, partials) in snapshot.windows {
            self.merge_partial(window, partials)?;
        }
        Ok(())
    }
}
