//! The four metric queries
//!
//! Each query is a filter, a grouping key and a HAVING threshold over the
//! deduplicated, windowed stream. Queries never share state: every window
//! worker computes partial counts for each query separately and every query
//! task merges only its own partials.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use telemetry_types::{MetricName, MetricRecord};

use super::count::{CountAccumulator, CountAggregator};
use super::trait_::Aggregator;
use crate::core::StreamEvent;
use crate::error::AggregationResult;
use crate::payload::FieldPath;
use crate::window::WindowBounds;

/// Payload field a query groups by in addition to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    SpellId,
    CurrencyType,
}

impl Dimension {
    /// Location of the field inside `event_data`
    pub fn path(&self) -> FieldPath {
        match self {
            Dimension::SpellId => FieldPath::key("spell_id"),
            Dimension::CurrencyType => FieldPath::key("currency_type"),
        }
    }

    fn apply(&self, record: MetricRecord, value: Option<String>) -> MetricRecord {
        match self {
            Dimension::SpellId => record.with_spell_id(value),
            Dimension::CurrencyType => record.with_currency_type(value),
        }
    }
}

/// Grouping key of one output record within a window
///
/// Application id and version may be null; such events group together. The
/// payload dimension is only set for queries that have one and is never null
/// for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub application_id: Option<String>,
    pub app_version: Option<String>,
    pub dimension: Option<String>,
}

/// Partial counts of one query for one window
pub type PartialCounts = Vec<(GroupKey, CountAccumulator)>;

/// Filter, grouping and HAVING threshold of a metric query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    pub metric: MetricName,
    /// Required `event_type`; every event passes when unset
    pub event_type: Option<&'static str>,
    pub dimension: Option<Dimension>,
    /// Groups counting less than this are not emitted
    pub min_count: u64,
}

impl QueryDefinition {
    pub fn total_events() -> Self {
        Self {
            metric: MetricName::TotalEvents,
            event_type: None,
            dimension: None,
            min_count: 1,
        }
    }

    pub fn total_logins() -> Self {
        Self {
            metric: MetricName::TotalLogins,
            event_type: Some("login"),
            dimension: None,
            min_count: 1,
        }
    }

    pub fn knockouts_by_spell() -> Self {
        Self {
            metric: MetricName::KnockoutsBySpell,
            event_type: Some("user_knockout"),
            dimension: Some(Dimension::SpellId),
            min_count: 2,
        }
    }

    pub fn purchases_by_currency() -> Self {
        Self {
            metric: MetricName::Purchases,
            event_type: Some("iap_transaction"),
            dimension: Some(Dimension::CurrencyType),
            min_count: 2,
        }
    }

    /// The queries the pipeline runs, in output order
    pub fn all() -> Vec<Self> {
        vec![
            Self::total_events(),
            Self::total_logins(),
            Self::knockouts_by_spell(),
            Self::purchases_by_currency(),
        ]
    }

    /// Grouping key of an event, or `None` when the query filters it out
    pub fn group_key(&self, event: &StreamEvent) -> Option<GroupKey> {
        if let Some(event_type) = self.event_type {
            if event.event_type() != event_type {
                return None;
            }
        }

        let dimension = match self.dimension {
            // Null-keyed groups are excluded before counting
            Some(dimension) => Some(event.payload_field(&dimension.path())?),
            None => None,
        };

        Some(GroupKey {
            application_id: event.application_id().map(str::to_string),
            app_version: event.app_version().map(str::to_string),
            dimension,
        })
    }

    pub fn passes_having(&self, count: u64) -> bool {
        count >= self.min_count
    }

    /// Build the output record of a group
    pub fn to_record(&self, window: &WindowBounds, key: &GroupKey, count: u64) -> MetricRecord {
        let value = i64::try_from(count).unwrap_or(i64::MAX);
        let record = MetricRecord::count(self.metric, window.start, value)
            .with_application(key.application_id.clone(), key.app_version.clone());

        match self.dimension {
            Some(dimension) => dimension.apply(record, key.dimension.clone()),
            None => record,
        }
    }

    /// Count the events of one closed window per group, sorted by key
    pub fn partial_counts(&self, events: &[StreamEvent]) -> AggregationResult<PartialCounts> {
        let mut groups: HashMap<GroupKey, CountAggregator<StreamEvent>> = HashMap::new();
        for event in events {
            if let Some(key) = self.group_key(event) {
                groups.entry(key).or_default().update(event)?;
            }
        }

        let mut partials: PartialCounts = groups
            .into_iter()
            .map(|(key, agg)| (key, agg.accumulator()))
            .collect();
        partials.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(partials)
    }
}
