//! Metric records written to the outbound stream

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit attached to every count metric
pub const METRIC_UNIT_COUNT: &str = "Count";

/// Output type tag carried by every metric record
pub const OUTPUT_TYPE_METRICS: &str = "metrics";

/// Names of the metrics produced by the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricName {
    TotalEvents,
    TotalLogins,
    KnockoutsBySpell,
    /// Purchases per currency type
    Purchases,
}

impl MetricName {
    pub const ALL: [MetricName; 4] = [
        MetricName::TotalEvents,
        MetricName::TotalLogins,
        MetricName::KnockoutsBySpell,
        MetricName::Purchases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::TotalEvents => "TotalEvents",
            MetricName::TotalLogins => "TotalLogins",
            MetricName::KnockoutsBySpell => "KnockoutsBySpell",
            MetricName::Purchases => "Purchases",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregated value for a (window, grouping key) pair
///
/// Field names on the wire follow the column names of the downstream metrics
/// table, so the JSON can be loaded without a mapping step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MetricRecord {
    pub metric_name: String,
    /// Start of the window the value covers
    #[serde(with = "iso_millis")]
    pub metric_timestamp: DateTime<Utc>,
    pub metric_unit_value_int: i64,
    pub metric_unit: String,
    #[serde(rename = "DIMENSION_APPLICATION_ID")]
    pub application_id: Option<String>,
    #[serde(rename = "DIMENSION_APP_VERSION")]
    pub app_version: Option<String>,
    #[serde(rename = "DIMENSION_COUNTRY_ID")]
    pub country_id: Option<String>,
    #[serde(rename = "DIMENSION_CURRENCY_TYPE")]
    pub currency_type: Option<String>,
    #[serde(rename = "DIMENSION_SPELL_ID")]
    pub spell_id: Option<String>,
    #[serde(rename = "DIMENSION_MISSION_ID")]
    pub mission_id: Option<String>,
    #[serde(rename = "DIMENSION_ITEM_ID")]
    pub item_id: Option<String>,
    pub output_type: String,
}

impl MetricRecord {
    /// Create a count record for the window starting at `window_start_ms`
    pub fn count(metric_name: MetricName, window_start_ms: i64, value: i64) -> Self {
        let metric_timestamp = Utc
            .timestamp_millis_opt(window_start_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            metric_name: metric_name.as_str().to_string(),
            metric_timestamp,
            metric_unit_value_int: value,
            metric_unit: METRIC_UNIT_COUNT.to_string(),
            application_id: None,
            app_version: None,
            country_id: None,
            currency_type: None,
            spell_id: None,
            mission_id: None,
            item_id: None,
            output_type: OUTPUT_TYPE_METRICS.to_string(),
        }
    }

    pub fn with_application(
        mut self,
        application_id: Option<String>,
        app_version: Option<String>,
    ) -> Self {
        self.application_id = application_id;
        self.app_version = app_version;
        self
    }

    pub fn with_spell_id(mut self, spell_id: Option<String>) -> Self {
        self.spell_id = spell_id;
        self
    }

    pub fn with_currency_type(mut self, currency_type: Option<String>) -> Self {
        self.currency_type = currency_type;
        self
    }

    /// Partition key used on the outbound stream
    pub fn partition_key(&self) -> &str {
        &self.metric_name
    }

    /// Window start in epoch milliseconds
    pub fn window_start_ms(&self) -> i64 {
        self.metric_timestamp.timestamp_millis()
    }
}

mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
