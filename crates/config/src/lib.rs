//! Configuration management for the game telemetry metrics pipeline
//!
//! Settings come from a properties file made of named property groups
//! (`sourceConfig`, `sinkConfig`, `processorConfig`), overridden by
//! environment variables prefixed with `TELEMETRY_` (nested keys split on
//! `__`, e.g. `TELEMETRY_SOURCE__STREAM`).

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Properties file read in local mode, relative to the working directory
pub const LOCAL_PROPERTIES_FILE: &str = "application_properties.json";

/// Properties file provided by the managed runtime when deployed
pub const DEPLOYED_PROPERTIES_FILE: &str = "/etc/flink/application_properties.json";

/// Environment variable whose presence selects local mode
pub const IS_LOCAL_ENV: &str = "IS_LOCAL";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Fixed pipeline parameters; the matching properties are recognized but may
/// only restate these values
pub const ALLOWED_LATENESS_MS: u64 = 5_000;
pub const WINDOW_SIZE_MS: u64 = 60_000;
pub const SINK_BATCH_SIZE: usize = 100;

pub const DEFAULT_MAX_RECORD_COUNT: usize = 10_000;

const SOURCE_GROUP: &str = "sourceConfig";
const SINK_GROUP: &str = "sinkConfig";
const PROCESSOR_GROUP: &str = "processorConfig";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the pipeline runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Developer machine: local properties file, block until the job completes
    Local,
    /// Managed runtime: platform properties file, report status and keep running
    #[default]
    Deployed,
}

impl RunMode {
    /// Local when `IS_LOCAL` is set to a non-empty value
    pub fn from_env() -> Self {
        match std::env::var(IS_LOCAL_ENV) {
            Ok(value) if !value.is_empty() => RunMode::Local,
            _ => RunMode::Deployed,
        }
    }

    /// Default location of the properties file for this mode
    pub fn properties_path(&self) -> PathBuf {
        match self {
            RunMode::Local => PathBuf::from(LOCAL_PROPERTIES_FILE),
            RunMode::Deployed => PathBuf::from(DEPLOYED_PROPERTIES_FILE),
        }
    }
}

/// One named group of the properties file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyGroup {
    #[serde(rename = "PropertyGroupId")]
    pub group_id: String,
    #[serde(rename = "PropertyMap")]
    pub properties: HashMap<String, String>,
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub run_mode: RunMode,

    /// Inbound event stream
    #[serde(default)]
    pub source: SourceSettings,

    /// Outbound metric stream
    #[serde(default)]
    pub sink: SinkSettings,

    /// Windowing, parallelism and checkpointing
    #[serde(default)]
    pub processor: ProcessorSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Inbound stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Stream (topic) identifier
    #[serde(default)]
    pub stream: String,

    #[serde(default)]
    pub region: String,

    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// `earliest`, `latest` or a resume token
    #[serde(default = "default_initial_position")]
    pub initial_position: String,

    /// Maximum records fetched per poll
    #[serde(default = "default_max_record_count")]
    pub max_record_count: usize,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            stream: String::new(),
            region: String::new(),
            bootstrap_servers: default_bootstrap_servers(),
            initial_position: default_initial_position(),
            max_record_count: default_max_record_count(),
            consumer_group: default_consumer_group(),
        }
    }
}

/// Outbound stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    #[serde(default)]
    pub stream: String,

    #[serde(default)]
    pub region: String,

    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    #[serde(default = "default_batch_size")]
    pub batch_max_size: usize,

    /// Flush interval for partially filled batches
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            stream: String::new(),
            region: String::new(),
            bootstrap_servers: default_bootstrap_servers(),
            batch_max_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Stream processing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    #[serde(default = "default_allowed_lateness_ms")]
    pub allowed_lateness_ms: u64,

    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,

    /// Number of keyed window workers
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Directory for checkpoints; checkpointing is off when unset
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            allowed_lateness_ms: default_allowed_lateness_ms(),
            window_size_ms: default_window_size_ms(),
            parallelism: default_parallelism(),
            checkpoint_dir: None,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logging: bool,

    /// Port of the Prometheus endpoint; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
            metrics_port: None,
        }
    }
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_initial_position() -> String {
    "latest".to_string()
}

fn default_max_record_count() -> usize {
    DEFAULT_MAX_RECORD_COUNT
}

fn default_consumer_group() -> String {
    "game-telemetry-metrics".to_string()
}

fn default_batch_size() -> usize {
    SINK_BATCH_SIZE
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_allowed_lateness_ms() -> u64 {
    ALLOWED_LATENESS_MS
}

fn default_window_size_ms() -> u64 {
    WINDOW_SIZE_MS
}

fn default_parallelism() -> usize {
    4
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_max_checkpoints() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration for the run mode selected by the environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let run_mode = RunMode::from_env();
        let path = config_path.unwrap_or_else(|| run_mode.properties_path());
        Self::load_from(&path, run_mode)
    }

    /// Load configuration from a properties file and the environment
    pub fn load_from(path: &Path, run_mode: RunMode) -> Result<Self> {
        info!(path = %path.display(), ?run_mode, "Loading configuration");

        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let groups: Vec<PropertyGroup> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::LoadError(format!("cannot parse {}: {}", path.display(), e))
        })?;

        let mut file_values = properties_to_value(&groups)?;
        file_values.insert("run_mode".to_string(), serde_json::to_value(run_mode).map_err(|e| {
            ConfigError::LoadError(e.to_string())
        })?);

        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Serialized::defaults(Value::Object(file_values)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        config.validate()?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.stream.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "missing required property 'kinesis.stream.arn' in group '{}'",
                SOURCE_GROUP
            )));
        }
        if self.sink.stream.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "missing required property 'kinesis.stream.arn' in group '{}'",
                SINK_GROUP
            )));
        }
        if self.source.max_record_count == 0 {
            return Err(ConfigError::ValidationError(
                "max record count must be greater than zero".to_string(),
            ));
        }
        require_fixed("sink batch size", self.sink.batch_max_size as u64, SINK_BATCH_SIZE as u64)?;
        require_fixed("window size", self.processor.window_size_ms, WINDOW_SIZE_MS)?;
        require_fixed(
            "allowed lateness",
            self.processor.allowed_lateness_ms,
            ALLOWED_LATENESS_MS,
        )?;
        if self.processor.parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "parallelism must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_fixed(name: &str, value: u64, fixed: u64) -> Result<()> {
    if value != fixed {
        return Err(ConfigError::ValidationError(format!(
            "{} is fixed at {}, got {}",
            name, fixed, value
        )));
    }
    Ok(())
}

/// Stream names may be given as full ARNs; the name follows `stream/`
fn stream_name(identifier: &str) -> String {
    match identifier.rsplit_once(":stream/") {
        Some((_, name)) => name.to_string(),
        None => identifier.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(group: &str, key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!(
            "property '{}' in group '{}' is not a valid number: {}",
            key, group, raw
        ))
    })
}

/// Translate the property groups into the nested layout of [`AppConfig`]
fn properties_to_value(groups: &[PropertyGroup]) -> Result<Map<String, Value>> {
    let mut root = Map::new();

    for group in groups {
        let props = &group.properties;
        let mut section = Map::new();

        match group.group_id.as_str() {
            SOURCE_GROUP => {
                let stream = props
                    .get("kinesis.stream.arn")
                    .or_else(|| props.get("kinesis.stream.name"));
                if let Some(stream) = stream {
                    section.insert("stream".into(), Value::String(stream_name(stream)));
                }
                if let Some(region) = props.get("aws.region") {
                    section.insert("region".into(), Value::String(region.clone()));
                }
                if let Some(servers) = props.get("bootstrap.servers") {
                    section.insert("bootstrap_servers".into(), Value::String(servers.clone()));
                }
                if let Some(position) = props.get("flink.stream.initpos") {
                    section.insert("initial_position".into(), Value::String(position.clone()));
                }
                if let Some(raw) = props.get("flink.stream.max_record_count") {
                    let count: usize = parse_number(SOURCE_GROUP, "flink.stream.max_record_count", raw)?;
                    section.insert("max_record_count".into(), Value::from(count));
                }
                if let Some(group_id) = props.get("consumer.group.id") {
                    section.insert("consumer_group".into(), Value::String(group_id.clone()));
                }
                root.insert("source".into(), Value::Object(section));
            }
            SINK_GROUP => {
                if let Some(stream) = props
                    .get("kinesis.stream.arn")
                    .or_else(|| props.get("kinesis.stream.name"))
                {
                    section.insert("stream".into(), Value::String(stream_name(stream)));
                }
                if let Some(region) = props.get("aws.region") {
                    section.insert("region".into(), Value::String(region.clone()));
                }
                if let Some(servers) = props.get("bootstrap.servers") {
                    section.insert("bootstrap_servers".into(), Value::String(servers.clone()));
                }
                if let Some(raw) = props.get("sink.batch.max-size") {
                    let size: usize = parse_number(SINK_GROUP, "sink.batch.max-size", raw)?;
                    section.insert("batch_max_size".into(), Value::from(size));
                }
                root.insert("sink".into(), Value::Object(section));
            }
            PROCESSOR_GROUP => {
                if let Some(raw) = props.get("parallelism") {
                    let parallelism: usize = parse_number(PROCESSOR_GROUP, "parallelism", raw)?;
                    section.insert("parallelism".into(), Value::from(parallelism));
                }
                if let Some(dir) = props.get("checkpoint.dir") {
                    section.insert("checkpoint_dir".into(), Value::String(dir.clone()));
                }
                if let Some(raw) = props.get("checkpoint.interval.secs") {
                    let secs: u64 = parse_number(PROCESSOR_GROUP, "checkpoint.interval.secs", raw)?;
                    section.insert("checkpoint_interval_secs".into(), Value::from(secs));
                }
                root.insert("processor".into(), Value::Object(section));
            }
            other => {
                debug!(group = other, "Ignoring unknown property group");
            }
        }
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const PROPERTIES: &str = r#"[
        {
            "PropertyGroupId": "sourceConfig",
            "PropertyMap": {
                "kinesis.stream.arn": "arn:aws:kinesis:us-east-1:123456789012:stream/game-events",
                "aws.region": "us-east-1",
                "flink.stream.initpos": "TRIM_HORIZON",
                "flink.stream.max_record_count": "500"
            }
        },
        {
            "PropertyGroupId": "sinkConfig",
            "PropertyMap": {
                "kinesis.stream.arn": "arn:aws:kinesis:us-east-1:123456789012:stream/game-metrics",
                "aws.region": "us-east-1"
            }
        }
    ]"#;

    #[test]
    fn test_load_property_groups() {
        Jail::expect_with(|jail| {
            jail.create_file(LOCAL_PROPERTIES_FILE, PROPERTIES)?;

            let config = AppConfig::load_from(Path::new(LOCAL_PROPERTIES_FILE), RunMode::Local)
                .map_err(|e| e.to_string())?;

            assert_eq!(config.run_mode, RunMode::Local);
            assert_eq!(config.source.stream, "game-events");
            assert_eq!(config.source.region, "us-east-1");
            assert_eq!(config.source.initial_position, "TRIM_HORIZON");
            assert_eq!(config.source.max_record_count, 500);
            assert_eq!(config.sink.stream, "game-metrics");
            assert_eq!(config.sink.batch_max_size, SINK_BATCH_SIZE);
            assert_eq!(config.processor.allowed_lateness_ms, ALLOWED_LATENESS_MS);
            assert_eq!(config.processor.window_size_ms, WINDOW_SIZE_MS);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(LOCAL_PROPERTIES_FILE, PROPERTIES)?;
            jail.set_env("TELEMETRY_SINK__STREAM", "metrics-override");
            jail.set_env("TELEMETRY_PROCESSOR__PARALLELISM", "8");

            let config = AppConfig::load_from(Path::new(LOCAL_PROPERTIES_FILE), RunMode::Local)
                .map_err(|e| e.to_string())?;

            assert_eq!(config.sink.stream, "metrics-override");
            assert_eq!(config.processor.parallelism, 8);
            Ok(())
        });
    }

    #[test]
    fn test_legacy_stream_name() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "props.json",
                r#"[
                    {"PropertyGroupId": "sourceConfig", "PropertyMap": {"kinesis.stream.name": "legacy-events"}},
                    {"PropertyGroupId": "sinkConfig", "PropertyMap": {"kinesis.stream.name": "legacy-metrics"}}
                ]"#,
            )?;

            let config = AppConfig::load_from(Path::new("props.json"), RunMode::Deployed)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.source.stream, "legacy-events");
            assert_eq!(config.sink.stream, "legacy-metrics");
            assert_eq!(config.run_mode, RunMode::Deployed);
            Ok(())
        });
    }

    #[test]
    fn test_missing_source_stream_is_fatal() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "props.json",
                r#"[{"PropertyGroupId": "sinkConfig", "PropertyMap": {"kinesis.stream.name": "m"}}]"#,
            )?;

            let err = AppConfig::load_from(Path::new("props.json"), RunMode::Local).unwrap_err();
            assert!(err.to_string().contains("sourceConfig"));
            Ok(())
        });
    }

    #[test]
    fn test_unreadable_file_is_fatal() {
        let err = AppConfig::load_from(Path::new("/nonexistent/props.json"), RunMode::Local)
            .unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "props.json",
                r#"[{"PropertyGroupId": "sourceConfig", "PropertyMap": {
                    "kinesis.stream.name": "e", "flink.stream.max_record_count": "many"}}]"#,
            )?;

            let err = AppConfig::load_from(Path::new("props.json"), RunMode::Local).unwrap_err();
            assert!(err.to_string().contains("flink.stream.max_record_count"));
            Ok(())
        });
    }

    #[test]
    fn test_stream_name_from_arn() {
        assert_eq!(
            stream_name("arn:aws:kinesis:eu-west-1:1:stream/events"),
            "events"
        );
        assert_eq!(stream_name("events"), "events");
    }

    #[test]
    fn test_run_mode_paths() {
        assert_eq!(RunMode::Local.properties_path(), PathBuf::from(LOCAL_PROPERTIES_FILE));
        assert_eq!(
            RunMode::Deployed.properties_path(),
            PathBuf::from(DEPLOYED_PROPERTIES_FILE)
        );
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());

        config.source.stream = "events".into();
        config.sink.stream = "metrics".into();
        assert!(config.validate().is_ok());

        config.processor.window_size_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fixed_parameters_cannot_change() {
        let mut config = AppConfig::default();
        config.source.stream = "events".into();
        config.sink.stream = "metrics".into();

        config.processor.allowed_lateness_ms = 10_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("allowed lateness is fixed at 5000"));

        config.processor.allowed_lateness_ms = ALLOWED_LATENESS_MS;
        config.processor.window_size_ms = 30_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sink_batch_size_property_must_match() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "props.json",
                r#"[
                    {"PropertyGroupId": "sourceConfig", "PropertyMap": {"kinesis.stream.name": "e"}},
                    {"PropertyGroupId": "sinkConfig", "PropertyMap": {
                        "kinesis.stream.name": "m", "sink.batch.max-size": "100"}}
                ]"#,
            )?;
            let config = AppConfig::load_from(Path::new("props.json"), RunMode::Local)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.sink.batch_max_size, SINK_BATCH_SIZE);

            jail.create_file(
                "props.json",
                r#"[
                    {"PropertyGroupId": "sourceConfig", "PropertyMap": {"kinesis.stream.name": "e"}},
                    {"PropertyGroupId": "sinkConfig", "PropertyMap": {
                        "kinesis.stream.name": "m", "sink.batch.max-size": "50"}}
                ]"#,
            )?;
            let err = AppConfig::load_from(Path::new("props.json"), RunMode::Local).unwrap_err();
            assert!(err.to_string().contains("sink batch size is fixed at 100"));

            jail.create_file(
                "props.json",
                r#"[
                    {"PropertyGroupId": "sourceConfig", "PropertyMap": {"kinesis.stream.name": "e"}},
                    {"PropertyGroupId": "sinkConfig", "PropertyMap": {"kinesis.stream.name": "m"}}
                ]"#,
            )?;
            jail.set_env("TELEMETRY_PROCESSOR__WINDOW_SIZE_MS", "30000");
            let err = AppConfig::load_from(Path::new("props.json"), RunMode::Local).unwrap_err();
            assert!(err.to_string().contains("window size is fixed at 60000"));
            Ok(())
        });
    }
}
