use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, OnceLock};

use super::MetricsError;

/// Metric name prefix of every pipeline series
const PREFIX: &str = "telemetry";

/// Label naming the source stream a pipeline reads
const STREAM_LABEL: &str = "source_stream";

/// Prometheus registry the pipeline counters are exported from
///
/// Clones share one registry. The binary uses [`MetricsRegistry::global`];
/// tests build private instances.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry served by the metrics endpoint
    pub fn global() -> Arc<MetricsRegistry> {
        static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    /// Encode every registered series in the OpenMetrics text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner.read())
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;
        Ok(buffer)
    }
}

/// Counters updated by the pipeline tasks
///
/// Clones share the underlying atomics.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub events_ingested: Counter,
    pub events_malformed: Counter,
    pub events_late_dropped: Counter,
    pub events_duplicate: Counter,
    pub windows_closed: Counter,
    pub records_emitted: Counter,
    pub sink_batches: Counter,
    pub sink_retries: Counter,
    pub checkpoints_completed: Counter,
    pub global_watermark: Gauge<i64, AtomicI64>,
}

impl PipelineMetrics {
    /// Counters that are not exported anywhere
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters exported through `registry`, labelled with the stream they read
    pub fn register(registry: &MetricsRegistry, source_stream: &str) -> Self {
        let metrics = Self::new();
        let mut inner = registry.inner.write();
        let registry = inner
            .sub_registry_with_prefix(PREFIX)
            .sub_registry_with_label((STREAM_LABEL.into(), source_stream.to_string().into()));

        let counters = [
            ("events_ingested", "Events decoded from the source", &metrics.events_ingested),
            ("events_malformed", "Source records that could not be decoded", &metrics.events_malformed),
            (
                "events_late_dropped",
                "Events dropped for arriving behind the watermark",
                &metrics.events_late_dropped,
            ),
            (
                "events_duplicate",
                "Duplicate deliveries absorbed by deduplication",
                &metrics.events_duplicate,
            ),
            ("windows_closed", "Window buffers closed by the watermark", &metrics.windows_closed),
            ("records_emitted", "Metric records written to the sink", &metrics.records_emitted),
            ("sink_batches", "Batches written to the sink", &metrics.sink_batches),
            (
                "sink_retries",
                "Sink writes retried after a transient failure",
                &metrics.sink_retries,
            ),
            (
                "checkpoints_completed",
                "Checkpoints written to disk",
                &metrics.checkpoints_completed,
            ),
        ];
        for (name, help, counter) in counters {
            registry.register(name, help, counter.clone());
        }
        registry.register(
            "global_watermark_ms",
            "Smallest window worker watermark in epoch milliseconds",
            metrics.global_watermark.clone(),
        );

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let clone = metrics.clone();
        clone.events_ingested.inc();
        clone.events_ingested.inc_by(2);
        assert_eq!(metrics.events_ingested.get(), 3);
    }

    #[test]
    fn test_registered_metrics_carry_stream_label() {
        let registry = MetricsRegistry::new();
        let metrics = PipelineMetrics::register(&registry, "game-events");
        metrics.events_late_dropped.inc();
        metrics.global_watermark.set(60_000);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"telemetry_events_late_dropped_total{source_stream="game-events"} 1"#));
        assert!(text.contains(r#"telemetry_global_watermark_ms{source_stream="game-events"} 60000"#));
    }

    #[test]
    fn test_pipelines_share_a_registry() {
        let registry = MetricsRegistry::new();
        let first = PipelineMetrics::register(&registry.clone(), "stream-a");
        let second = PipelineMetrics::register(&registry, "stream-b");
        first.records_emitted.inc_by(2);
        second.records_emitted.inc();

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"telemetry_records_emitted_total{source_stream="stream-a"} 2"#));
        assert!(text.contains(r#"telemetry_records_emitted_total{source_stream="stream-b"} 1"#));
    }

    #[test]
    fn test_global_registry_is_shared() {
        assert!(Arc::ptr_eq(&MetricsRegistry::global(), &MetricsRegistry::global()));
    }

    #[test]
    fn test_empty_registry_encodes() {
        assert_eq!(MetricsRegistry::new().encode().unwrap().trim(), "# EOF");
    }
}
