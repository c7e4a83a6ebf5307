//! End-to-end tests of the aggregation pipeline over in-memory connectors

use serde_json::json;
use std::time::Duration;
use telemetry_processor::connector::{MemorySink, MemorySource, StartingPosition};
use telemetry_processor::{PipelineHandle, ProcessorConfig, StreamPipelineBuilder};
use telemetry_types::{EventRecord, GameEvent, MetricName, MetricRecord};

const APP: &str = "app-1";

fn event(id: &str, event_type: &str, timestamp: i64) -> EventRecord {
    EventRecord::new(GameEvent::new(id, event_type, timestamp), APP)
}

fn knockout(id: &str, spell: &str, timestamp: i64) -> EventRecord {
    EventRecord::new(
        GameEvent::new(id, "user_knockout", timestamp).with_event_data(json!({ "spell_id": spell })),
        APP,
    )
}

fn purchase(id: &str, currency: Option<&str>, timestamp: i64) -> EventRecord {
    let data = match currency {
        Some(currency) => json!({ "currency_type": currency, "amount": 5 }),
        None => json!({ "amount": 5 }),
    };
    EventRecord::new(
        GameEvent::new(id, "iap_transaction", timestamp).with_event_data(data),
        APP,
    )
}

fn records_for(records: &[MetricRecord], metric: MetricName) -> Vec<MetricRecord> {
    let mut matching: Vec<MetricRecord> = records
        .iter()
        .filter(|r| r.metric_name == metric.as_str())
        .cloned()
        .collect();
    matching.sort_by_key(|r| (r.window_start_ms(), r.spell_id.clone(), r.currency_type.clone()));
    matching
}

fn fast_config() -> ProcessorConfig {
    let mut config = ProcessorConfig::default();
    config.parallelism = 2;
    config.sink.flush_interval_ms = 20;
    config.sink.base_backoff_ms = 1;
    config.sink.max_backoff_ms = 5;
    config
}

async fn start(source: &MemorySource, sink: &MemorySink) -> PipelineHandle {
    StreamPipelineBuilder::new()
        .with_config(fast_config())
        .with_source(source.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

/// Poll until `ready` holds, failing the test after a few seconds
async fn wait_until(handle: &PipelineHandle, ready: impl Fn(&PipelineHandle) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !ready(handle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline did not reach the expected state");
}

#[tokio::test]
async fn test_counts_events_per_window() {
    let source = MemorySource::new(2);
    source.push_event(0, &event("a", "login", 1_000)).unwrap();
    source.push_event(1, &event("b", "login", 2_000)).unwrap();
    source.push_event(0, &event("c", "level_start", 3_000)).unwrap();
    source.push_event(1, &event("d", "login", 61_000)).unwrap();

    let sink = MemorySink::new();
    let stats = start(&source, &sink).await.wait().await.unwrap();

    let records = sink.records();
    let totals = records_for(&records, MetricName::TotalEvents);
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[0].window_start_ms(), 0);
    assert_eq!(totals[0].metric_unit_value_int, 3);
    assert_eq!(totals[1].window_start_ms(), 60_000);
    assert_eq!(totals[1].metric_unit_value_int, 1);

    let logins = records_for(&records, MetricName::TotalLogins);
    assert_eq!(logins.len(), 2);
    assert_eq!(logins[0].metric_unit_value_int, 2);
    assert_eq!(logins[1].metric_unit_value_int, 1);

    assert_eq!(totals[0].application_id.as_deref(), Some(APP));
    assert_eq!(totals[0].metric_unit, "Count");
    assert_eq!(totals[0].output_type, "metrics");

    assert_eq!(stats.events_ingested, 4);
    assert_eq!(stats.records_emitted, records.len() as u64);
    assert_eq!(stats.partition_watermarks.len(), 2);
}

#[tokio::test]
async fn test_end_to_end_example_across_partitions() {
    let source = MemorySource::new(2);
    source.push_event(0, &event("A", "login", 0)).unwrap();
    source.push_event(1, &event("A", "login", 0)).unwrap();
    source.push_event(1, &event("B", "login", 30_000)).unwrap();
    source.push_event(0, &event("C", "other", 59_999)).unwrap();

    let sink = MemorySink::new();
    let stats = start(&source, &sink).await.wait().await.unwrap();
    let records = sink.records();

    let totals = records_for(&records, MetricName::TotalEvents);
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].window_start_ms(), 0);
    assert_eq!(totals[0].metric_unit_value_int, 3);

    let logins = records_for(&records, MetricName::TotalLogins);
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].window_start_ms(), 0);
    assert_eq!(logins[0].metric_unit_value_int, 2);

    assert_eq!(records.len(), 2);
    assert_eq!(stats.events_duplicate, 1);
    assert!(stats.windows_closed >= 1);
}

#[tokio::test]
async fn test_window_boundary_and_watermark_lateness() {
    let source = MemorySource::new(1);
    source.push_event(0, &event("a", "login", 59_999)).unwrap();
    // On the boundary: first instant of the next window
    source.push_event(0, &event("b", "login", 60_000)).unwrap();
    // Watermark reaches 60s and closes [0, 60s)
    source.push_event(0, &event("c", "login", 65_000)).unwrap();
    source.push_event(0, &event("d", "login", 59_999)).unwrap();
    // Equal to the watermark is still on time
    source.push_event(0, &event("e", "login", 60_000)).unwrap();

    let mut config = fast_config();
    config.max_records_per_poll = 1;
    let sink = MemorySink::new();
    let stats = StreamPipelineBuilder::new()
        .with_config(config)
        .with_source(source.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(stats.events_late_dropped, 1);
    let totals = records_for(&sink.records(), MetricName::TotalEvents);
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[0].window_start_ms(), 0);
    assert_eq!(totals[0].metric_unit_value_int, 1);
    assert_eq!(totals[1].window_start_ms(), 60_000);
    assert_eq!(totals[1].metric_unit_value_int, 3);
}

#[tokio::test]
async fn test_duplicates_count_once_per_window() {
    let source = MemorySource::new(2);
    source.push_event(0, &event("a", "login", 1_000)).unwrap();
    // Redelivery on another shard
    source.push_event(1, &event("a", "login", 1_500)).unwrap();
    source.push_event(0, &event("b", "login", 2_000)).unwrap();
    // Same id in a later window is a distinct occurrence
    source.push_event(1, &event("a", "login", 65_000)).unwrap();

    let sink = MemorySink::new();
    let stats = start(&source, &sink).await.wait().await.unwrap();

    let totals = records_for(&sink.records(), MetricName::TotalEvents);
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[0].metric_unit_value_int, 2);
    assert_eq!(totals[1].metric_unit_value_int, 1);
    assert_eq!(stats.events_duplicate, 1);
}

#[tokio::test]
async fn test_late_events_are_dropped() {
    let source = MemorySource::new(1);
    source.push_event(0, &event("a", "login", 100_000)).unwrap();
    // Behind the watermark of 95s
    source.push_event(0, &event("b", "login", 10_000)).unwrap();
    source.push_event(0, &event("c", "login", 97_000)).unwrap();

    let mut config = fast_config();
    config.max_records_per_poll = 1;
    let sink = MemorySink::new();
    let stats = StreamPipelineBuilder::new()
        .with_config(config)
        .with_source(source.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(stats.events_late_dropped, 1);
    let totals = records_for(&sink.records(), MetricName::TotalEvents);
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].window_start_ms(), 60_000);
    assert_eq!(totals[0].metric_unit_value_int, 2);
}

#[tokio::test]
async fn test_dimension_queries_apply_having_threshold() {
    let source = MemorySource::new(1);
    source.push_event(0, &knockout("k1", "fireball", 1_000)).unwrap();
    source.push_event(0, &knockout("k2", "fireball", 2_000)).unwrap();
    source.push_event(0, &knockout("k3", "frostbolt", 3_000)).unwrap();
    source.push_event(0, &purchase("p1", Some("gold"), 4_000)).unwrap();
    source.push_event(0, &purchase("p2", Some("gold"), 5_000)).unwrap();
    source.push_event(0, &purchase("p3", Some("gems"), 6_000)).unwrap();
    // Null currency never forms a group
    source.push_event(0, &purchase("p4", None, 7_000)).unwrap();
    source.push_event(0, &purchase("p5", None, 8_000)).unwrap();

    let sink = MemorySink::new();
    start(&source, &sink).await.wait().await.unwrap();
    let records = sink.records();

    let knockouts = records_for(&records, MetricName::KnockoutsBySpell);
    assert_eq!(knockouts.len(), 1);
    assert_eq!(knockouts[0].spell_id.as_deref(), Some("fireball"));
    assert_eq!(knockouts[0].metric_unit_value_int, 2);

    let purchases = records_for(&records, MetricName::Purchases);
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].currency_type.as_deref(), Some("gold"));
    assert_eq!(purchases[0].metric_unit_value_int, 2);

    let totals = records_for(&records, MetricName::TotalEvents);
    assert_eq!(totals[0].metric_unit_value_int, 8);
    assert!(records_for(&records, MetricName::TotalLogins).is_empty());
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let source = MemorySource::new(1);
    source.push(0, "not json").unwrap();
    source.push(0, r#"{"event": {"event_type": "login"}}"#).unwrap();
    source.push_event(0, &event("a", "login", 1_000)).unwrap();

    let sink = MemorySink::new();
    let stats = start(&source, &sink).await.wait().await.unwrap();

    assert_eq!(stats.events_malformed, 2);
    assert_eq!(stats.events_ingested, 1);
    let totals = records_for(&sink.records(), MetricName::TotalEvents);
    assert_eq!(totals[0].metric_unit_value_int, 1);
}

#[tokio::test]
async fn test_sink_batches_and_retries() {
    let source = MemorySource::new(1);
    for minute in 0..5i64 {
        source
            .push_event(0, &event(&format!("e{}", minute), "login", minute * 60_000 + 1))
            .unwrap();
    }

    let sink = MemorySink::new();
    sink.fail_next(2);
    let mut config = fast_config();
    config.sink.batch_size = 3;
    let stats = StreamPipelineBuilder::new()
        .with_config(config)
        .with_source(source.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    // TotalEvents and TotalLogins for five windows
    assert_eq!(sink.records().len(), 10);
    assert!(sink.batch_sizes().iter().all(|&size| size > 0 && size <= 3));
    assert_eq!(sink.batch_sizes().iter().sum::<usize>(), 10);
    assert_eq!(stats.sink_retries, 2);
    assert_eq!(sink.attempts(), sink.batch_sizes().len() as u64 + 2);
    assert_eq!(stats.sink_batches, sink.batch_sizes().len() as u64);
}

#[tokio::test]
async fn test_sink_failure_fails_pipeline() {
    let source = MemorySource::new(1);
    source.push_event(0, &event("a", "login", 1_000)).unwrap();

    let sink = MemorySink::new();
    sink.fail_next(u32::MAX);
    let mut config = fast_config();
    config.sink.max_retries = 2;
    let result = StreamPipelineBuilder::new()
        .with_config(config)
        .with_source(source.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
        .wait()
        .await;

    assert!(result.is_err());
    assert!(sink.records().is_empty());
    assert_eq!(sink.attempts(), 3);
}

#[tokio::test]
async fn test_cancel_abandons_open_windows() {
    let source = MemorySource::unbounded(1);
    source.push_event(0, &event("a", "login", 1_000)).unwrap();
    source.push_event(0, &event("b", "login", 2_000)).unwrap();

    let sink = MemorySink::new();
    let handle = start(&source, &sink).await;
    wait_until(&handle, |h| h.stats().events_ingested == 2).await;
    assert!(!handle.is_finished());

    // Checkpointing is not configured
    assert!(handle.trigger_checkpoint().await.is_err());

    handle.cancel();
    let stats = handle.wait().await.unwrap();
    assert!(sink.records().is_empty());
    assert_eq!(stats.windows_closed, 0);
    assert_eq!(stats.partition_watermarks.get(&0), Some(&-3_000));
}

/// Two unbounded partitions where p1 runs far ahead; p0 holds the global
/// watermark at -4s so nothing may close
fn skewed_partitions() -> MemorySource {
    let source = MemorySource::unbounded(2);
    source.push_event(0, &event("a", "login", 1_000)).unwrap();
    source.push_event(1, &event("b", "login", 200_000)).unwrap();
    source
}

async fn wait_for_skew(handle: &PipelineHandle) {
    wait_until(handle, |h| {
        let stats = h.stats();
        stats.events_ingested == 2 && stats.partition_watermarks.len() == 2
    })
    .await;
}

#[tokio::test]
async fn test_cancel_with_partitions_at_different_watermarks() {
    for _ in 0..10 {
        let source = skewed_partitions();
        let sink = MemorySink::new();
        let handle = start(&source, &sink).await;
        wait_for_skew(&handle).await;

        handle.cancel();
        let stats = handle.wait().await.unwrap();
        assert!(sink.records().is_empty(), "emitted {:?}", sink.records());
        assert_eq!(stats.windows_closed, 0);
        assert_eq!(stats.partition_watermarks.get(&0), Some(&-4_000));
        assert_eq!(stats.partition_watermarks.get(&1), Some(&195_000));
    }
}

#[tokio::test]
async fn test_cancel_with_checkpoint_never_reemits_window() {
    let dir = tempfile::tempdir().unwrap();
    let first = skewed_partitions();
    let sink = MemorySink::new();
    let handle = StreamPipelineBuilder::new()
        .with_config(fast_config())
        .with_source(first.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .with_checkpoint_dir(dir.path())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    wait_for_skew(&handle).await;

    handle.cancel();
    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.checkpoints_completed, 1);
    assert_eq!(stats.windows_closed, 0);
    assert!(sink.records().is_empty());

    // Replay of the same log with one more event on p0
    let second = MemorySource::new(2);
    second.push_event(0, &event("a", "login", 1_000)).unwrap();
    second.push_event(1, &event("b", "login", 200_000)).unwrap();
    second.push_event(0, &event("c", "login", 2_000)).unwrap();

    let handle = StreamPipelineBuilder::new()
        .with_config(fast_config())
        .with_source(second.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .with_checkpoint_dir(dir.path())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(handle.stats().restored_from, Some(1));
    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.events_ingested, 1);

    let totals = records_for(&sink.records(), MetricName::TotalEvents);
    let first_window: Vec<i64> = totals
        .iter()
        .filter(|r| r.window_start_ms() == 0)
        .map(|r| r.metric_unit_value_int)
        .collect();
    assert_eq!(first_window, vec![2]);
    assert_eq!(totals.len(), 2);
    assert_eq!(totals[1].window_start_ms(), 180_000);
    assert_eq!(totals[1].metric_unit_value_int, 1);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    let first = MemorySource::unbounded(1);
    first.push_event(0, &event("a", "login", 1_000)).unwrap();
    first.push_event(0, &event("b", "level_start", 2_000)).unwrap();

    let sink = MemorySink::new();
    let handle = StreamPipelineBuilder::new()
        .with_config(fast_config())
        .with_source(first.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .with_checkpoint_dir(dir.path())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(handle.stats().restored_from, None);

    wait_until(&handle, |h| h.stats().events_ingested == 2).await;
    assert_eq!(handle.trigger_checkpoint().await.unwrap(), 1);

    // Cancelling takes a final checkpoint
    handle.cancel();
    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.checkpoints_completed, 2);
    assert!(sink.records().is_empty());

    // Same log, now bounded, with one more event and a redelivery of `a`
    let second = MemorySource::new(1);
    second.push_event(0, &event("a", "login", 1_000)).unwrap();
    second.push_event(0, &event("b", "level_start", 2_000)).unwrap();
    second.push_event(0, &event("c", "login", 3_000)).unwrap();
    second.push_event(0, &event("a", "login", 1_500)).unwrap();

    let handle = StreamPipelineBuilder::new()
        .with_config(fast_config())
        .with_source(second.clone())
        .with_sink(sink.clone())
        .with_starting_position(StartingPosition::Earliest)
        .with_checkpoint_dir(dir.path())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(handle.stats().restored_from, Some(2));

    let stats = handle.wait().await.unwrap();
    assert_eq!(stats.events_ingested, 2);

    let records = sink.records();
    let totals = records_for(&records, MetricName::TotalEvents);
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].metric_unit_value_int, 3);
    let logins = records_for(&records, MetricName::TotalLogins);
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].metric_unit_value_int, 2);
}
