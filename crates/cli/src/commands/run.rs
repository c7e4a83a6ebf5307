//! Run command - start the aggregation pipeline
//!
//! Reads events from the configured source stream, aggregates them into
//! per-minute metric records and writes them to the sink stream until the
//! source ends or the process receives Ctrl-C.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use telemetry_config::{AppConfig, RunMode};
use telemetry_processor::config::{
    CheckpointConfig, ProcessorConfig, SinkAdapterConfig, WindowConfig,
};
use telemetry_processor::metrics::{
    MetricsRegistry, MetricsServer, MetricsServerConfig, PipelineMetrics,
};
use telemetry_processor::{
    KafkaMetricSink, KafkaSinkConfig, KafkaSource, KafkaSourceConfig, PipelineHandle,
    PipelineStats, StartingPosition, StreamPipelineBuilder,
};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// How often a deployed pipeline logs its progress
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Override the source starting position (earliest, latest or a resume token)
    #[arg(long, value_name = "POSITION")]
    pub starting_position: Option<String>,

    /// Override the checkpoint directory
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this port
    #[arg(long, value_name = "PORT")]
    pub metrics_port: Option<u16>,

    /// Disable checkpointing even when a directory is configured
    #[arg(long)]
    pub no_checkpoints: bool,
}

impl RunArgs {
    pub async fn execute(&self, config: AppConfig) -> Result<()> {
        let processor = self.processor_config(&config);
        let starting_position: StartingPosition = self
            .starting_position
            .as_deref()
            .unwrap_or(&config.source.initial_position)
            .parse()
            .context("invalid starting position")?;

        let metrics = PipelineMetrics::register(&MetricsRegistry::global(), &config.source.stream);
        if let Some(port) = self.metrics_port.or(config.observability.metrics_port) {
            let server = MetricsServer::new(MetricsServerConfig::new("0.0.0.0", port));
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!(error = %e, "Metrics server stopped");
                }
            });
        }

        let source = KafkaSource::new(source_config(&config));
        let sink = KafkaMetricSink::new(sink_config(&config))
            .context("failed to create the sink producer")?;

        info!(
            source = %config.source.stream,
            sink = %config.sink.stream,
            %starting_position,
            parallelism = processor.parallelism,
            "Starting pipeline"
        );

        let handle = StreamPipelineBuilder::new()
            .with_config(processor)
            .with_source(source)
            .with_sink(sink)
            .with_starting_position(starting_position)
            .with_metrics(metrics)
            .build()?
            .start()
            .await?;

        if let Some(checkpoint) = handle.stats().restored_from {
            println!("{} checkpoint {}", "Restored".green().bold(), checkpoint);
        }

        let stats = match config.run_mode {
            RunMode::Local => run_local(handle).await?,
            RunMode::Deployed => run_deployed(handle).await?,
        };

        print_summary(&stats);
        Ok(())
    }

    fn processor_config(&self, config: &AppConfig) -> ProcessorConfig {
        let settings = &config.processor;
        let dir = if self.no_checkpoints {
            None
        } else {
            self.checkpoint_dir.clone().or_else(|| settings.checkpoint_dir.clone())
        };

        ProcessorConfig {
            window: WindowConfig {
                size_ms: settings.window_size_ms,
                allowed_lateness_ms: settings.allowed_lateness_ms,
            },
            sink: SinkAdapterConfig {
                batch_size: config.sink.batch_max_size,
                flush_interval_ms: config.sink.flush_interval_ms,
                ..SinkAdapterConfig::default()
            },
            checkpoint: CheckpointConfig {
                dir,
                interval_ms: (settings.checkpoint_interval_secs > 0)
                    .then(|| settings.checkpoint_interval_secs * 1_000),
                max_checkpoints: settings.max_checkpoints,
            },
            parallelism: settings.parallelism,
            max_records_per_poll: config.source.max_record_count,
            ..ProcessorConfig::default()
        }
    }
}

fn source_config(config: &AppConfig) -> KafkaSourceConfig {
    let mut source = KafkaSourceConfig::new(
        config.source.bootstrap_servers.clone(),
        config.source.stream.clone(),
    );
    source.group_id = config.source.consumer_group.clone();
    source.region = Some(config.source.region.clone()).filter(|r| !r.is_empty());
    source
}

fn sink_config(config: &AppConfig) -> KafkaSinkConfig {
    let mut sink = KafkaSinkConfig::new(
        config.sink.bootstrap_servers.clone(),
        config.sink.stream.clone(),
    );
    sink.region = Some(config.sink.region.clone()).filter(|r| !r.is_empty());
    sink
}

/// Block until the job completes, cancelling on Ctrl-C
async fn run_local(handle: PipelineHandle) -> Result<PipelineStats> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            println!("{}", "Stopping pipeline...".yellow());
            handle.cancel();
        }
        _ = wait_finished(&handle) => {}
    }
    Ok(handle.wait().await?)
}

/// Keep running and report progress until cancelled or the source ends
async fn run_deployed(handle: PipelineHandle) -> Result<PipelineStats> {
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!(error = %e, "Signal handler failed");
                }
                info!("Shutdown requested");
                handle.cancel();
                break;
            }
            _ = status.tick() => {
                if handle.is_finished() {
                    break;
                }
                let stats = handle.stats();
                info!(
                    events = stats.events_ingested,
                    records = stats.records_emitted,
                    late = stats.events_late_dropped,
                    watermark = ?stats.watermark,
                    checkpoints = stats.checkpoints_completed,
                    "Pipeline running"
                );
            }
        }
    }
    Ok(handle.wait().await?)
}

async fn wait_finished(handle: &PipelineHandle) {
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    while !handle.is_finished() {
        poll.tick().await;
    }
}

fn print_summary(stats: &PipelineStats) {
    println!();
    println!("{}", "Pipeline Summary".bold().cyan());
    println!("{}", "-".repeat(40));
    println!("  Events ingested:     {}", stats.events_ingested);
    println!("  Malformed records:   {}", stats.events_malformed);
    println!("  Duplicates absorbed: {}", stats.events_duplicate);
    println!("  Late events dropped: {}", stats.events_late_dropped);
    println!("  Windows closed:      {}", stats.windows_closed);
    println!("  Records emitted:     {}", stats.records_emitted);
    println!("  Sink retries:        {}", stats.sink_retries);
    println!("  Checkpoints:         {}", stats.checkpoints_completed);
    match stats.watermark {
        Some(watermark) => println!("  Final watermark:     {}", watermark),
        None => println!("  Final watermark:     {}", "none".dimmed()),
    }
    for (partition, watermark) in &stats.partition_watermarks {
        println!("    partition {:<4}       {}", partition, watermark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_config_from_settings() {
        let mut config = AppConfig::default();
        config.processor.checkpoint_dir = Some(PathBuf::from("/data/checkpoints"));
        config.processor.checkpoint_interval_secs = 30;

        let processor = RunArgs::default().processor_config(&config);
        assert_eq!(processor.window.size_ms, 60_000);
        assert_eq!(processor.window.allowed_lateness_ms, 5_000);
        assert_eq!(processor.sink.batch_size, 100);
        assert_eq!(processor.checkpoint.interval_ms, Some(30_000));
        assert_eq!(
            processor.checkpoint.dir.as_deref(),
            Some(std::path::Path::new("/data/checkpoints"))
        );
        assert!(processor.validate().is_ok());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = AppConfig::default();
        config.processor.checkpoint_dir = Some(PathBuf::from("/data/checkpoints"));
        config.processor.checkpoint_interval_secs = 0;

        let args = RunArgs {
            no_checkpoints: true,
            ..RunArgs::default()
        };
        let processor = args.processor_config(&config);
        assert!(processor.checkpoint.dir.is_none());
        assert!(processor.checkpoint.interval_ms.is_none());

        let args = RunArgs {
            checkpoint_dir: Some(PathBuf::from("/tmp/override")),
            ..RunArgs::default()
        };
        let processor = args.processor_config(&config);
        assert_eq!(
            processor.checkpoint.dir.as_deref(),
            Some(std::path::Path::new("/tmp/override"))
        );
    }

    #[test]
    fn test_region_is_optional() {
        let mut config = AppConfig::default();
        config.source.stream = "game-events".to_string();
        config.source.region = String::new();
        config.sink.region = "us-east-1".to_string();

        assert!(source_config(&config).region.is_none());
        assert_eq!(sink_config(&config).region.as_deref(), Some("us-east-1"));
        assert_eq!(source_config(&config).topic, "game-events");
    }
}
