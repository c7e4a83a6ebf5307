//! Pipeline execution
//!
//! [`StreamPipeline::start`] restores the newest checkpoint, opens the source
//! shards and spawns the stage tasks:
//!
//! ```text
//! partition readers --hash(event_id)--> window workers --partials--> query tasks --> sink adapter
//!          \_____________________ checkpoint coordinator ______________________/
//! ```
//!
//! The returned [`PipelineHandle`] cancels the pipeline, triggers
//! checkpoints, reads statistics and waits for completion.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::barrier::AlignedReceiver;
use super::coordinator::{CheckpointCoordinator, CoordinatorChannels, Shutdown, Topology};
use super::messages::{ControlCommand, QueryInput, WorkerInput};
use super::partition::{route, PartitionReader, WorkerOutputs};
use super::query::QueryTask;
use super::sink::SinkAdapter;
use super::window_worker::WindowWorker;
use crate::aggregation::{QueryDefinition, WindowAggregate};
use crate::config::ProcessorConfig;
use crate::connector::{EventSource, MetricSink, StartingPosition};
use crate::core::EventTimeAssigner;
use crate::deduplication::WindowDeduplicator;
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;
use crate::state::{CheckpointStore, PipelineSnapshot};
use crate::watermark::{Watermark, WatermarkTracker};
use crate::window::TumblingWindowAssigner;

/// Capacity of the coordinator command and control channels
const CONTROL_CHANNEL_SIZE: usize = 16;

/// Counters of a running or finished pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub events_ingested: u64,
    pub events_malformed: u64,
    pub events_late_dropped: u64,
    pub events_duplicate: u64,
    pub windows_closed: u64,
    pub records_emitted: u64,
    pub sink_batches: u64,
    pub sink_retries: u64,
    pub checkpoints_completed: u64,
    /// Last global watermark the queries advanced to
    pub watermark: Option<i64>,
    /// Latest watermark of each partition that has produced one
    pub partition_watermarks: BTreeMap<u32, i64>,
    /// Checkpoint the pipeline resumed from
    pub restored_from: Option<u64>,
}

impl PipelineStats {
    pub fn from_metrics(metrics: &PipelineMetrics) -> Self {
        let watermark = metrics.global_watermark.get();
        Self {
            events_ingested: metrics.events_ingested.get(),
            events_malformed: metrics.events_malformed.get(),
            events_late_dropped: metrics.events_late_dropped.get(),
            events_duplicate: metrics.events_duplicate.get(),
            windows_closed: metrics.windows_closed.get(),
            records_emitted: metrics.records_emitted.get(),
            sink_batches: metrics.sink_batches.get(),
            sink_retries: metrics.sink_retries.get(),
            checkpoints_completed: metrics.checkpoints_completed.get(),
            watermark: (watermark != Watermark::min().timestamp).then_some(watermark),
            partition_watermarks: BTreeMap::new(),
            restored_from: None,
        }
    }
}

/// A configured pipeline, ready to start
///
/// Built with [`StreamPipelineBuilder`](super::StreamPipelineBuilder).
pub struct StreamPipeline {
    pub(crate) config: ProcessorConfig,
    pub(crate) source: Box<dyn EventSource>,
    pub(crate) sink: Box<dyn MetricSink>,
    pub(crate) starting_position: StartingPosition,
    pub(crate) checkpoints: Option<CheckpointStore>,
    pub(crate) metrics: PipelineMetrics,
    pub(crate) queries: Vec<QueryDefinition>,
}

impl StreamPipeline {
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn queries(&self) -> &[QueryDefinition] {
        &self.queries
    }

    /// Restore the newest checkpoint, if any, and spawn every stage
    ///
    /// A checkpoint that cannot be read fails the start; the pipeline never
    /// silently falls back to an empty state.
    pub async fn start(self) -> Result<PipelineHandle> {
        let StreamPipeline {
            config,
            mut source,
            sink,
            starting_position,
            checkpoints,
            metrics,
            queries,
        } = self;

        let snapshot = match &checkpoints {
            Some(store) => store.latest().await?,
            None => None,
        };
        let position = match &snapshot {
            Some(snapshot) if !snapshot.resume_token().offsets().is_empty() => {
                StartingPosition::Resume(snapshot.resume_token())
            }
            _ => starting_position,
        };
        let restored_from = snapshot.as_ref().map(|s| s.checkpoint_id);
        info!(%position, ?restored_from, "Starting pipeline");

        let readers = source.open_shards(&position).await?;
        if readers.is_empty() {
            return Err(ProcessorError::Configuration {
                source: "the source has no shards".into(),
            });
        }
        let partitions: Vec<u32> = readers.iter().map(|r| r.partition()).collect();

        let parallelism = config.parallelism;
        let query_count = queries.len();
        let restored_watermark = snapshot
            .as_ref()
            .map(PipelineSnapshot::watermark)
            .unwrap_or_else(Watermark::min);
        metrics.global_watermark.set(restored_watermark.timestamp);
        let partition_watermarks: Arc<DashMap<u32, i64>> = Arc::new(DashMap::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);
        let shutdown = Arc::new(shutdown_tx);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (command_tx, _) = broadcast::channel(CONTROL_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);

        let (sink_tx, sink_rx) = mpsc::channel(config.buffer_size);
        let (query_txs, query_rxs): (Vec<mpsc::Sender<QueryInput>>, Vec<_>) =
            (0..query_count).map(|_| mpsc::channel(config.buffer_size)).unzip();
        let (worker_txs, worker_rxs): (Vec<mpsc::Sender<WorkerInput>>, Vec<_>) =
            (0..parallelism).map(|_| mpsc::channel(config.buffer_size)).unzip();

        let mut tasks = Vec::with_capacity(partitions.len() + parallelism + query_count + 2);

        let adapter = SinkAdapter {
            sink,
            input: AlignedReceiver::new(sink_rx, 0..query_count, "sink adapter"),
            config: config.sink.clone(),
            acks: ack_tx.clone(),
            metrics: metrics.clone(),
        };
        tasks.push(spawn_stage("sink adapter".to_string(), &shutdown, adapter.run()));

        for (index, (definition, rx)) in queries.iter().cloned().zip(query_rxs).enumerate() {
            let metric = definition.metric;
            let mut aggregate = WindowAggregate::new(definition);
            if let Some(saved) = snapshot.as_ref().and_then(|s| s.query(metric)) {
                aggregate.restore(saved.clone())?;
            }
            let progress = WatermarkTracker::new((0..parallelism).map(|w| w as u32))
                .with_watermark(aggregate.frontier());

            let task = QueryTask {
                index,
                input: AlignedReceiver::new(rx, 0..parallelism, "query task"),
                progress,
                aggregate,
                output: sink_tx.clone(),
                acks: ack_tx.clone(),
                metrics: metrics.clone(),
            };
            tasks.push(spawn_stage(format!("query {metric}"), &shutdown, task.run()));
        }
        drop(sink_tx);

        // Buffered candidates follow their event_id, so the worker count may
        // change between runs
        let mut dedups: Vec<WindowDeduplicator> =
            (0..parallelism).map(|_| WindowDeduplicator::new()).collect();
        if let Some(snapshot) = &snapshot {
            for (window, event) in snapshot.buffered_events() {
                dedups[route(event.event_id(), parallelism)].insert(window, event);
            }
            info!(
                checkpoint_id = snapshot.checkpoint_id,
                buffered_events = snapshot.buffered_event_count(),
                watermark = %restored_watermark,
                "Restored pipeline state"
            );
        }

        let assigner = TumblingWindowAssigner::new(config.window.size_ms)?;
        for (id, (rx, dedup)) in worker_rxs.into_iter().zip(dedups).enumerate() {
            let worker = WindowWorker {
                id,
                input: AlignedReceiver::new(
                    rx,
                    partitions.iter().map(|p| *p as usize),
                    "window worker",
                ),
                watermarks: WatermarkTracker::new(partitions.iter().copied())
                    .with_watermark(restored_watermark),
                assigner: assigner.clone(),
                dedup,
                queries: queries.clone(),
                outputs: query_txs.clone(),
                acks: ack_tx.clone(),
                metrics: metrics.clone(),
            };
            tasks.push(spawn_stage(format!("window worker {id}"), &shutdown, worker.run()));
        }
        drop(query_txs);

        let lateness = Duration::from_millis(config.window.allowed_lateness_ms);
        for reader in readers {
            let partition = reader.partition();
            let max_timestamp = snapshot.as_ref().and_then(|s| s.max_timestamp(partition));
            let next_offset = match &position {
                StartingPosition::Resume(token) => token.offset(partition),
                _ => None,
            };

            let assigner = EventTimeAssigner::restore(partition, lateness, max_timestamp);
            if max_timestamp.is_some() {
                partition_watermarks.insert(partition, assigner.current_watermark().timestamp);
            }

            let task = PartitionReader {
                reader,
                assigner,
                next_offset,
                workers: WorkerOutputs(worker_txs.clone()),
                commands: command_tx.subscribe(),
                acks: ack_tx.clone(),
                metrics: metrics.clone(),
                watermarks: Arc::clone(&partition_watermarks),
                max_records: config.max_records_per_poll,
                idle_timeout: config.watermark.idle_timeout(),
            };
            tasks.push(spawn_stage(format!("partition {partition}"), &shutdown, task.run()));
        }
        drop(worker_txs);
        // The coordinator exits once every stage has dropped its ack sender
        drop(ack_tx);

        let coordinator = CheckpointCoordinator::new(
            checkpoints,
            config.checkpoint.interval(),
            Topology {
                partitions: partitions.clone(),
                workers: parallelism,
                queries: query_count,
            },
            restored_from.map_or(1, |id| id + 1),
            CoordinatorChannels {
                commands: command_tx,
                acks: ack_rx,
                control: control_rx,
                shutdown: shutdown_rx,
            },
            metrics.clone(),
        );
        tasks.push(spawn_stage(
            "checkpoint coordinator".to_string(),
            &shutdown,
            coordinator.run(),
        ));

        info!(
            partitions = partitions.len(),
            workers = parallelism,
            queries = query_count,
            "Pipeline started"
        );

        Ok(PipelineHandle {
            shutdown,
            control: control_tx,
            tasks,
            metrics,
            partition_watermarks,
            restored_from,
            source,
        })
    }
}

type StageTask = (String, JoinHandle<Result<()>>);

/// Spawn a stage; a failing stage aborts the rest of the pipeline
fn spawn_stage<F>(name: String, shutdown: &Arc<watch::Sender<Shutdown>>, stage: F) -> StageTask
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let shutdown = Arc::clone(shutdown);
    let stage_name = name.clone();
    let handle = tokio::spawn(async move {
        let result = stage.await;
        if let Err(e) = &result {
            error!(stage = %stage_name, error = %e, "Pipeline stage failed");
            shutdown.send_replace(Shutdown::Abort);
        }
        result
    });
    (name, handle)
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    shutdown: Arc<watch::Sender<Shutdown>>,
    control: mpsc::Sender<ControlCommand>,
    tasks: Vec<StageTask>,
    metrics: PipelineMetrics,
    partition_watermarks: Arc<DashMap<u32, i64>>,
    restored_from: Option<u64>,
    // Kept alive until every stage has finished
    source: Box<dyn EventSource>,
}

impl PipelineHandle {
    /// Stop reading input
    ///
    /// Windows that are still open are abandoned; with checkpointing enabled
    /// they are captured by a final checkpoint first, so a restarted
    /// pipeline picks them up again.
    pub fn cancel(&self) {
        self.shutdown.send_if_modified(|state| {
            if *state == Shutdown::Running {
                *state = Shutdown::Cancel;
                true
            } else {
                false
            }
        });
    }

    /// Take a checkpoint and wait until it is stored; returns its id
    pub async fn trigger_checkpoint(&self) -> Result<u64> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(ControlCommand::Checkpoint(reply))
            .await
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: "checkpoint coordinator".to_string(),
            })?;
        response.await.map_err(|_| ProcessorError::ChannelClosed {
            stage: "checkpoint coordinator".to_string(),
        })?
    }

    pub fn stats(&self) -> PipelineStats {
        collect_stats(&self.metrics, &self.partition_watermarks, self.restored_from)
    }

    /// True once every stage has exited
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, task)| task.is_finished())
    }

    /// Wait for every stage; returns the first stage error, if any
    pub async fn wait(self) -> Result<PipelineStats> {
        let PipelineHandle {
            tasks,
            metrics,
            partition_watermarks,
            restored_from,
            source,
            ..
        } = self;

        let mut first_error = None;
        for (stage, task) in tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) => Err(ProcessorError::Execution {
                    source: Box::new(e),
                }),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!(%stage, error = %e, "Additional stage failure");
                }
            }
        }
        drop(source);

        match first_error {
            Some(e) => Err(e),
            None => {
                let stats = collect_stats(&metrics, &partition_watermarks, restored_from);
                info!(
                    events = stats.events_ingested,
                    records = stats.records_emitted,
                    late = stats.events_late_dropped,
                    duplicates = stats.events_duplicate,
                    "Pipeline finished"
                );
                Ok(stats)
            }
        }
    }
}

fn collect_stats(
    metrics: &PipelineMetrics,
    partition_watermarks: &DashMap<u32, i64>,
    restored_from: Option<u64>,
) -> PipelineStats {
    PipelineStats {
        partition_watermarks: partition_watermarks
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect(),
        restored_from,
        ..PipelineStats::from_metrics(metrics)
    }
}
