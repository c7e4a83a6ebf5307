//! Partition reader task
//!
//! One task per source shard. It decodes records, stamps event time, routes
//! each event to the window worker that owns its `event_id`, and broadcasts
//! partition watermarks, idleness, checkpoint barriers and end-of-input to
//! every worker.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry_types::EventRecord;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::messages::{CheckpointAck, SourceCommand, WorkerInput};
use crate::connector::{ShardReader, SourceRecord};
use crate::core::EventTimeAssigner;
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;
use crate::state::SourcePosition;
use crate::watermark::Watermark;

/// Window worker that owns `event_id`
///
/// Duplicates of an id always meet in the same worker. XXH3 is seedless and
/// specified, so the mapping does not change between builds.
pub(crate) fn route(event_id: &str, workers: usize) -> usize {
    (xxh3_64(event_id.as_bytes()) % workers.max(1) as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The shard has no more records
    Exhausted,
    /// Stopped by the coordinator
    Stopped,
}

pub(crate) struct PartitionReader {
    pub(crate) reader: Box<dyn ShardReader>,
    pub(crate) assigner: EventTimeAssigner,
    /// Resume offset, when known
    pub(crate) next_offset: Option<i64>,
    pub(crate) workers: WorkerOutputs,
    pub(crate) commands: broadcast::Receiver<SourceCommand>,
    pub(crate) acks: mpsc::UnboundedSender<CheckpointAck>,
    pub(crate) metrics: PipelineMetrics,
    /// Latest watermark per partition, shared with the pipeline handle
    pub(crate) watermarks: Arc<DashMap<u32, i64>>,
    pub(crate) max_records: usize,
    pub(crate) idle_timeout: Option<Duration>,
}

impl PartitionReader {
    fn partition(&self) -> u32 {
        self.assigner.partition()
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let partition = self.partition();
        info!(partition, "Partition reader started");

        let mut idle = false;
        let mut last_record = Instant::now();

        let exit = loop {
            if self.poll_commands().await? == Some(Exit::Stopped) {
                break Exit::Stopped;
            }

            match self.reader.next_batch(self.max_records).await? {
                None => break Exit::Exhausted,
                Some(batch) if batch.is_empty() => {
                    let timed_out = self
                        .idle_timeout
                        .is_some_and(|timeout| last_record.elapsed() >= timeout);
                    if timed_out && !idle {
                        idle = true;
                        debug!(partition, "Partition is idle");
                        self.workers.broadcast(WorkerInput::Idle { partition }).await?;
                    }
                }
                Some(batch) => {
                    last_record = Instant::now();
                    let resumed = std::mem::take(&mut idle);
                    self.process_batch(batch, resumed).await?;
                }
            }
        };

        if exit == Exit::Exhausted {
            // Bounded input: everything this partition will ever send is out
            self.workers.broadcast(WorkerInput::Watermark {
                partition,
                watermark: Watermark::max(),
            })
            .await?;
        }

        let position = self.position();
        let _ = self.acks.send(CheckpointAck::SourceFinished { position });
        self.workers
            .broadcast(WorkerInput::End {
                partition,
                exhausted: exit == Exit::Exhausted,
            })
            .await?;

        info!(partition, exit = ?exit, next_offset = ?self.next_offset, "Partition reader finished");
        Ok(())
    }

    /// Drain coordinator commands issued since the last batch
    async fn poll_commands(&mut self) -> Result<Option<Exit>> {
        loop {
            match self.commands.try_recv() {
                Ok(SourceCommand::Checkpoint {
                    checkpoint_id,
                    stop_after,
                }) => {
                    self.inject_barrier(checkpoint_id).await?;
                    if stop_after {
                        return Ok(Some(Exit::Stopped));
                    }
                }
                Ok(SourceCommand::Stop) => return Ok(Some(Exit::Stopped)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(partition = self.partition(), skipped, "Missed coordinator commands");
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn inject_barrier(&mut self, checkpoint_id: u64) -> Result<()> {
        let partition = self.partition();
        debug!(partition, checkpoint_id, "Injecting checkpoint barrier");
        self.workers.broadcast(WorkerInput::Barrier {
            partition,
            checkpoint_id,
        })
        .await?;

        let position = self.position();
        self.acks
            .send(CheckpointAck::Source {
                checkpoint_id,
                position,
            })
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: "checkpoint coordinator".to_string(),
            })
    }

    async fn process_batch(&mut self, batch: Vec<SourceRecord>, resumed: bool) -> Result<()> {
        let partition = self.partition();
        let mut advanced = None;

        for record in batch {
            self.next_offset = Some(record.offset + 1);

            let decoded = match EventRecord::from_slice(&record.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.metrics.events_malformed.inc();
                    warn!(partition, offset = record.offset, error = %e, "Skipping malformed record");
                    continue;
                }
            };

            let (event, watermark) = self.assigner.assign(decoded, record.offset);
            self.metrics.events_ingested.inc();
            if watermark.is_some() {
                advanced = watermark;
            }

            let worker = route(event.event_id(), self.workers.len());
            self.workers.send(worker, WorkerInput::Event { partition, event }).await?;
        }

        // A partition returning from idleness must re-enter the global minimum
        // even if its watermark did not move
        let watermark = match advanced {
            Some(watermark) => Some(watermark),
            None if resumed => Some(self.assigner.current_watermark()),
            None => None,
        };
        if let Some(watermark) = watermark {
            self.watermarks.insert(partition, watermark.timestamp);
            self.workers
                .broadcast(WorkerInput::Watermark { partition, watermark })
                .await?;
        }

        Ok(())
    }

    fn position(&self) -> SourcePosition {
        SourcePosition {
            partition: self.partition(),
            next_offset: self.next_offset,
            max_timestamp: self.assigner.max_timestamp(),
        }
    }
}

/// Senders to every window worker
pub(crate) struct WorkerOutputs(pub(crate) Vec<mpsc::Sender<WorkerInput>>);

impl WorkerOutputs {
    fn len(&self) -> usize {
        self.0.len()
    }

    async fn send(&self, worker: usize, message: WorkerInput) -> Result<()> {
        self.0[worker]
            .send(message)
            .await
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: format!("window worker {worker}"),
            })
    }

    async fn broadcast(&self, message: WorkerInput) -> Result<()> {
        for worker in 0..self.len() {
            self.send(worker, message.clone()).await?;
        }
        Ok(())
    }
}
