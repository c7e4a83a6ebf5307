//! Keyed window worker
//!
//! Owns the deduplication buffers for the `event_id`s routed to it. When the
//! global watermark passes a window end, the surviving events are counted per
//! query and the partial counts go to the query tasks.

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::barrier::{AlignedReceiver, Delivery};
use super::messages::{CheckpointAck, QueryInput, WorkerInput};
use crate::aggregation::QueryDefinition;
use crate::core::StreamEvent;
use crate::deduplication::{DedupOutcome, WindowDeduplicator};
use crate::error::{ProcessorError, Result, WindowError};
use crate::metrics::PipelineMetrics;
use crate::state::WorkerSnapshot;
use crate::watermark::{LateEventStats, Watermark, WatermarkTracker};
use crate::window::TumblingWindowAssigner;

pub(crate) struct WindowWorker {
    pub(crate) id: usize,
    pub(crate) input: AlignedReceiver<WorkerInput>,
    pub(crate) watermarks: WatermarkTracker,
    pub(crate) assigner: TumblingWindowAssigner,
    pub(crate) dedup: WindowDeduplicator,
    pub(crate) queries: Vec<QueryDefinition>,
    /// One sender per query, in query order
    pub(crate) outputs: Vec<mpsc::Sender<QueryInput>>,
    pub(crate) acks: mpsc::UnboundedSender<CheckpointAck>,
    pub(crate) metrics: PipelineMetrics,
}

impl WindowWorker {
    pub(crate) async fn run(mut self) -> Result<()> {
        debug!(worker = self.id, "Window worker started");
        let mut late = LateEventStats::default();
        // Set once a partition stops with input left; open windows are then
        // abandoned rather than closed
        let mut stopped = false;

        loop {
            match self.input.recv().await {
                Delivery::Message(WorkerInput::Event { event, .. }) => {
                    self.on_event(event, &mut late);
                }
                Delivery::Message(WorkerInput::Watermark {
                    partition,
                    watermark,
                }) if !stopped => {
                    let advanced = self.watermarks.update(partition, watermark);
                    self.on_progress(advanced).await?;
                }
                Delivery::Message(WorkerInput::Idle { partition }) if !stopped => {
                    let advanced = self.watermarks.mark_idle(partition);
                    self.on_progress(advanced).await?;
                }
                Delivery::Message(WorkerInput::End {
                    partition,
                    exhausted: true,
                }) if !stopped => {
                    let advanced = self.watermarks.finish(partition);
                    self.on_progress(advanced).await?;
                }
                Delivery::Message(WorkerInput::End {
                    partition,
                    exhausted: false,
                }) if !stopped => {
                    debug!(worker = self.id, partition, "Partition stopped, freezing windows");
                    stopped = true;
                }
                // Progress after a stop, or consumed by the receiver
                Delivery::Message(WorkerInput::Watermark { .. })
                | Delivery::Message(WorkerInput::Idle { .. })
                | Delivery::Message(WorkerInput::End { .. })
                | Delivery::Message(WorkerInput::Barrier { .. }) => {}
                Delivery::Aligned(checkpoint_id) => self.on_barrier(checkpoint_id).await?,
                Delivery::Closed => break,
            }
        }

        for query in 0..self.outputs.len() {
            let end = QueryInput::End {
                worker: self.id,
                exhausted: !stopped,
            };
            send(&self.outputs, query, end).await?;
        }

        let stats = self.dedup.stats();
        info!(
            worker = self.id,
            events_checked = stats.events_checked,
            duplicates = stats.duplicates_found,
            late_dropped = late.dropped_count,
            max_lateness_ms = late.max_lateness_ms,
            abandoned_windows = self.dedup.open_windows().len(),
            "Window worker finished"
        );
        Ok(())
    }

    fn on_event(&mut self, event: StreamEvent, late: &mut LateEventStats) {
        if self.watermarks.is_late(event.event_time) {
            let late_by = self.watermarks.lateness(event.event_time);
            late.record(late_by);
            self.metrics.events_late_dropped.inc();
            let reason = WindowError::LateEvent {
                event_time: event.event_time,
                watermark: self.watermarks.current().timestamp,
                late_by,
            };
            debug!(worker = self.id, event_id = event.event_id(), %reason, "Dropping late event");
            return;
        }

        let window = self.assigner.window_for(event.event_time);
        match self.dedup.insert(window, event) {
            DedupOutcome::Admitted => {}
            DedupOutcome::Replaced | DedupOutcome::Duplicate => {
                self.metrics.events_duplicate.inc();
            }
        }
    }

    async fn on_progress(&mut self, advanced: Option<Watermark>) -> Result<()> {
        let Some(watermark) = advanced else {
            return Ok(());
        };

        for (window, events) in self.dedup.close_until(watermark) {
            self.metrics.windows_closed.inc();
            debug!(worker = self.id, %window, events = events.len(), "Closing window buffer");

            for (query, definition) in self.queries.iter().enumerate() {
                let counts = definition.partial_counts(&events)?;
                if counts.is_empty() {
                    continue;
                }
                let message = QueryInput::Partial {
                    worker: self.id,
                    window,
                    counts,
                };
                send(&self.outputs, query, message).await?;
            }
        }

        for query in 0..self.outputs.len() {
            send(
                &self.outputs,
                query,
                QueryInput::Progress {
                    worker: self.id,
                    watermark,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn on_barrier(&mut self, checkpoint_id: u64) -> Result<()> {
        debug!(worker = self.id, checkpoint_id, "Barrier aligned");
        let snapshot = WorkerSnapshot {
            worker: self.id,
            watermark: self.watermarks.current(),
            buffers: self.dedup.snapshot(),
        };
        self.acks
            .send(CheckpointAck::Worker {
                checkpoint_id,
                snapshot,
            })
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: "checkpoint coordinator".to_string(),
            })?;

        for query in 0..self.outputs.len() {
            send(
                &self.outputs,
                query,
                QueryInput::Barrier {
                    worker: self.id,
                    checkpoint_id,
                },
            )
            .await?;
        }
        Ok(())
    }
}

async fn send(outputs: &[mpsc::Sender<QueryInput>], query: usize, message: QueryInput) -> Result<()> {
    outputs[query]
        .send(message)
        .await
        .map_err(|_| ProcessorError::ChannelClosed {
            stage: format!("query task {query}"),
        })
}
