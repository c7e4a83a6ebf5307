//! Query task
//!
//! Merges the partial counts of one query from every window worker. A window
//! is final once every worker has reported progress past its end, so the
//! task tracks the minimum worker progress and closes windows behind it.

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::barrier::{AlignedReceiver, Delivery};
use super::messages::{CheckpointAck, QueryInput, SinkInput};
use crate::aggregation::WindowAggregate;
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;
use crate::watermark::{Watermark, WatermarkTracker};

pub(crate) struct QueryTask {
    pub(crate) index: usize,
    pub(crate) input: AlignedReceiver<QueryInput>,
    /// Progress of each window worker, keyed by worker id
    pub(crate) progress: WatermarkTracker,
    pub(crate) aggregate: WindowAggregate,
    pub(crate) output: mpsc::Sender<SinkInput>,
    pub(crate) acks: mpsc::UnboundedSender<CheckpointAck>,
    pub(crate) metrics: PipelineMetrics,
}

impl QueryTask {
    pub(crate) async fn run(mut self) -> Result<()> {
        let metric = self.aggregate.query().metric;
        debug!(%metric, "Query task started");

        // A worker that stopped early never completes its open windows, so
        // nothing past its last progress may be emitted
        let mut stopped = false;

        loop {
            match self.input.recv().await {
                Delivery::Message(QueryInput::Partial { window, counts, .. }) => {
                    self.aggregate.merge_partial(window, counts)?;
                }
                Delivery::Message(QueryInput::Progress { worker, watermark }) if !stopped => {
                    let advanced = self.progress.update(worker as u32, watermark);
                    self.emit(advanced).await?;
                }
                Delivery::Message(QueryInput::End {
                    worker,
                    exhausted: true,
                }) if !stopped => {
                    let advanced = self.progress.finish(worker as u32);
                    self.emit(advanced).await?;
                }
                Delivery::Message(QueryInput::End {
                    worker,
                    exhausted: false,
                }) => {
                    debug!(%metric, worker, "Worker stopped, freezing windows");
                    stopped = true;
                }
                Delivery::Message(QueryInput::Progress { .. })
                | Delivery::Message(QueryInput::End { .. })
                | Delivery::Message(QueryInput::Barrier { .. }) => {}
                Delivery::Aligned(checkpoint_id) => self.on_barrier(checkpoint_id).await?,
                Delivery::Closed => break,
            }
        }

        self.send(SinkInput::End { query: self.index }).await?;

        let stats = self.aggregate.stats();
        info!(
            %metric,
            windows_closed = stats.windows_closed,
            records_emitted = stats.records_emitted,
            groups_filtered = stats.groups_filtered,
            stale_partials = stats.stale_partials,
            open_windows = self.aggregate.open_windows(),
            "Query task finished"
        );
        Ok(())
    }

    async fn emit(&mut self, advanced: Option<Watermark>) -> Result<()> {
        let Some(watermark) = advanced else {
            return Ok(());
        };
        if !watermark.is_max() {
            self.metrics.global_watermark.set(watermark.timestamp);
        }

        let records = self.aggregate.advance(watermark)?;
        if records.is_empty() {
            return Ok(());
        }
        self.send(SinkInput::Records {
            query: self.index,
            records,
        })
        .await
    }

    async fn on_barrier(&mut self, checkpoint_id: u64) -> Result<()> {
        self.acks
            .send(CheckpointAck::Query {
                checkpoint_id,
                snapshot: self.aggregate.snapshot(),
            })
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: "checkpoint coordinator".to_string(),
            })?;

        self.send(SinkInput::Barrier {
            query: self.index,
            checkpoint_id,
        })
        .await
    }

    async fn send(&mut self, message: SinkInput) -> Result<()> {
        self.output
            .send(message)
            .await
            .map_err(|_| ProcessorError::ChannelClosed {
                stage: "sink adapter".to_string(),
            })
    }
}
