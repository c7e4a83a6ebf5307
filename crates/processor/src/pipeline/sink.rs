//! Sink adapter
//!
//! Collects records from every query task into batches of at most
//! `batch_size` and hands them to the [`MetricSink`]. Partial batches are
//! flushed on a timer, before acknowledging a checkpoint and when all
//! queries have finished. Retriable sink failures are retried with
//! exponential backoff; anything else, or running out of retries, fails the
//! pipeline.

use std::mem;
use telemetry_types::MetricRecord;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::barrier::{AlignedReceiver, Delivery};
use super::messages::{CheckpointAck, SinkInput};
use crate::config::SinkAdapterConfig;
use crate::connector::MetricSink;
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;

pub(crate) struct SinkAdapter {
    pub(crate) sink: Box<dyn MetricSink>,
    pub(crate) input: AlignedReceiver<SinkInput>,
    pub(crate) config: SinkAdapterConfig,
    pub(crate) acks: mpsc::UnboundedSender<CheckpointAck>,
    pub(crate) metrics: PipelineMetrics,
}

impl SinkAdapter {
    pub(crate) async fn run(mut self) -> Result<()> {
        let mut pending: Vec<MetricRecord> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = time::interval_at(
            time::Instant::now() + self.config.flush_interval(),
            self.config.flush_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = self.input.recv() => match delivery {
                    Delivery::Message(SinkInput::Records { records, .. }) => {
                        pending.extend(records);
                        while pending.len() >= self.config.batch_size {
                            let batch: Vec<MetricRecord> =
                                pending.drain(..self.config.batch_size).collect();
                            self.write(batch).await?;
                        }
                    }
                    Delivery::Message(SinkInput::End { query }) => {
                        debug!(query, "Query finished");
                    }
                    Delivery::Message(SinkInput::Barrier { .. }) => {}
                    Delivery::Aligned(checkpoint_id) => {
                        self.flush(&mut pending).await?;
                        self.acks
                            .send(CheckpointAck::Sink { checkpoint_id })
                            .map_err(|_| ProcessorError::ChannelClosed {
                                stage: "checkpoint coordinator".to_string(),
                            })?;
                    }
                    Delivery::Closed => break,
                },
                _ = ticker.tick() => self.flush(&mut pending).await?,
            }
        }

        self.flush(&mut pending).await?;
        info!(
            batches = self.metrics.sink_batches.get(),
            records = self.metrics.records_emitted.get(),
            "Sink adapter finished"
        );
        Ok(())
    }

    async fn flush(&mut self, pending: &mut Vec<MetricRecord>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = mem::take(pending);
        self.write(batch).await
    }

    async fn write(&mut self, batch: Vec<MetricRecord>) -> Result<()> {
        let mut retry = 0;
        loop {
            match self.sink.send_batch(&batch).await {
                Ok(()) => {
                    self.metrics.sink_batches.inc();
                    self.metrics.records_emitted.inc_by(batch.len() as u64);
                    debug!(records = batch.len(), retries = retry, "Flushed metric batch");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && retry < self.config.max_retries => {
                    let backoff = self.config.backoff(retry);
                    retry += 1;
                    self.metrics.sink_retries.inc();
                    warn!(
                        error = %e,
                        retry,
                        backoff_ms = backoff.as_millis() as u64,
                        "Metric batch failed, retrying"
                    );
                    time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(error = %e, retries = retry, records = batch.len(), "Metric batch failed");
                    return Err(e);
                }
            }
        }
    }
}
