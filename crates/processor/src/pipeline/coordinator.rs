//! Checkpoint coordinator
//!
//! Checkpoints follow the aligned-barrier scheme: the coordinator asks every
//! partition reader to inject a barrier, the barrier flows through the window
//! workers and query tasks to the sink adapter, and each stage reports its
//! state as the barrier passes. Once every stage has reported, the snapshot
//! is written to the [`CheckpointStore`].
//!
//! The coordinator also turns cancellation into source commands: with a
//! store configured the sources stop right after a final barrier, otherwise
//! they stop immediately.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::messages::{CheckpointAck, ControlCommand, SourceCommand};
use crate::aggregation::WindowAggregateSnapshot;
use crate::error::{ProcessorError, Result, StateError};
use crate::metrics::PipelineMetrics;
use crate::state::{CheckpointStore, PipelineSnapshot, SourcePosition, WorkerSnapshot};

/// Idle period of the checkpoint timer when periodic checkpoints are off
const DISABLED_INTERVAL: Duration = Duration::from_secs(3600);

/// Pipeline-wide stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shutdown {
    Running,
    /// Graceful stop requested through the handle
    Cancel,
    /// A task failed; stop without checkpointing
    Abort,
}

pub(crate) struct CoordinatorChannels {
    pub(crate) commands: broadcast::Sender<SourceCommand>,
    pub(crate) acks: mpsc::UnboundedReceiver<CheckpointAck>,
    pub(crate) control: mpsc::Receiver<ControlCommand>,
    pub(crate) shutdown: watch::Receiver<Shutdown>,
}

/// Number of acknowledgements a checkpoint waits for
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) partitions: Vec<u32>,
    pub(crate) workers: usize,
    pub(crate) queries: usize,
}

struct PendingCheckpoint {
    checkpoint_id: u64,
    stop_after: bool,
    sources: BTreeMap<u32, SourcePosition>,
    workers: Vec<WorkerSnapshot>,
    queries: Vec<WindowAggregateSnapshot>,
    sink: bool,
    waiters: Vec<oneshot::Sender<Result<u64>>>,
}

pub(crate) struct CheckpointCoordinator {
    store: Option<CheckpointStore>,
    interval: Option<Duration>,
    topology: Topology,
    next_id: u64,
    channels: CoordinatorChannels,
    metrics: PipelineMetrics,
    finished: BTreeMap<u32, SourcePosition>,
    pending: Option<PendingCheckpoint>,
    stopping: bool,
    stop_after_pending: bool,
}

impl CheckpointCoordinator {
    pub(crate) fn new(
        store: Option<CheckpointStore>,
        interval: Option<Duration>,
        topology: Topology,
        next_id: u64,
        channels: CoordinatorChannels,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            store,
            interval,
            topology,
            next_id,
            channels,
            metrics,
            finished: BTreeMap::new(),
            pending: None,
            stopping: false,
            stop_after_pending: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let period = self.interval.unwrap_or(DISABLED_INTERVAL);
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let periodic = self.store.is_some() && self.interval.is_some();

        let mut control_open = true;
        let mut shutdown_open = true;

        loop {
            let tick_enabled = periodic && !self.stopping && self.pending.is_none();
            tokio::select! {
                ack = self.channels.acks.recv() => match ack {
                    Some(ack) => self.on_ack(ack).await,
                    // Every stage has exited
                    None => break,
                },
                command = self.channels.control.recv(), if control_open => match command {
                    Some(ControlCommand::Checkpoint(reply)) => self.on_trigger(reply),
                    None => control_open = false,
                },
                changed = self.channels.shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) => {
                        let signal = *self.channels.shutdown.borrow_and_update();
                        self.on_shutdown(signal);
                    }
                    Err(_) => shutdown_open = false,
                },
                _ = ticker.tick(), if tick_enabled => self.begin(false, None),
            }
        }

        if let Some(pending) = self.pending.take() {
            warn!(
                checkpoint_id = pending.checkpoint_id,
                "Pipeline finished before checkpoint completed"
            );
            fail_waiters(pending.waiters, pending.checkpoint_id, "pipeline finished");
        }

        info!(
            checkpoints = self.metrics.checkpoints_completed.get(),
            "Checkpoint coordinator finished"
        );
        Ok(())
    }

    fn all_sources_finished(&self) -> bool {
        self.topology
            .partitions
            .iter()
            .all(|p| self.finished.contains_key(p))
    }

    fn on_trigger(&mut self, reply: oneshot::Sender<Result<u64>>) {
        if self.store.is_none() {
            let _ = reply.send(Err(ProcessorError::Configuration {
                source: "checkpointing is not configured".into(),
            }));
            return;
        }
        if self.stopping {
            let _ = reply.send(Err(StateError::CheckpointFailed {
                checkpoint_id: self.next_id.to_string(),
                reason: "pipeline is stopping".to_string(),
            }
            .into()));
            return;
        }

        // Join the checkpoint already in flight
        if let Some(pending) = self.pending.as_mut() {
            pending.waiters.push(reply);
        } else {
            self.begin(false, Some(reply));
        }
    }

    fn on_shutdown(&mut self, signal: Shutdown) {
        match signal {
            Shutdown::Running => {}
            Shutdown::Cancel if !self.stopping => {
                self.stopping = true;
                if self.all_sources_finished() {
                    return;
                }
                let in_flight = self.pending.as_ref().map(|p| p.checkpoint_id);
                match (self.store.is_some(), in_flight) {
                    (true, Some(checkpoint_id)) => {
                        info!(checkpoint_id, "Stopping after the in-flight checkpoint");
                        self.stop_after_pending = true;
                    }
                    (true, None) => {
                        info!("Taking final checkpoint before stopping");
                        self.begin(true, None);
                    }
                    (false, _) => {
                        info!("Stopping sources");
                        self.broadcast(SourceCommand::Stop);
                    }
                }
            }
            Shutdown::Cancel => {}
            Shutdown::Abort => {
                warn!("Aborting pipeline");
                self.stopping = true;
                if let Some(pending) = self.pending.take() {
                    fail_waiters(pending.waiters, pending.checkpoint_id, "pipeline aborted");
                }
                self.broadcast(SourceCommand::Stop);
            }
        }
    }

    fn begin(&mut self, stop_after: bool, waiter: Option<oneshot::Sender<Result<u64>>>) {
        let checkpoint_id = self.next_id;
        if self.all_sources_finished() {
            debug!(checkpoint_id, "Skipping checkpoint, all sources finished");
            fail_waiters(waiter, checkpoint_id, "all sources have finished");
            return;
        }

        let command = SourceCommand::Checkpoint {
            checkpoint_id,
            stop_after,
        };
        if self.channels.commands.send(command).is_err() {
            fail_waiters(waiter, checkpoint_id, "no source is running");
            return;
        }

        self.next_id += 1;
        info!(checkpoint_id, stop_after, "Checkpoint triggered");
        self.pending = Some(PendingCheckpoint {
            checkpoint_id,
            stop_after,
            sources: BTreeMap::new(),
            workers: Vec::with_capacity(self.topology.workers),
            queries: Vec::with_capacity(self.topology.queries),
            sink: false,
            waiters: waiter.into_iter().collect(),
        });
    }

    fn broadcast(&self, command: SourceCommand) {
        if self.channels.commands.send(command).is_err() {
            debug!(?command, "No source left to receive command");
        }
    }

    fn pending_for(&mut self, checkpoint_id: u64) -> Option<&mut PendingCheckpoint> {
        let pending = self
            .pending
            .as_mut()
            .filter(|p| p.checkpoint_id == checkpoint_id);
        if pending.is_none() {
            trace!(checkpoint_id, "Ignoring acknowledgement of an abandoned checkpoint");
        }
        pending
    }

    async fn on_ack(&mut self, ack: CheckpointAck) {
        match ack {
            CheckpointAck::SourceFinished { position } => {
                debug!(partition = position.partition, "Source finished");
                self.finished.insert(position.partition, position);
            }
            CheckpointAck::Source {
                checkpoint_id,
                position,
            } => {
                if let Some(pending) = self.pending_for(checkpoint_id) {
                    pending.sources.insert(position.partition, position);
                }
            }
            CheckpointAck::Worker {
                checkpoint_id,
                snapshot,
            } => {
                if let Some(pending) = self.pending_for(checkpoint_id) {
                    pending.workers.push(snapshot);
                }
            }
            CheckpointAck::Query {
                checkpoint_id,
                snapshot,
            } => {
                if let Some(pending) = self.pending_for(checkpoint_id) {
                    pending.queries.push(snapshot);
                }
            }
            CheckpointAck::Sink { checkpoint_id } => {
                if let Some(pending) = self.pending_for(checkpoint_id) {
                    pending.sink = true;
                }
            }
        }

        if self.pending.as_ref().is_some_and(|p| self.is_complete(p)) {
            self.complete().await;
        }
    }

    fn is_complete(&self, pending: &PendingCheckpoint) -> bool {
        let sources = self
            .topology
            .partitions
            .iter()
            .all(|p| pending.sources.contains_key(p) || self.finished.contains_key(p));
        sources
            && pending.workers.len() == self.topology.workers
            && pending.queries.len() == self.topology.queries
            && pending.sink
    }

    async fn complete(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let checkpoint_id = pending.checkpoint_id;

        let sources = self
            .topology
            .partitions
            .iter()
            .filter_map(|p| pending.sources.get(p).or_else(|| self.finished.get(p)))
            .cloned()
            .collect();
        let mut workers = pending.workers;
        workers.sort_by_key(|w| w.worker);
        let mut queries = pending.queries;
        queries.sort_by_key(|q| q.metric);

        let snapshot = PipelineSnapshot {
            checkpoint_id,
            sources,
            workers,
            queries,
        };

        let saved = match &self.store {
            Some(store) => store.save(&snapshot).await,
            None => Err(StateError::CheckpointFailed {
                checkpoint_id: checkpoint_id.to_string(),
                reason: "checkpointing is not configured".to_string(),
            }),
        };

        match saved {
            Ok(_) => {
                self.metrics.checkpoints_completed.inc();
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(checkpoint_id));
                }
            }
            Err(e) => {
                error!(checkpoint_id, error = %e, "Checkpoint failed");
                fail_waiters(pending.waiters, checkpoint_id, &e.to_string());
            }
        }

        if self.stop_after_pending && !pending.stop_after {
            self.stop_after_pending = false;
            self.broadcast(SourceCommand::Stop);
        }
    }
}

fn fail_waiters(
    waiters: impl IntoIterator<Item = oneshot::Sender<Result<u64>>>,
    checkpoint_id: u64,
    reason: &str,
) {
    for waiter in waiters {
        let _ = waiter.send(Err(StateError::CheckpointFailed {
            checkpoint_id: checkpoint_id.to_string(),
            reason: reason.to_string(),
        }
        .into()));
    }
}
