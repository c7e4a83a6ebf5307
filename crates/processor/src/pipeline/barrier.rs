//! Checkpoint barrier alignment
//!
//! A task with several upstream inputs snapshots its state once every
//! active input has delivered the barrier of a checkpoint. Messages that an
//! input sends after its barrier belong to the next epoch, so they are held
//! back until alignment completes and replayed afterwards in their original
//! order.

use std::collections::{HashSet, VecDeque};
use std::mem;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::Envelope;

/// What the receiving task should handle next
#[derive(Debug)]
pub(crate) enum Delivery<M> {
    Message(M),
    /// Every active input has passed the barrier of this checkpoint
    Aligned(u64),
    /// All senders are gone
    Closed,
}

#[derive(Debug)]
struct PendingBarrier {
    checkpoint_id: u64,
    arrived: HashSet<usize>,
}

/// Receiver that aligns checkpoint barriers across inputs
///
/// All state lives in the receiver, so dropping a `recv` future inside
/// `tokio::select!` loses nothing.
#[derive(Debug)]
pub(crate) struct AlignedReceiver<M> {
    rx: mpsc::Receiver<M>,
    stage: &'static str,
    active: HashSet<usize>,
    pending: Option<PendingBarrier>,
    stash: VecDeque<M>,
    replay: VecDeque<M>,
    ready: Option<u64>,
}

impl<M: Envelope> AlignedReceiver<M> {
    pub(crate) fn new(
        rx: mpsc::Receiver<M>,
        inputs: impl IntoIterator<Item = usize>,
        stage: &'static str,
    ) -> Self {
        Self {
            rx,
            stage,
            active: inputs.into_iter().collect(),
            pending: None,
            stash: VecDeque::new(),
            replay: VecDeque::new(),
            ready: None,
        }
    }

    /// Inputs that have not ended yet
    pub(crate) fn active_inputs(&self) -> usize {
        self.active.len()
    }

    pub(crate) async fn recv(&mut self) -> Delivery<M> {
        loop {
            if let Some(checkpoint_id) = self.ready.take() {
                return Delivery::Aligned(checkpoint_id);
            }

            let message = match self.replay.pop_front() {
                Some(message) => message,
                None => match self.rx.recv().await {
                    Some(message) => message,
                    None => {
                        if let Some(pending) = self.pending.take() {
                            warn!(
                                stage = self.stage,
                                checkpoint_id = pending.checkpoint_id,
                                "Inputs closed during barrier alignment, abandoning checkpoint"
                            );
                            self.replay = mem::take(&mut self.stash);
                            continue;
                        }
                        return Delivery::Closed;
                    }
                },
            };

            let input = message.input();
            if self
                .pending
                .as_ref()
                .is_some_and(|p| p.arrived.contains(&input))
            {
                self.stash.push_back(message);
                continue;
            }

            if let Some(checkpoint_id) = message.barrier_id() {
                self.on_barrier(input, checkpoint_id);
                if let Some(aligned) = self.try_complete() {
                    return Delivery::Aligned(aligned);
                }
                continue;
            }

            if message.is_end() {
                self.active.remove(&input);
                self.ready = self.try_complete();
            }

            return Delivery::Message(message);
        }
    }

    fn on_barrier(&mut self, input: usize, checkpoint_id: u64) {
        match &mut self.pending {
            Some(pending) if pending.checkpoint_id == checkpoint_id => {
                pending.arrived.insert(input);
            }
            Some(pending) if checkpoint_id < pending.checkpoint_id => {
                debug!(
                    stage = self.stage,
                    input,
                    checkpoint_id,
                    "Dropping barrier of an abandoned checkpoint"
                );
            }
            Some(pending) => {
                warn!(
                    stage = self.stage,
                    abandoned = pending.checkpoint_id,
                    checkpoint_id,
                    "Newer barrier superseded an incomplete alignment"
                );
                let mut stash = mem::take(&mut self.stash);
                stash.append(&mut self.replay);
                self.replay = stash;
                self.pending = Some(PendingBarrier {
                    checkpoint_id,
                    arrived: HashSet::from([input]),
                });
            }
            None => {
                self.pending = Some(PendingBarrier {
                    checkpoint_id,
                    arrived: HashSet::from([input]),
                });
            }
        }
    }

    fn try_complete(&mut self) -> Option<u64> {
        let complete = self
            .pending
            .as_ref()
            .is_some_and(|p| self.active.iter().all(|input| p.arrived.contains(input)));
        if !complete {
            return None;
        }

        let pending = self.pending.take()?;
        let mut replay = mem::take(&mut self.stash);
        replay.append(&mut self.replay);
        self.replay = replay;
        Some(pending.checkpoint_id)
    }
}
