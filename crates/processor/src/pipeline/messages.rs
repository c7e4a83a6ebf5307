//! Messages exchanged between pipeline stages
//!
//! Every data channel carries a stage-specific enum that identifies the
//! upstream input it came from, so that a downstream task can align
//! checkpoint barriers and track per-input progress.

use tokio::sync::oneshot;

use crate::aggregation::{PartialCounts, WindowAggregateSnapshot};
use crate::core::StreamEvent;
use crate::error::Result;
use crate::state::{SourcePosition, WorkerSnapshot};
use crate::watermark::Watermark;
use crate::window::WindowBounds;
use telemetry_types::MetricRecord;

/// Common view of stage messages used for barrier alignment
pub(crate) trait Envelope {
    /// Upstream input that produced the message
    fn input(&self) -> usize;

    /// Checkpoint id when the message is a barrier
    fn barrier_id(&self) -> Option<u64>;

    /// True for the last message an input will ever send
    fn is_end(&self) -> bool;
}

/// Partition reader to window worker
#[derive(Debug, Clone)]
pub(crate) enum WorkerInput {
    Event { partition: u32, event: StreamEvent },
    Watermark { partition: u32, watermark: Watermark },
    Idle { partition: u32 },
    Barrier { partition: u32, checkpoint_id: u64 },
    /// Last message of a partition; `exhausted` is false when the reader was
    /// stopped with input left, which freezes window closing downstream
    End { partition: u32, exhausted: bool },
}

impl WorkerInput {
    fn partition(&self) -> u32 {
        match self {
            WorkerInput::Event { partition, .. }
            | WorkerInput::Watermark { partition, .. }
            | WorkerInput::Idle { partition }
            | WorkerInput::Barrier { partition, .. }
            | WorkerInput::End { partition, .. } => *partition,
        }
    }
}

impl Envelope for WorkerInput {
    fn input(&self) -> usize {
        self.partition() as usize
    }

    fn barrier_id(&self) -> Option<u64> {
        match self {
            WorkerInput::Barrier { checkpoint_id, .. } => Some(*checkpoint_id),
            _ => None,
        }
    }

    fn is_end(&self) -> bool {
        matches!(self, WorkerInput::End { .. })
    }
}

/// Window worker to query task
#[derive(Debug)]
pub(crate) enum QueryInput {
    /// Partial counts of one closed window
    Partial {
        worker: usize,
        window: WindowBounds,
        counts: PartialCounts,
    },
    /// Every window of `worker` below `watermark` has been sent
    Progress { worker: usize, watermark: Watermark },
    Barrier { worker: usize, checkpoint_id: u64 },
    /// `exhausted` is false when the worker stopped before its inputs ended
    End { worker: usize, exhausted: bool },
}

impl Envelope for QueryInput {
    fn input(&self) -> usize {
        match self {
            QueryInput::Partial { worker, .. }
            | QueryInput::Progress { worker, .. }
            | QueryInput::Barrier { worker, .. }
            | QueryInput::End { worker, .. } => *worker,
        }
    }

    fn barrier_id(&self) -> Option<u64> {
        match self {
            QueryInput::Barrier { checkpoint_id, .. } => Some(*checkpoint_id),
            _ => None,
        }
    }

    fn is_end(&self) -> bool {
        matches!(self, QueryInput::End { .. })
    }
}

/// Query task to sink adapter
#[derive(Debug)]
pub(crate) enum SinkInput {
    Records { query: usize, records: Vec<MetricRecord> },
    Barrier { query: usize, checkpoint_id: u64 },
    End { query: usize },
}

impl Envelope for SinkInput {
    fn input(&self) -> usize {
        match self {
            SinkInput::Records { query, .. }
            | SinkInput::Barrier { query, .. }
            | SinkInput::End { query } => *query,
        }
    }

    fn barrier_id(&self) -> Option<u64> {
        match self {
            SinkInput::Barrier { checkpoint_id, .. } => Some(*checkpoint_id),
            _ => None,
        }
    }

    fn is_end(&self) -> bool {
        matches!(self, SinkInput::End { .. })
    }
}

/// Coordinator broadcast to partition readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceCommand {
    /// Inject a barrier; stop reading afterwards when `stop_after` is set
    Checkpoint { checkpoint_id: u64, stop_after: bool },
    /// Stop reading without a barrier
    Stop,
}

/// Stage reports collected by the coordinator
#[derive(Debug)]
pub(crate) enum CheckpointAck {
    Source {
        checkpoint_id: u64,
        position: SourcePosition,
    },
    /// A partition reader exited; its final position stands in for any
    /// later barrier
    SourceFinished { position: SourcePosition },
    Worker {
        checkpoint_id: u64,
        snapshot: WorkerSnapshot,
    },
    Query {
        checkpoint_id: u64,
        snapshot: WindowAggregateSnapshot,
    },
    Sink { checkpoint_id: u64 },
}

/// Requests sent from a [`PipelineHandle`](super::PipelineHandle)
#[derive(Debug)]
pub(crate) enum ControlCommand {
    /// Take a checkpoint now; replies with its id once it is stored
    Checkpoint(oneshot::Sender<Result<u64>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_inputs() {
        let barrier = WorkerInput::Barrier { partition: 3, checkpoint_id: 7 };
        assert_eq!(barrier.input(), 3);
        assert_eq!(barrier.barrier_id(), Some(7));
        assert!(!barrier.is_end());

        let end = QueryInput::End { worker: 2, exhausted: false };
        assert_eq!(end.input(), 2);
        assert_eq!(end.barrier_id(), None);
        assert!(end.is_end());

        let records = SinkInput::Records { query: 1, records: vec![] };
        assert_eq!(records.input(), 1);
        assert!(!records.is_end());
    }
}
