//! Consistent cut of the running pipeline

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use telemetry_types::MetricName;

use super::checkpoint::Checkpoint;
use crate::aggregation::WindowAggregateSnapshot;
use crate::connector::ResumeToken;
use crate::core::StreamEvent;
use crate::deduplication::WindowBufferSnapshot;
use crate::error::{StateError, StateResult};
use crate::watermark::Watermark;
use crate::window::WindowBounds;

const META_KEY: &str = "meta";
const SOURCE_PREFIX: &str = "source/";
const WORKER_PREFIX: &str = "worker/";
const QUERY_PREFIX: &str = "query/";

/// Read position and event-time progress of one source shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub partition: u32,
    /// First offset not covered by the checkpoint; `None` until the shard
    /// has delivered a record
    pub next_offset: Option<i64>,
    /// Largest event time read before the checkpoint
    pub max_timestamp: Option<i64>,
}

/// State of one window worker at a checkpoint barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker: usize,
    pub watermark: Watermark,
    pub buffers: Vec<WindowBufferSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    checkpoint_id: u64,
}

/// Everything needed to resume the pipeline without re-closing a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub checkpoint_id: u64,
    pub sources: Vec<SourcePosition>,
    pub workers: Vec<WorkerSnapshot>,
    pub queries: Vec<WindowAggregateSnapshot>,
}

impl PipelineSnapshot {
    /// Offsets to resume the source from; shards without a position are
    /// left out and start from the earliest record
    pub fn resume_token(&self) -> ResumeToken {
        ResumeToken::new(
            self.sources
                .iter()
                .filter_map(|s| s.next_offset.map(|offset| (s.partition, offset)))
                .collect(),
        )
    }

    pub fn max_timestamp(&self, partition: u32) -> Option<i64> {
        self.sources
            .iter()
            .find(|s| s.partition == partition)
            .and_then(|s| s.max_timestamp)
    }

    /// Global watermark at the barrier
    ///
    /// Aligned workers all saw the same watermarks, so the minimum is only a
    /// guard against mixed snapshots.
    pub fn watermark(&self) -> Watermark {
        self.workers
            .iter()
            .map(|w| w.watermark)
            .min()
            .unwrap_or_else(Watermark::min)
    }

    pub fn query(&self, metric: MetricName) -> Option<&WindowAggregateSnapshot> {
        self.queries.iter().find(|q| q.metric == metric)
    }

    pub fn buffered_event_count(&self) -> usize {
        self.workers
            .iter()
            .flat_map(|w| &w.buffers)
            .map(|b| b.events.len())
            .sum()
    }

    /// Buffered candidates of every worker, for re-sharding on restore
    pub fn buffered_events(&self) -> Vec<(WindowBounds, StreamEvent)> {
        self.workers
            .iter()
            .flat_map(|w| &w.buffers)
            .flat_map(|b| b.events.iter().map(move |e| (b.window, e.clone())))
            .collect()
    }

    pub fn to_checkpoint(&self) -> StateResult<Checkpoint> {
        let mut data = vec![entry(
            META_KEY.to_string(),
            &SnapshotMeta {
                checkpoint_id: self.checkpoint_id,
            },
        )?];
        for source in &self.sources {
            data.push(entry(format!("{}{}", SOURCE_PREFIX, source.partition), source)?);
        }
        for worker in &self.workers {
            data.push(entry(format!("{}{}", WORKER_PREFIX, worker.worker), worker)?);
        }
        for query in &self.queries {
            data.push(entry(format!("{}{}", QUERY_PREFIX, query.metric), query)?);
        }
        Ok(Checkpoint::new(self.checkpoint_id, data))
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> StateResult<Self> {
        let mut meta: Option<SnapshotMeta> = None;
        let mut sources = BTreeMap::new();
        let mut workers = BTreeMap::new();
        let mut queries = Vec::new();

        for (key, value) in &checkpoint.data {
            let key = std::str::from_utf8(key).map_err(|e| StateError::DeserializationFailed {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })?;

            if key == META_KEY {
                meta = Some(decode(key, value)?);
            } else if key.starts_with(SOURCE_PREFIX) {
                let source: SourcePosition = decode(key, value)?;
                sources.insert(source.partition, source);
            } else if key.starts_with(WORKER_PREFIX) {
                let worker: WorkerSnapshot = decode(key, value)?;
                workers.insert(worker.worker, worker);
            } else if key.starts_with(QUERY_PREFIX) {
                queries.push(decode::<WindowAggregateSnapshot>(key, value)?);
            } else {
                return Err(StateError::DeserializationFailed {
                    key: key.to_string(),
                    reason: "unknown checkpoint entry".to_string(),
                });
            }
        }

        let meta = meta.ok_or_else(|| StateError::RestoreFailed {
            checkpoint_id: checkpoint.metadata.checkpoint_id.to_string(),
            reason: "checkpoint has no metadata entry".to_string(),
        })?;
        queries.sort_by_key(|q| q.metric);

        Ok(Self {
            checkpoint_id: meta.checkpoint_id,
            sources: sources.into_values().collect(),
            workers: workers.into_values().collect(),
            queries,
        })
    }
}

fn entry<T: Serialize>(key: String, value: &T) -> StateResult<(Vec<u8>, Vec<u8>)> {
    let bytes = serde_json::to_vec(value).map_err(|e| StateError::SerializationFailed {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    Ok((key.into_bytes(), bytes))
}

fn decode<T: DeserializeOwned>(key: &str, value: &[u8]) -> StateResult<T> {
    serde_json::from_slice(value).map_err(|e| StateError::DeserializationFailed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
