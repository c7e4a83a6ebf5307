//! In-memory source and sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_types::{EventRecord, MetricRecord};

use super::{EventSource, MetricSink, ShardReader, SourceRecord, StartingPosition};
use crate::error::{ProcessorError, Result};

/// Wait between polls of an open shard that has nothing new
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct MemoryLog {
    shards: Mutex<Vec<Vec<Vec<u8>>>>,
    open: AtomicBool,
}

/// Partitioned log held in memory
///
/// A bounded log ends once a reader has consumed every record. An unbounded
/// log keeps readers polling until [`close`](Self::close) is called. Clones
/// share the same log, so records can be appended while a pipeline runs.
#[derive(Debug, Clone)]
pub struct MemorySource {
    log: Arc<MemoryLog>,
}

impl MemorySource {
    /// Bounded log with `partitions` shards
    pub fn new(partitions: u32) -> Self {
        Self::with_mode(partitions, false)
    }

    /// Log that stays open until closed
    pub fn unbounded(partitions: u32) -> Self {
        Self::with_mode(partitions, true)
    }

    fn with_mode(partitions: u32, open: bool) -> Self {
        Self {
            log: Arc::new(MemoryLog {
                shards: Mutex::new(vec![Vec::new(); partitions as usize]),
                open: AtomicBool::new(open),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.log.shards.lock().len() as u32
    }

    /// Append a raw payload and return its offset
    pub fn push(&self, partition: u32, payload: impl Into<Vec<u8>>) -> Result<i64> {
        let mut shards = self.log.shards.lock();
        let shard = shards
            .get_mut(partition as usize)
            .ok_or_else(|| ProcessorError::Unexpected(format!("no partition {}", partition)))?;
        shard.push(payload.into());
        Ok(shard.len() as i64 - 1)
    }

    /// Append an encoded event
    pub fn push_event(&self, partition: u32, record: &EventRecord) -> Result<i64> {
        let payload = record.to_vec()?;
        self.push(partition, payload)
    }

    /// End an unbounded log; readers finish after draining it
    pub fn close(&self) {
        self.log.open.store(false, Ordering::Release);
    }

    fn shard_len(&self, partition: u32) -> i64 {
        self.log
            .shards
            .lock()
            .get(partition as usize)
            .map_or(0, |s| s.len() as i64)
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn open_shards(&mut self, position: &StartingPosition) -> Result<Vec<Box<dyn ShardReader>>> {
        let readers = (0..self.partitions())
            .map(|partition| {
                let next = match position {
                    StartingPosition::Earliest => 0,
                    StartingPosition::Latest => self.shard_len(partition),
                    StartingPosition::Resume(token) => token.offset(partition).unwrap_or(0),
                };
                Box::new(MemoryShard {
                    log: self.log.clone(),
                    partition,
                    next,
                }) as Box<dyn ShardReader>
            })
            .collect();
        Ok(readers)
    }
}

/// Reader over one shard of a [`MemorySource`]
#[derive(Debug)]
pub struct MemoryShard {
    log: Arc<MemoryLog>,
    partition: u32,
    next: i64,
}

#[async_trait]
impl ShardReader for MemoryShard {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>> {
        let batch: Vec<SourceRecord> = {
            let shards = self.log.shards.lock();
            let shard = shards.get(self.partition as usize).map_or(&[][..], |s| &s[..]);
            let start = (self.next.max(0) as usize).min(shard.len());
            let end = start.saturating_add(max).min(shard.len());
            shard[start..end]
                .iter()
                .enumerate()
                .map(|(i, payload)| SourceRecord {
                    partition: self.partition,
                    offset: (start + i) as i64,
                    payload: payload.clone(),
                })
                .collect()
        };

        if let Some(last) = batch.last() {
            self.next = last.offset + 1;
            return Ok(Some(batch));
        }

        if self.log.open.load(Ordering::Acquire) {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            Ok(Some(Vec::new()))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    records: Vec<MetricRecord>,
    batch_sizes: Vec<usize>,
    failures_left: u32,
    attempts: u64,
}

/// Sink collecting records in memory
///
/// Clones share the collected records. Failures can be injected to exercise
/// retries.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient error
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_left = n;
    }

    /// Records written so far, in write order
    pub fn records(&self) -> Vec<MetricRecord> {
        self.state.lock().records.clone()
    }

    /// Size of every successful batch
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    /// Number of write attempts, failed ones included
    pub fn attempts(&self) -> u64 {
        self.state.lock().attempts
    }
}

#[async_trait]
impl MetricSink for MemorySink {
    async fn send_batch(&mut self, records: &[MetricRecord]) -> Result<()> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(ProcessorError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory sink unavailable",
            )));
        }
        state.records.extend_from_slice(records);
        state.batch_sizes.push(records.len());
        Ok(())
    }
}
