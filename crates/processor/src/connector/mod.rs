//! Source and sink seams of the pipeline
//!
//! A source is split into shards, each read by its own partition worker. The
//! sink receives batches of metric records in the order the queries produced
//! them. Kafka implementations live in [`crate::kafka`]; the in-memory ones in
//! [`memory`] back local runs and tests.

pub mod memory;

pub use memory::{MemoryShard, MemorySink, MemorySource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use telemetry_types::MetricRecord;

use crate::error::{ProcessorError, Result};

/// A raw record read from one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub partition: u32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Inbound partitioned stream
#[async_trait]
pub trait EventSource: Send {
    /// Open one reader per shard, positioned at `position`
    async fn open_shards(&mut self, position: &StartingPosition) -> Result<Vec<Box<dyn ShardReader>>>;
}

/// Reader of a single shard
#[async_trait]
pub trait ShardReader: Send {
    fn partition(&self) -> u32;

    /// Read up to `max` records
    ///
    /// An empty batch means nothing is available yet. `None` means the shard
    /// is exhausted and will never yield again.
    async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<SourceRecord>>>;
}

/// Outbound partitioned stream
#[async_trait]
pub trait MetricSink: Send {
    /// Write a batch; records of the same metric must keep their order
    async fn send_batch(&mut self, records: &[MetricRecord]) -> Result<()>;
}

/// Next offset to read per partition, e.g. `0:120,1:98`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    offsets: BTreeMap<u32, i64>,
}

impl ResumeToken {
    pub fn new(offsets: BTreeMap<u32, i64>) -> Self {
        Self { offsets }
    }

    /// Resume offset of `partition`, if the token covers it
    pub fn offset(&self, partition: u32) -> Option<i64> {
        self.offsets.get(&partition).copied()
    }

    pub fn offsets(&self) -> &BTreeMap<u32, i64> {
        &self.offsets
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .offsets
            .iter()
            .map(|(p, o)| format!("{}:{}", p, o))
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for ResumeToken {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProcessorError::Configuration {
            source: format!("invalid resume token '{}', expected '<partition>:<offset>,...'", s)
                .into(),
        };

        let mut offsets = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (partition, offset) = part.split_once(':').ok_or_else(invalid)?;
            let partition: u32 = partition.trim().parse().map_err(|_| invalid())?;
            let offset: i64 = offset.trim().parse().map_err(|_| invalid())?;
            if offset < 0 {
                return Err(invalid());
            }
            offsets.insert(partition, offset);
        }

        if offsets.is_empty() {
            return Err(invalid());
        }
        Ok(Self { offsets })
    }
}

/// Where shards start reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartingPosition {
    /// Oldest retained record
    Earliest,
    /// Only records appended after the source opens
    #[default]
    Latest,
    /// Explicit per-partition offsets; partitions not covered start earliest
    Resume(ResumeToken),
}

impl FromStr for StartingPosition {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            p if p.eq_ignore_ascii_case("earliest") || p.eq_ignore_ascii_case("trim_horizon") => {
                Ok(StartingPosition::Earliest)
            }
            p if p.eq_ignore_ascii_case("latest") => Ok(StartingPosition::Latest),
            token => token.parse().map(StartingPosition::Resume),
        }
    }
}

impl fmt::Display for StartingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartingPosition::Earliest => f.write_str("earliest"),
            StartingPosition::Latest => f.write_str("latest"),
            StartingPosition::Resume(token) => write!(f, "{}", token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_starting_position() {
        assert_eq!("earliest".parse::<StartingPosition>().unwrap(), StartingPosition::Earliest);
        assert_eq!("TRIM_HORIZON".parse::<StartingPosition>().unwrap(), StartingPosition::Earliest);
        assert_eq!("LATEST".parse::<StartingPosition>().unwrap(), StartingPosition::Latest);

        let StartingPosition::Resume(token) = "0:120, 1:98".parse::<StartingPosition>().unwrap()
        else {
            panic!("expected resume token");
        };
        assert_eq!(token.offset(0), Some(120));
        assert_eq!(token.offset(1), Some(98));
        assert_eq!(token.offset(2), None);
        assert_eq!(token.to_string(), "0:120,1:98");
    }

    #[test]
    fn test_invalid_positions() {
        assert!("".parse::<StartingPosition>().is_err());
        assert!("sometimes".parse::<StartingPosition>().is_err());
        assert!("0:abc".parse::<StartingPosition>().is_err());
        assert!("0:-1".parse::<StartingPosition>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for raw in ["earliest", "latest", "3:7"] {
            let position: StartingPosition = raw.parse().unwrap();
            assert_eq!(position.to_string(), raw);
        }
    }
}
