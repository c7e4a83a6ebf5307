//! Checkpoint files and their on-disk store
//!
//! A checkpoint is a list of key/value entries plus metadata, written with
//! bincode. The checksum over the entries is verified on load; a mismatch
//! means the file is corrupt and the pipeline must not start from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use super::snapshot::PipelineSnapshot;
use crate::error::{StateError, StateResult};

const CHECKPOINT_EXTENSION: &str = "ckpt";
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: u64,
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
    /// Size of keys and values in bytes
    pub size_bytes: u64,
    pub checksum: String,
    /// Set once the checksum has been verified
    pub validated: bool,
    pub version: u32,
}

/// A checkpoint containing state entries and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub data: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Checkpoint {
    pub fn new(checkpoint_id: u64, data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let size_bytes = data
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>() as u64;

        Self {
            metadata: CheckpointMetadata {
                checkpoint_id,
                created_at: Utc::now(),
                entry_count: data.len(),
                size_bytes,
                checksum: Self::calculate_checksum(&data),
                validated: false,
                version: CHECKPOINT_FORMAT_VERSION,
            },
            data,
        }
    }

    fn calculate_checksum(data: &[(Vec<u8>, Vec<u8>)]) -> String {
        let mut hasher = Xxh3::new();
        for (key, value) in data {
            // Length prefixes keep entry boundaries part of the digest
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        }

        format!("{:016x}", hasher.digest())
    }

    /// Verify the checksum and format version
    pub fn validate(&mut self) -> StateResult<()> {
        if self.metadata.version != CHECKPOINT_FORMAT_VERSION {
            return Err(StateError::RestoreFailed {
                checkpoint_id: self.metadata.checkpoint_id.to_string(),
                reason: format!("unsupported format version {}", self.metadata.version),
            });
        }

        let calculated = Self::calculate_checksum(&self.data);
        if calculated != self.metadata.checksum || self.data.len() != self.metadata.entry_count {
            return Err(StateError::RestoreFailed {
                checkpoint_id: self.metadata.checkpoint_id.to_string(),
                reason: format!(
                    "Checksum mismatch: expected {}, got {}",
                    self.metadata.checksum, calculated
                ),
            });
        }

        self.metadata.validated = true;
        Ok(())
    }

    /// Write the checkpoint; the file only appears once fully written
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> StateResult<()> {
        let path = path.as_ref();
        let checkpoint_id = self.metadata.checkpoint_id.to_string();
        let write_failed = |reason: String| StateError::CheckpointFailed {
            checkpoint_id: checkpoint_id.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_failed(format!("Failed to create directory: {}", e)))?;
        }

        let serialized = bincode::serialize(self).map_err(|e| StateError::SerializationFailed {
            key: checkpoint_id.clone(),
            reason: e.to_string(),
        })?;

        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &serialized)
            .await
            .map_err(|e| write_failed(format!("Failed to write file: {}", e)))?;
        tokio::fs::rename(&staging, path)
            .await
            .map_err(|e| write_failed(format!("Failed to rename file: {}", e)))?;

        debug!(
            checkpoint_id = self.metadata.checkpoint_id,
            path = %path.display(),
            entries = self.metadata.entry_count,
            bytes = self.metadata.size_bytes,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Read and validate a checkpoint file
    pub async fn load<P: AsRef<Path>>(path: P) -> StateResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StateError::RestoreFailed {
                checkpoint_id: path.display().to_string(),
                reason: format!("Failed to read file: {}", e),
            })?;

        let mut checkpoint: Checkpoint =
            bincode::deserialize(&data).map_err(|e| StateError::DeserializationFailed {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?;

        checkpoint.validate()?;
        Ok(checkpoint)
    }
}

/// Directory of checkpoint files, newest id wins
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_id: u64) -> PathBuf {
        self.dir
            .join(format!("checkpoint_{:020}.{}", checkpoint_id, CHECKPOINT_EXTENSION))
    }

    /// Persist a snapshot and apply the retention policy
    pub async fn save(&self, snapshot: &PipelineSnapshot) -> StateResult<PathBuf> {
        let checkpoint = snapshot.to_checkpoint()?;
        let path = self.path_for(snapshot.checkpoint_id);
        checkpoint.save(&path).await?;
        self.cleanup().await?;

        info!(
            checkpoint_id = snapshot.checkpoint_id,
            sources = snapshot.sources.len(),
            buffered_events = snapshot.buffered_event_count(),
            "Checkpoint completed"
        );
        Ok(path)
    }

    /// Newest snapshot on disk, if any
    ///
    /// A corrupt newest checkpoint is an error, not a reason to fall back.
    pub async fn latest(&self) -> StateResult<Option<PipelineSnapshot>> {
        let Some(path) = self.list().await?.pop() else {
            return Ok(None);
        };

        info!(path = %path.display(), "Restoring from checkpoint");
        let checkpoint = Checkpoint::load(&path).await?;
        PipelineSnapshot::from_checkpoint(&checkpoint).map(Some)
    }

    /// Checkpoint files sorted oldest first
    async fn list(&self) -> StateResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::RestoreFailed {
                    checkpoint_id: "unknown".to_string(),
                    reason: format!("Failed to read checkpoint directory: {}", e),
                })
            }
        };

        let mut paths = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|e| StateError::RestoreFailed {
                checkpoint_id: "unknown".to_string(),
                reason: format!("Failed to read directory entry: {}", e),
            })?;
            let Some(entry) = entry else {
                break;
            };
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(CHECKPOINT_EXTENSION) {
                paths.push(path);
            }
        }

        // Zero-padded ids sort by name
        paths.sort();
        Ok(paths)
    }

    async fn cleanup(&self) -> StateResult<()> {
        let paths = self.list().await?;
        let excess = paths.len().saturating_sub(self.max_checkpoints);
        for path in paths.into_iter().take(excess) {
            debug!(path = %path.display(), "Deleting old checkpoint");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete checkpoint");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SourcePosition;

    fn entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"key1".to_vec(), b"value1".to_vec()),
            (b"key2".to_vec(), b"value2".to_vec()),
        ]
    }

    fn snapshot(checkpoint_id: u64) -> PipelineSnapshot {
        PipelineSnapshot {
            checkpoint_id,
            sources: vec![SourcePosition {
                partition: 0,
                next_offset: Some(checkpoint_id as i64),
                max_timestamp: Some(1_000),
            }],
            workers: Vec::new(),
            queries: Vec::new(),
        }
    }

    #[test]
    fn test_checkpoint_validation() {
        let mut checkpoint = Checkpoint::new(1, entries());
        assert_eq!(checkpoint.metadata.entry_count, 2);
        assert!(checkpoint.metadata.size_bytes > 0);

        checkpoint.validate().unwrap();
        assert!(checkpoint.metadata.validated);

        checkpoint.data[0].1 = b"tampered".to_vec();
        assert!(checkpoint.validate().is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("one.ckpt");

        Checkpoint::new(7, entries()).save(&path).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let loaded = Checkpoint::load(&path).await.unwrap();
        assert_eq!(loaded.metadata.checkpoint_id, 7);
        assert!(loaded.metadata.validated);
        assert_eq!(loaded.data, entries());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        tokio::fs::write(&path, b"definitely not bincode").await.unwrap();
        assert!(Checkpoint::load(&path).await.is_err());

        let store = CheckpointStore::new(dir.path(), 3);
        assert!(store.latest().await.is_err());
    }

    #[tokio::test]
    async fn test_store_latest_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"), 3);
        assert!(store.latest().await.unwrap().is_none());

        for id in 1..=5 {
            store.save(&snapshot(id)).await.unwrap();
        }

        let files = store.list().await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("checkpoint_00000000000000000003.ckpt"));

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 5);
        assert_eq!(latest.sources[0].next_offset, Some(5));
    }
}
