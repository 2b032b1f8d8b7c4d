//! Filesystem-based checkpoint storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};
use crate::SyncPhase;

/// Filesystem implementation of CheckpointStore trait.
///
/// Stores one JSON file per checkpoint id. Files are replaced atomically
/// (write to a temporary file, then rename) so a crash never leaves a
/// truncated checkpoint behind.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    /// Create a new FilesystemStore with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory path.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path_for(&self, id: &CheckpointID) -> PathBuf {
        self.dir
            .join(format!("checkpoint_{}_{}.json", id.database_type, id.key))
    }
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(
        &self,
        id: &CheckpointID,
        phase: SyncPhase,
        checkpoint_data: String,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let stored = StoredCheckpoint {
            checkpoint_data,
            database_type: id.database_type.clone(),
            key: id.key.clone(),
            phase,
            created_at: Utc::now(),
        };

        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&stored)?)
            .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace checkpoint {}", path.display()))?;

        tracing::debug!("Stored checkpoint to {}", path.display());
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let stored: StoredCheckpoint = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt checkpoint file {}", path.display()))?;

        if stored.database_type != id.database_type || stored.key != id.key {
            anyhow::bail!(
                "Checkpoint file {} belongs to '{}/{}', expected '{}/{}'",
                path.display(),
                stored.database_type,
                stored.key,
                id.database_type,
                id.key
            );
        }
        Ok(Some(stored))
    }
}
