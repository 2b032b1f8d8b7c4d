//! Checkpoint storage trait and types
//!
//! This module defines the CheckpointStore trait for backend-agnostic
//! checkpoint storage operations, plus shared types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SyncPhase;

/// Checkpoint identifier for storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Database type (e.g., "mssql")
    pub database_type: String,
    /// Checkpoint key: "global" for the CDC position, `stream.<namespace>.<name>` for stream states
    pub key: String,
}

impl CheckpointID {
    /// Create a new checkpoint identifier.
    pub fn new(database_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            database_type: database_type.into(),
            key: key.into(),
        }
    }
}

/// Checkpoint data stored in backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// Serialized checkpoint (stream state JSON or CDC position)
    pub checkpoint_data: String,
    /// Database type for validation
    pub database_type: String,
    /// Checkpoint key for validation
    pub key: String,
    /// Sync phase the checkpoint was emitted in
    pub phase: SyncPhase,
    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,
}

/// Trait for checkpoint storage operations.
///
/// A store keeps only the latest checkpoint per [`CheckpointID`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint, replacing the previous one with the same id.
    async fn store_checkpoint(
        &self,
        id: &CheckpointID,
        phase: SyncPhase,
        checkpoint_data: String,
    ) -> Result<()>;

    /// Read a checkpoint from the storage backend.
    ///
    /// Returns None if the checkpoint doesn't exist.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>>;
}

/// Store used when persistence is disabled: writes are dropped, reads find nothing.
pub struct NullStore;

#[async_trait]
impl CheckpointStore for NullStore {
    async fn store_checkpoint(
        &self,
        _id: &CheckpointID,
        _phase: SyncPhase,
        _checkpoint_data: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn read_checkpoint(&self, _id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        Ok(None)
    }
}
