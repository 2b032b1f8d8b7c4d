//! Envelope of the global checkpoint as it sits in a store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, SyncPhase};

/// Current envelope layout. Files without a version predate it and read as 0.
pub const CHECKPOINT_FILE_VERSION: u32 = 1;

/// A database-specific global checkpoint plus the metadata needed to load it
/// back safely.
///
/// ```json
/// {
///     "version": 1,
///     "database_type": "mssql",
///     "checkpoint": { "lsn": "0000002A000001F00003", "timestamp": "2024-01-01T00:00:00Z" },
///     "phase": "CdcStreaming",
///     "created_at": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(default)]
    pub version: u32,
    pub database_type: String,
    pub checkpoint: serde_json::Value,
    pub phase: SyncPhase,
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    pub fn new<C: Checkpoint>(checkpoint: &C, phase: SyncPhase) -> anyhow::Result<Self> {
        Ok(Self {
            version: CHECKPOINT_FILE_VERSION,
            database_type: C::DATABASE_TYPE.to_string(),
            checkpoint: serde_json::to_value(checkpoint)?,
            phase,
            created_at: Utc::now(),
        })
    }

    /// Decode the payload as `C`.
    ///
    /// Refuses checkpoints of another database type and envelopes written by
    /// a newer layout; silently resuming from either would skip or replay
    /// changes.
    pub fn parse<C: Checkpoint>(&self) -> anyhow::Result<C> {
        if self.database_type != C::DATABASE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::DATABASE_TYPE,
                self.database_type
            );
        }
        if self.version > CHECKPOINT_FILE_VERSION {
            anyhow::bail!(
                "Checkpoint file version {} is newer than the supported version {}",
                self.version,
                CHECKPOINT_FILE_VERSION
            );
        }
        serde_json::from_value(self.checkpoint.clone()).map_err(|e| {
            anyhow::anyhow!("Malformed {} checkpoint: {e}", self.database_type)
        })
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }
}
