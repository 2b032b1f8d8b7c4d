//! Sync configuration for checkpoint operations.

/// Where checkpoints are persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointStorage {
    /// Checkpoints are only handed to the output sink, never persisted.
    Disabled,

    /// One JSON file per checkpoint key under `dir`.
    Filesystem { dir: String },
}

/// Configuration for checkpoint persistence.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether to persist checkpoints at all.
    pub emit_checkpoints: bool,

    /// Storage backend for persisted checkpoints.
    pub checkpoint_storage: CheckpointStorage,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            emit_checkpoints: true,
            checkpoint_storage: CheckpointStorage::Filesystem {
                dir: ".rdb-sync-checkpoints".to_string(),
            },
        }
    }
}

impl SyncConfig {
    /// Create a new sync config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist checkpoints as files under `checkpoint_dir`.
    pub fn with_checkpoint_dir(checkpoint_dir: String) -> Self {
        Self {
            emit_checkpoints: true,
            checkpoint_storage: CheckpointStorage::Filesystem {
                dir: checkpoint_dir,
            },
        }
    }

    /// Do not persist checkpoints.
    pub fn disabled() -> Self {
        Self {
            emit_checkpoints: false,
            checkpoint_storage: CheckpointStorage::Disabled,
        }
    }

    /// Check if checkpoint persistence is enabled and configured.
    pub fn should_emit_checkpoints(&self) -> bool {
        self.emit_checkpoints && self.checkpoint_storage != CheckpointStorage::Disabled
    }
}
