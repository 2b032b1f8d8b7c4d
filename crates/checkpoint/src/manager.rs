//! Generic sync manager for checkpoint operations.

use std::sync::Arc;

use crate::{
    store::{CheckpointStore, NullStore},
    Checkpoint, CheckpointFile, CheckpointID, CheckpointStorage, FilesystemStore,
    OpaqueStateValue, SyncConfig, SyncPhase,
};

/// Key under which the source-wide CDC position is stored.
pub const GLOBAL_KEY: &str = "global";

/// Manager for persisting and loading checkpoints.
///
/// Two kinds of checkpoints go through the manager:
/// - one global, database-specific [`Checkpoint`] (the CDC position);
/// - one [`OpaqueStateValue`] per stream, keyed by the stream's storage key.
///
/// # Example
///
/// ```rust,ignore
/// use checkpoint::{SyncConfig, SyncManager, SyncPhase};
///
/// let manager = SyncManager::new(SyncConfig::with_checkpoint_dir("/tmp/cp".into()), "mssql");
/// manager.emit_stream_state("dbo.users", SyncPhase::Snapshot, &state).await?;
/// let restored = manager.read_stream_state("dbo.users").await?;
/// ```
#[derive(Clone)]
pub struct SyncManager {
    config: SyncConfig,
    source_type: String,
    store: Arc<dyn CheckpointStore>,
}

impl SyncManager {
    /// Create a manager whose store follows `config.checkpoint_storage`.
    pub fn new(config: SyncConfig, source_type: impl Into<String>) -> Self {
        let store: Arc<dyn CheckpointStore> = match &config.checkpoint_storage {
            CheckpointStorage::Disabled => Arc::new(NullStore),
            CheckpointStorage::Filesystem { dir } => Arc::new(FilesystemStore::new(dir.clone())),
        };
        Self::with_store(config, source_type, store)
    }

    /// Create a manager backed by an explicit store.
    pub fn with_store(
        config: SyncConfig,
        source_type: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            source_type: source_type.into(),
            store,
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn stream_id(&self, stream_key: &str) -> CheckpointID {
        CheckpointID::new(self.source_type.clone(), format!("stream.{stream_key}"))
    }

    /// Persist the global database-specific checkpoint.
    pub async fn emit_checkpoint<C: Checkpoint>(
        &self,
        checkpoint: &C,
        phase: SyncPhase,
    ) -> anyhow::Result<()> {
        if !self.config.should_emit_checkpoints() {
            return Ok(());
        }

        let file = CheckpointFile::new(checkpoint, phase.clone())?;
        let id = CheckpointID::new(C::DATABASE_TYPE, GLOBAL_KEY);
        self.store
            .store_checkpoint(&id, phase.clone(), serde_json::to_string(&file)?)
            .await?;

        tracing::info!("Emitted {} checkpoint: {}", phase, checkpoint.to_cli_string());
        Ok(())
    }

    /// Load the global database-specific checkpoint, if one was persisted.
    pub async fn read_checkpoint<C: Checkpoint>(&self) -> anyhow::Result<Option<C>> {
        let id = CheckpointID::new(C::DATABASE_TYPE, GLOBAL_KEY);
        match self.store.read_checkpoint(&id).await? {
            Some(stored) => {
                let file: CheckpointFile = serde_json::from_str(&stored.checkpoint_data)?;
                Ok(Some(file.parse::<C>()?))
            }
            None => Ok(None),
        }
    }

    /// Persist the latest state of one stream.
    pub async fn emit_stream_state(
        &self,
        stream_key: &str,
        phase: SyncPhase,
        state: &OpaqueStateValue,
    ) -> anyhow::Result<()> {
        if !self.config.should_emit_checkpoints() {
            return Ok(());
        }

        let id = self.stream_id(stream_key);
        self.store
            .store_checkpoint(&id, phase, serde_json::to_string(state)?)
            .await?;
        tracing::debug!("Persisted {stream_key} state: {}", state.as_json());
        Ok(())
    }

    /// Load the latest persisted state of one stream.
    pub async fn read_stream_state(
        &self,
        stream_key: &str,
    ) -> anyhow::Result<Option<OpaqueStateValue>> {
        let id = self.stream_id(stream_key);
        match self.store.read_checkpoint(&id).await? {
            Some(stored) => Ok(Some(serde_json::from_str(&stored.checkpoint_data)?)),
            None => Ok(None),
        }
    }
}
