//! Checkpoint management for rdb-sync
//!
//! Provides the per-stream state codec (with migration of every historical
//! state shape) and storage-agnostic checkpoint persistence.
//!
//! # Architecture
//!
//! - `StreamStateValue` decodes and normalizes persisted stream state
//! - The `Checkpoint` trait describes the database-specific global checkpoint
//! - `CheckpointFile` wraps global checkpoints for storage-agnostic serialization
//! - `SyncManager` saves/loads both kinds through a `CheckpointStore`
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - Stores checkpoints as JSON files, one per key
//! - `NullStore` - Used when persistence is disabled

mod config;
mod file;
mod filesystem;
mod manager;
mod phase;
pub mod state;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{CheckpointStorage, SyncConfig};
pub use file::{CheckpointFile, CHECKPOINT_FILE_VERSION};
pub use filesystem::FilesystemStore;
pub use manager::{SyncManager, GLOBAL_KEY};
pub use phase::SyncPhase;
pub use state::{
    CursorBasedState, OpaqueStateValue, PrimaryKeyState, StreamStateValue, STATE_VERSION,
};
pub use store::{CheckpointID, CheckpointStore, NullStore, StoredCheckpoint};

/// Source-wide position of a change-log reader (for SQL Server, the CDC LSN).
///
/// Persisted through [`CheckpointFile`], which records [`Checkpoint::DATABASE_TYPE`]
/// so a checkpoint is never loaded as another source's position.
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct SequenceCheckpoint {
///     pub sequence: u64,
/// }
///
/// impl Checkpoint for SequenceCheckpoint {
///     const DATABASE_TYPE: &'static str = "sequence";
///
///     fn to_cli_string(&self) -> String {
///         self.sequence.to_string()
///     }
///
///     fn from_cli_string(s: &str) -> anyhow::Result<Self> {
///         Ok(Self { sequence: s.trim().parse()? })
///     }
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Source identifier stored next to the checkpoint, e.g. `"mssql"`.
    const DATABASE_TYPE: &'static str;

    /// Form accepted on the command line; `from_cli_string` must read it back.
    fn to_cli_string(&self) -> String;

    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}
