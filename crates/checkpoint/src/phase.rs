//! Sync phase enumeration for checkpoint tracking.

use serde::{Deserialize, Serialize};

/// The phase a stream was in when a checkpoint was emitted.
///
/// Stored next to every checkpoint so that the checkpoint directory can be
/// inspected without decoding state values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Initial or repeated table scan (resumable or not).
    Snapshot,

    /// Cursor-bounded incremental window.
    CursorIncremental,

    /// Change-log tailing; also used for the global CDC position.
    CdcStreaming,
}

impl SyncPhase {
    /// Get the string representation of this phase.
    pub fn as_str(&self) -> &str {
        match self {
            SyncPhase::Snapshot => "snapshot",
            SyncPhase::CursorIncremental => "cursor_incremental",
            SyncPhase::CdcStreaming => "cdc_streaming",
        }
    }

    /// Parse the string produced by [`SyncPhase::as_str`].
    pub fn parse(phase: &str) -> anyhow::Result<Self> {
        match phase {
            "snapshot" => Ok(SyncPhase::Snapshot),
            "cursor_incremental" => Ok(SyncPhase::CursorIncremental),
            "cdc_streaming" => Ok(SyncPhase::CdcStreaming),
            other => Err(anyhow::anyhow!("Unknown sync phase: {other}")),
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
