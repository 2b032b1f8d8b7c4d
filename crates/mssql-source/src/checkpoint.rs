//! SQL Server CDC checkpoint management
//!
//! The global checkpoint of a CDC sync is the LSN up to which every change of
//! every tracked capture instance has been handed to the sink.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cdc::{CdcTracker, Lsn};
use crate::connection::SourceConnection;

/// SQL Server-specific checkpoint containing the CDC position and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsSqlCdcCheckpoint {
    /// Every change with a commit LSN at or below this one was delivered
    pub lsn: Lsn,
    /// Timestamp when checkpoint was created
    pub timestamp: DateTime<Utc>,
}

impl MsSqlCdcCheckpoint {
    pub fn new(lsn: Lsn) -> Self {
        Self {
            lsn,
            timestamp: Utc::now(),
        }
    }
}

impl checkpoint::Checkpoint for MsSqlCdcCheckpoint {
    const DATABASE_TYPE: &'static str = "mssql";

    fn to_cli_string(&self) -> String {
        // Just the LSN - timestamp is optional metadata
        self.lsn.to_hex()
    }

    fn from_cli_string(s: &str) -> Result<Self> {
        let lsn = s
            .parse::<Lsn>()
            .map_err(|e| anyhow::anyhow!("Invalid SQL Server checkpoint '{s}': {e}"))?;
        Ok(Self::new(lsn))
    }
}

/// Checkpoint at the current maximum LSN of the database.
pub async fn get_current_checkpoint(conn: &mut dyn SourceConnection) -> Result<MsSqlCdcCheckpoint> {
    let lsn = CdcTracker::capture_position(conn).await?;
    Ok(MsSqlCdcCheckpoint::new(lsn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint::{Checkpoint, CheckpointFile, SyncConfig, SyncManager, SyncPhase};
    use tempfile::TempDir;

    #[test]
    fn test_mssql_checkpoint_cli_string_roundtrip() {
        let original = MsSqlCdcCheckpoint::new("00000027:00000758:0005".parse().unwrap());
        let cli = original.to_cli_string();
        assert_eq!(cli, "00000027000007580005");

        let parsed = MsSqlCdcCheckpoint::from_cli_string(&cli).unwrap();
        assert_eq!(parsed.lsn, original.lsn);
    }

    #[test]
    fn test_mssql_checkpoint_invalid_lsn() {
        let err = MsSqlCdcCheckpoint::from_cli_string("not-an-lsn").unwrap_err();
        assert!(err.to_string().contains("Invalid SQL Server checkpoint"));
    }

    #[test]
    fn test_mssql_checkpoint_file_type_mismatch() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct OtherCheckpoint {
            position: u64,
        }
        impl Checkpoint for OtherCheckpoint {
            const DATABASE_TYPE: &'static str = "other";
            fn to_cli_string(&self) -> String {
                self.position.to_string()
            }
            fn from_cli_string(s: &str) -> Result<Self> {
                Ok(Self { position: s.parse()? })
            }
        }

        let file = CheckpointFile::new(&OtherCheckpoint { position: 7 }, SyncPhase::CdcStreaming)
            .unwrap();
        assert!(file.parse::<MsSqlCdcCheckpoint>().is_err());
    }

    #[tokio::test]
    async fn test_mssql_checkpoint_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = SyncManager::new(
            SyncConfig::with_checkpoint_dir(dir.path().to_string_lossy().into_owned()),
            "mssql",
        );

        let checkpoint = MsSqlCdcCheckpoint::new("00000027:00000758:0005".parse().unwrap());
        manager
            .emit_checkpoint(&checkpoint, SyncPhase::CdcStreaming)
            .await
            .unwrap();

        let loaded: MsSqlCdcCheckpoint = manager.read_checkpoint().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }
}
