//! rdb-sync
//!
//! Incremental replication of SQL Server tables into a stream of JSON Lines
//! records and resumable state.
//!
//! # Features
//!
//! - Key-ordered resumable snapshots, with a non-resumable fallback for views
//!   and keyless tables
//! - Cursor-based incremental windows over a user-chosen column
//! - Change data capture with LSN checkpoints shared by every CDC stream
//! - Checkpoints persisted between invocations, readable from earlier
//!   connector state formats
//!
//! # CLI Usage
//!
//! ```bash
//! # Discover tables and write a catalog
//! rdb-sync discover --host localhost --database shop > catalog.json
//!
//! # Sync every stream of the catalog, resuming from the state directory
//! rdb-sync sync --host localhost --database shop --catalog catalog.yaml
//!
//! # Read incremental streams from change data capture
//! rdb-sync sync --host localhost --database shop --catalog catalog.yaml \
//!   --replication cdc --checkpoint-interval 1m
//! ```

use clap::{Parser, ValueEnum};
use rdb_sync_mssql_source::{
    InvalidCdcPositionBehavior, ReplicationMethod, SourceOpts, SyncOpts,
};

pub mod config;
pub mod output;

pub use config::parse_duration;
pub use output::JsonlSink;

/// SQL Server connection options
#[derive(Parser, Clone)]
pub struct ConnectionArgs {
    /// SQL Server host
    #[arg(long, default_value = "localhost", env = "MSSQL_HOST")]
    pub host: String,

    /// SQL Server port
    #[arg(long, default_value = "1433", env = "MSSQL_PORT")]
    pub port: u16,

    /// SQL Server login
    #[arg(long, default_value = "sa", env = "MSSQL_USER")]
    pub user: String,

    /// SQL Server password
    #[arg(long, env = "MSSQL_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Database to replicate
    #[arg(long, env = "MSSQL_DATABASE")]
    pub database: String,

    /// Trust the server certificate without validation
    #[arg(long, env = "MSSQL_TRUST_CERT")]
    pub trust_cert: bool,
}

impl ConnectionArgs {
    /// Pool options holding `max_connections` connections.
    pub fn source_opts(&self, max_connections: usize) -> SourceOpts {
        SourceOpts {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            trust_cert: self.trust_cert,
            max_connections,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Replication {
    /// Cursor column windows
    Cursor,
    /// Change data capture
    Cdc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InvalidPosition {
    /// Fail every CDC stream
    Fail,
    /// Snapshot the CDC streams again
    Resync,
}

/// Sync options (non-connection related)
#[derive(Parser, Clone)]
pub struct SyncArgs {
    /// How incremental streams are read
    #[arg(long, value_enum, default_value = "cursor", env = "RDB_SYNC_REPLICATION")]
    pub replication: Replication,

    /// Rows per snapshot page
    #[arg(long, default_value = "10000")]
    pub page_size: u64,

    /// Minimum time between intermediate checkpoints
    /// Format: duration in seconds or with units like "30s", "5m", "1h"
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub checkpoint_interval: std::time::Duration,

    /// Partitions read at the same time
    #[arg(long, default_value = "4", env = "RDB_SYNC_CONCURRENCY")]
    pub concurrency: usize,

    /// Leave rows whose temporal cursor falls on the current day for the next run
    #[arg(long)]
    pub exclude_todays_data: bool,

    /// What to do when the saved CDC position is no longer retained
    #[arg(long, value_enum, default_value = "fail")]
    pub invalid_cdc_position: InvalidPosition,

    /// Attempts for each CDC activation statement
    #[arg(long, default_value = "5")]
    pub cdc_activation_attempts: u32,
}

impl From<&SyncArgs> for SyncOpts {
    fn from(args: &SyncArgs) -> Self {
        Self {
            replication: match args.replication {
                Replication::Cursor => ReplicationMethod::Cursor,
                Replication::Cdc => ReplicationMethod::Cdc,
            },
            page_size: args.page_size,
            checkpoint_interval: args.checkpoint_interval,
            concurrency: args.concurrency.max(1),
            exclude_todays_data: args.exclude_todays_data,
            invalid_cdc_position: match args.invalid_cdc_position {
                InvalidPosition::Fail => InvalidCdcPositionBehavior::FailSync,
                InvalidPosition::Resync => InvalidCdcPositionBehavior::ReSyncData,
            },
            cdc_activation_attempts: args.cdc_activation_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        sync: SyncArgs,
    }

    #[test]
    fn test_sync_args_defaults() {
        let harness = Harness::try_parse_from(["rdb-sync"]).unwrap();
        let opts = SyncOpts::from(&harness.sync);
        assert_eq!(opts.replication, ReplicationMethod::Cursor);
        assert_eq!(opts.page_size, 10_000);
        assert_eq!(opts.checkpoint_interval, std::time::Duration::from_secs(300));
        assert_eq!(opts.invalid_cdc_position, InvalidCdcPositionBehavior::FailSync);
    }

    #[test]
    fn test_sync_args_cdc() {
        let harness = Harness::try_parse_from([
            "rdb-sync",
            "--replication",
            "cdc",
            "--checkpoint-interval",
            "30s",
            "--invalid-cdc-position",
            "resync",
            "--concurrency",
            "0",
        ])
        .unwrap();
        let opts = SyncOpts::from(&harness.sync);
        assert_eq!(opts.replication, ReplicationMethod::Cdc);
        assert_eq!(opts.checkpoint_interval, std::time::Duration::from_secs(30));
        assert_eq!(opts.invalid_cdc_position, InvalidCdcPositionBehavior::ReSyncData);
        assert_eq!(opts.concurrency, 1);
    }
}
