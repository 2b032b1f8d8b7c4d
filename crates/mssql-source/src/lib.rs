//! SQL Server source for rdb-sync
//!
//! Reads the streams of a catalog from SQL Server as key-ordered snapshots,
//! cursor-bounded incremental windows, or from the change-data-capture feed,
//! and hands records plus resumable state to an [`OutputSink`].
//!
//! # Architecture
//!
//! - [`metadata`] discovers tables, keys and clustered indexes
//! - [`factory::PartitionFactory`] turns (persisted state, configuration) into
//!   one [`partition::PartitionReadState`] per stream
//! - [`reader::PartitionReader`] executes snapshot and cursor partitions
//! - [`cdc`] tracks LSNs, activates capture and merges change tables
//! - [`run_sync`] schedules everything with bounded concurrency

pub mod cdc;
pub mod checkpoint;
mod client;
mod connection;
pub mod factory;
pub mod metadata;
pub mod partition;
pub mod reader;
pub mod sink;
mod sync;
pub mod testing;

pub use checkpoint::{get_current_checkpoint, MsSqlCdcCheckpoint};
pub use client::{new_mssql_pool, TiberiusConnection};
pub use connection::{
    fetch_all, fetch_optional, raw_query, ConnectionProvider, RowStream, SourceConnection,
    SourceRow,
};
pub use sink::{OutputSink, PersistingSink, SourceRecord, StateMessage};
pub use sync::{run_sync, StreamFailure, SyncContext, SyncReport};

use std::time::Duration;

/// SQL Server connection options
#[derive(Clone)]
pub struct SourceOpts {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Trust the server certificate without validation
    pub trust_cert: bool,
    /// Upper bound of pooled connections
    pub max_connections: usize,
}

impl std::fmt::Debug for SourceOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOpts")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("trust_cert", &self.trust_cert)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// How incremental streams are read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMethod {
    /// Bounded windows over a user-chosen cursor column
    Cursor,
    /// SQL Server change data capture
    Cdc,
}

/// What to do when the saved CDC position fell out of the retention window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidCdcPositionBehavior {
    /// Fail every CDC stream
    FailSync,
    /// Drop the CDC streams' state and snapshot them again
    ReSyncData,
}

/// Sync options (non-connection related)
#[derive(Clone, Debug)]
pub struct SyncOpts {
    pub replication: ReplicationMethod,
    /// Rows per snapshot page
    pub page_size: u64,
    /// Minimum time between two intermediate checkpoints of one partition
    pub checkpoint_interval: Duration,
    /// Partitions read at the same time
    pub concurrency: usize,
    /// Leave rows whose temporal cursor falls on the current day for the next run
    pub exclude_todays_data: bool,
    pub invalid_cdc_position: InvalidCdcPositionBehavior,
    /// Attempts for each CDC activation statement
    pub cdc_activation_attempts: u32,
}

impl Default for SyncOpts {
    fn default() -> Self {
        Self {
            replication: ReplicationMethod::Cursor,
            page_size: 10_000,
            checkpoint_interval: Duration::from_secs(300),
            concurrency: 4,
            exclude_todays_data: false,
            invalid_cdc_position: InvalidCdcPositionBehavior::FailSync,
            cdc_activation_attempts: 5,
        }
    }
}
