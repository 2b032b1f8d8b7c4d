//! Command-line interface for rdb-sync
//!
//! # Usage Examples
//!
//! ## Discovery
//! ```bash
//! rdb-sync discover --host localhost --database shop --password "$PW" > catalog.json
//! ```
//!
//! ## Sync
//! ```bash
//! # Snapshots and cursor windows; state is kept in .rdb-sync-state
//! rdb-sync sync --host localhost --database shop --catalog catalog.yaml
//!
//! # Change data capture, starting from an explicit LSN
//! rdb-sync sync --host localhost --database shop --catalog catalog.yaml \
//!   --replication cdc --cdc-start-from 0000002700000758000A
//! ```
//!
//! ## Checkpoint Format
//! - SQL Server: 20 hex digits of the commit LSN, e.g. `0000002700000758000A`
//!   (lower case and `00000027:00000758:000a` are accepted too)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use checkpoint::{Checkpoint, SyncConfig, SyncManager, SyncPhase};
use clap::{Parser, Subcommand};
use rdb_sync::{ConnectionArgs, JsonlSink, SyncArgs};
use rdb_sync_mssql_source::metadata::discover_streams;
use rdb_sync_mssql_source::{
    get_current_checkpoint, new_mssql_pool, run_sync, ConnectionProvider, MsSqlCdcCheckpoint,
    PersistingSink, SyncContext, SyncOpts,
};
use sync_core::Catalog;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rdb-sync")]
#[command(about = "Incremental replication of SQL Server tables to JSON Lines")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every stream of a catalog, resuming from saved state
    Sync {
        /// SQL Server connection options
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Sync options
        #[command(flatten)]
        sync: SyncArgs,

        /// Catalog of streams to sync (YAML or JSON)
        #[arg(long, value_name = "PATH", env = "RDB_SYNC_CATALOG")]
        catalog: PathBuf,

        /// Directory holding per-stream state and the CDC checkpoint
        #[arg(long, default_value = ".rdb-sync-state")]
        state_dir: String,

        /// Do not persist state (every run starts from scratch)
        #[arg(long)]
        no_state: bool,

        /// Replace the saved CDC checkpoint before syncing
        /// Format: LSN as 20 hex digits
        #[arg(long)]
        cdc_start_from: Option<String>,
    },

    /// List the tables of the database as a catalog
    Discover {
        /// SQL Server connection options
        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Print the current maximum LSN of the database
    CdcPosition {
        /// SQL Server connection options
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON Lines output
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            connection,
            sync,
            catalog,
            state_dir,
            no_state,
            cdc_start_from,
        } => {
            run_sync_command(
                connection,
                sync,
                catalog,
                state_dir,
                no_state,
                cdc_start_from,
            )
            .await
        }
        Commands::Discover { connection } => {
            let pool = new_mssql_pool(&connection.source_opts(1))?;
            let mut conn = pool.acquire().await?;
            let streams = discover_streams(conn.as_mut()).await?;
            info!("Discovered {} tables", streams.len());
            println!("{}", serde_json::to_string_pretty(&Catalog { streams })?);
            Ok(())
        }
        Commands::CdcPosition { connection } => {
            let pool = new_mssql_pool(&connection.source_opts(1))?;
            let mut conn = pool.acquire().await?;
            let checkpoint = get_current_checkpoint(conn.as_mut()).await?;
            println!("{}", checkpoint.to_cli_string());
            Ok(())
        }
    }
}

async fn run_sync_command(
    connection: ConnectionArgs,
    sync: SyncArgs,
    catalog: PathBuf,
    state_dir: String,
    no_state: bool,
    cdc_start_from: Option<String>,
) -> anyhow::Result<()> {
    let catalog = Catalog::from_file(&catalog)
        .with_context(|| format!("Failed to load catalog {}", catalog.display()))?;
    let opts = SyncOpts::from(&sync);
    info!(
        "Syncing {} streams from {}:{}/{}",
        catalog.streams.len(),
        connection.host,
        connection.port,
        connection.database
    );

    let config = if no_state {
        SyncConfig::disabled()
    } else {
        SyncConfig::with_checkpoint_dir(state_dir)
    };
    let manager = SyncManager::new(config, MsSqlCdcCheckpoint::DATABASE_TYPE);

    if let Some(start) = cdc_start_from {
        let checkpoint = MsSqlCdcCheckpoint::from_cli_string(&start)?;
        info!("Starting CDC from {}", checkpoint.lsn);
        manager
            .emit_checkpoint(&checkpoint, SyncPhase::CdcStreaming)
            .await?;
    }

    // One connection per concurrent partition plus the control connection
    let pool = new_mssql_pool(&connection.source_opts(opts.concurrency + 1))?;
    let output = Arc::new(JsonlSink::stdout());
    let sink = Arc::new(PersistingSink::new(output.clone(), manager.clone()));
    let ctx = SyncContext::new(Arc::new(pool), sink, opts);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next row");
            cancel.cancel();
        }
    });

    let report = run_sync(&ctx, &catalog, &manager).await;
    output.flush().await?;
    let report = report?.into_result()?;

    info!("Synced {} records", report.records);
    if let Some(position) = report.cdc_position {
        info!("CDC position: {}", position);
    }
    Ok(())
}
