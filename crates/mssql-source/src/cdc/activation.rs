//! One-time CDC setup: prerequisite checks and enabling capture.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sync_core::{Field, FieldType, StreamId, TypedValue, Value};
use tokio::time::sleep;
use tracing::{info, warn};

use super::tracker::CaptureInstance;
use crate::connection::{fetch_optional, raw_query, SourceConnection};

const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_JITTER_MS: u64 = 250;

// Azure SQL Database and Azure SQL Managed Instance run no Agent of their own.
const AZURE_EDITIONS: [i64; 2] = [5, 8];

async fn scalar(
    conn: &mut dyn SourceConnection,
    sql: &str,
    bindings: Vec<TypedValue>,
    field_type: FieldType,
) -> Result<Value> {
    let query = raw_query(sql, bindings);
    let row = fetch_optional(conn, &query, &[Field::new("value", field_type)]).await?;
    Ok(row.and_then(|r| r.into_iter().next()).unwrap_or(Value::Null))
}

/// Warn about anything that keeps change tables from filling up. Never fails
/// the sync; capture may be managed outside this connector.
pub async fn check_prerequisites(conn: &mut dyn SourceConnection) {
    match scalar(
        conn,
        "SELECT is_cdc_enabled FROM sys.databases WHERE name = DB_NAME()",
        vec![],
        FieldType::Boolean,
    )
    .await
    {
        Ok(Value::Boolean(true)) => info!("CDC is enabled for the database"),
        Ok(_) => warn!("CDC is not enabled for the database; run EXEC sys.sp_cdc_enable_db"),
        Err(e) => warn!("Could not check whether CDC is enabled: {e:#}"),
    }

    let edition = match scalar(
        conn,
        "SELECT CAST(SERVERPROPERTY('EngineEdition') AS INT)",
        vec![],
        FieldType::Integer,
    )
    .await
    {
        Ok(value) => value.as_i64(),
        Err(e) => {
            warn!("Could not read the engine edition: {e:#}");
            None
        }
    };
    if edition.is_some_and(|e| AZURE_EDITIONS.contains(&e)) {
        return;
    }

    match scalar(
        conn,
        "SELECT status_desc FROM sys.dm_server_services WHERE servicename LIKE 'SQL Server Agent%'",
        vec![],
        FieldType::String,
    )
    .await
    {
        Ok(Value::String(status)) if status.eq_ignore_ascii_case("Running") => {
            info!("SQL Server Agent is running")
        }
        Ok(status) => warn!(
            "SQL Server Agent is not running ({}); change tables will not be populated",
            status
        ),
        Err(e) => warn!("Could not check the SQL Server Agent status: {e:#}"),
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS * (1 << (attempt - 1).min(4));
    let jitter = rand::rng().random_range(0..=RETRY_MAX_JITTER_MS);
    Duration::from_millis(exp + jitter)
}

async fn execute_with_retry(
    conn: &mut dyn SourceConnection,
    what: &str,
    sql: &str,
    bindings: Vec<TypedValue>,
    attempts: u32,
) -> bool {
    let query = raw_query(sql, bindings);
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match conn.execute(&query).await {
            Ok(_) => {
                info!("{} succeeded", what);
                return true;
            }
            Err(e) if attempt < attempts => {
                let delay = backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    what, attempt, attempts, delay, e
                );
                sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    "{} failed after {} attempts, assuming capture is managed elsewhere: {:#}",
                    what, attempts, e
                );
            }
        }
    }
    false
}

/// Enable CDC for the database and for every stream that has no capture
/// instance yet. Returns the streams for which enabling succeeded.
pub async fn activate_capture(
    conn: &mut dyn SourceConnection,
    streams: &[StreamId],
    instances: &BTreeMap<StreamId, CaptureInstance>,
    attempts: u32,
) -> Vec<StreamId> {
    let missing: Vec<&StreamId> = streams
        .iter()
        .filter(|id| !instances.contains_key(*id))
        .collect();
    if missing.is_empty() {
        return Vec::new();
    }

    execute_with_retry(
        conn,
        "Enabling CDC for the database",
        "IF (SELECT is_cdc_enabled FROM sys.databases WHERE name = DB_NAME()) = 0 \
         EXEC sys.sp_cdc_enable_db",
        vec![],
        attempts,
    )
    .await;

    let mut enabled = Vec::new();
    for id in missing {
        let schema = id.namespace.clone().unwrap_or_else(|| "dbo".to_string());
        let text = |s: String| TypedValue::new(FieldType::String, Value::String(s));
        let ok = execute_with_retry(
            conn,
            &format!("Enabling CDC for {id}"),
            "EXEC sys.sp_cdc_enable_table @source_schema = @P1, @source_name = @P2, @role_name = NULL",
            vec![text(schema), text(id.name.clone())],
            attempts,
        )
        .await;
        if ok {
            enabled.push(id.clone());
        }
    }
    enabled
}
