//! Execution of snapshot and cursor partitions.
//!
//! A reader owns one connection for the life of its partition, hands every
//! row to the sink as a [`SourceRecord`] and writes checkpoints only at
//! positions every earlier row was already delivered for. Cancellation stops
//! the read at the next row without writing a checkpoint.

mod cursor;
mod snapshot;


use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::Map;
use sync_core::temporal::format_local_date_time;
use sync_core::{Field, FieldTypeRegistry, Stream, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cdc::{add_cdc_metadata, Lsn};
use crate::connection::{SourceConnection, SourceRow};
use crate::partition::PartitionReadState;
use crate::sink::{OutputSink, SourceRecord};
use crate::SyncOpts;

/// Tells a reader when the next intermediate checkpoint is due.
#[derive(Debug)]
pub struct CheckpointTimer {
    interval: Duration,
    last: Instant,
}

impl CheckpointTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub fn is_due(&self) -> bool {
        self.last.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last = Instant::now();
    }
}

/// How a partition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Every row was delivered and the completion state written
    Completed { records: u64 },
    /// Stopped early; the last checkpoint stands
    Cancelled { records: u64 },
}

impl PartitionOutcome {
    pub fn records(&self) -> u64 {
        match self {
            Self::Completed { records } | Self::Cancelled { records } => *records,
        }
    }
}

/// Reads one stream's partition into the sink.
pub struct PartitionReader<'a> {
    stream: &'a Stream,
    registry: &'a FieldTypeRegistry,
    sink: &'a dyn OutputSink,
    opts: &'a SyncOpts,
    cancel: &'a CancellationToken,
}

impl<'a> PartitionReader<'a> {
    pub fn new(
        stream: &'a Stream,
        registry: &'a FieldTypeRegistry,
        sink: &'a dyn OutputSink,
        opts: &'a SyncOpts,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            stream,
            registry,
            sink,
            opts,
            cancel,
        }
    }

    pub async fn run(
        &self,
        conn: &mut dyn SourceConnection,
        state: &PartitionReadState,
    ) -> Result<PartitionOutcome> {
        info!("Reading {} as {}", self.stream.id, state.name());
        let outcome = match state {
            PartitionReadState::NonResumableSnapshot { cursor } => {
                self.read_full(conn, cursor.as_ref()).await?
            }
            PartitionReadState::ResumableSnapshot {
                key,
                lower_bound,
                cursor,
            } => {
                self.read_snapshot(conn, key, lower_bound.as_deref(), cursor.as_ref(), None)
                    .await?
            }
            PartitionReadState::CdcSnapshot {
                key,
                lower_bound,
                captured_position,
            } => {
                self.read_snapshot(
                    conn,
                    key,
                    lower_bound.as_deref(),
                    None,
                    Some(*captured_position),
                )
                .await?
            }
            PartitionReadState::CursorIncremental {
                cursor,
                lower_bound,
                upper_bound,
                exclude_today_cutoff,
            } => {
                self.read_window(
                    conn,
                    cursor,
                    lower_bound,
                    upper_bound,
                    exclude_today_cutoff.as_ref(),
                )
                .await?
            }
            PartitionReadState::CdcStreaming { .. } => {
                anyhow::bail!(
                    "Stream {} streams changes; it is read by the CDC session",
                    self.stream.id
                )
            }
        };

        match outcome {
            PartitionOutcome::Completed { records } => {
                info!("Finished {}: {} records", self.stream.id, records)
            }
            PartitionOutcome::Cancelled { records } => {
                info!("Cancelled {} after {} records", self.stream.id, records)
            }
        }
        Ok(outcome)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn position_of(&self, field: &Field) -> Result<usize> {
        self.stream
            .fields
            .iter()
            .position(|f| f.name == field.name)
            .ok_or_else(|| {
                anyhow::anyhow!("Column {} is not a field of {}", field.name, self.stream.id)
            })
    }

    async fn emit_row(&self, row: &SourceRow, cdc_position: Option<Lsn>) -> Result<()> {
        let emitted_at = Utc::now();
        let mut data: Map<String, serde_json::Value> = self
            .stream
            .fields
            .iter()
            .zip(row)
            .map(|(field, value)| (field.name.clone(), value.to_json()))
            .collect();
        if let Some(lsn) = cdc_position {
            add_cdc_metadata(
                &mut data,
                lsn,
                format_local_date_time(&emitted_at.naive_utc()),
                None,
            );
        }
        self.sink
            .emit_record(SourceRecord {
                stream: self.stream.id.clone(),
                data,
                emitted_at,
            })
            .await
    }
}

fn value_at(row: &SourceRow, idx: usize) -> Value {
    row.get(idx).cloned().unwrap_or(Value::Null)
}
