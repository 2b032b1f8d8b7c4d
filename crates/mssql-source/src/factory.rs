//! Decides, once per stream and invocation, how the stream is read.
//!
//! Input is the stream's configuration, its table metadata and the persisted
//! state (if any); output is a [`PartitionReadState`], or `None` when the
//! stream is caught up. The decision is deterministic except for the bounds
//! captured from the database (`MAX(cursor)`) and the CDC start position.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use checkpoint::{OpaqueStateValue, PrimaryKeyState, StreamStateValue};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use select_query::{generate, CmpOp, SelectQuerySpec, SqlServer, WhereNode};
use sync_core::{Field, FieldType, FieldTypeRegistry, Stream, SyncMode, Value};
use tracing::{debug, info, warn};

use crate::cdc::Lsn;
use crate::connection::{fetch_optional, SourceConnection};
use crate::metadata::TableMetadata;
use crate::partition::{CursorTarget, PartitionReadState};
use crate::{ReplicationMethod, SyncOpts};

/// Builds one partition per stream.
pub struct PartitionFactory<'a> {
    registry: &'a FieldTypeRegistry,
    replication: ReplicationMethod,
    exclude_todays_data: bool,
    /// Where CDC streaming resumes; required in CDC mode
    cdc_position: Option<Lsn>,
    today: NaiveDate,
}

impl<'a> PartitionFactory<'a> {
    pub fn new(registry: &'a FieldTypeRegistry, opts: &SyncOpts, cdc_position: Option<Lsn>) -> Self {
        Self {
            registry,
            replication: opts.replication,
            exclude_todays_data: opts.exclude_todays_data,
            cdc_position,
            today: Utc::now().date_naive(),
        }
    }

    /// Override the date "exclude today's data" cuts at.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub async fn create(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        metadata: &TableMetadata,
        state: Option<&OpaqueStateValue>,
    ) -> Result<Option<PartitionReadState>> {
        if stream.sync_mode == SyncMode::FullRefresh {
            // Stored state never applies to a full refresh
            return Ok(Some(PartitionReadState::NonResumableSnapshot { cursor: None }));
        }

        let state = state
            .map(OpaqueStateValue::migrate)
            .filter(|state| !state.is_start_of_stream());
        let key = metadata.resumption_key(stream)?;

        let partition = match self.replication {
            ReplicationMethod::Cursor => self.cursor_partition(conn, stream, key, state).await?,
            ReplicationMethod::Cdc => self.cdc_partition(stream, key, state)?,
        };

        match &partition {
            Some(p) => info!("Stream {} reads as {}", stream.id, p.name()),
            None => info!("Stream {} is caught up", stream.id),
        }
        Ok(partition)
    }

    async fn cursor_partition(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        key: Option<Vec<Field>>,
        state: Option<StreamStateValue>,
    ) -> Result<Option<PartitionReadState>> {
        let cursor = stream.cursor_field()?.ok_or_else(|| {
            anyhow::anyhow!("Stream {} is incremental but has no cursor configured", stream.id)
        })?;

        match state {
            None => self.cold_start(conn, stream, key, cursor).await,
            Some(StreamStateValue::PrimaryKey(pk)) => {
                let lower_bound = match &key {
                    Some(key) => self.key_bound(stream, key, &pk)?,
                    None => None,
                };
                let target = self.capture_target(conn, stream, cursor).await?;
                Ok(Some(snapshot_with_cursor(key, lower_bound, target)))
            }
            Some(StreamStateValue::CursorBased(state))
                if state.is_completed_snapshot_of(&stream.id.name, stream.id.namespace.as_deref()) =>
            {
                self.cursor_window(conn, stream, cursor, Value::Null).await
            }
            Some(StreamStateValue::CursorBased(state))
                if state.cursor_name() == Some(cursor.name.as_str()) =>
            {
                let lower_bound = self
                    .registry
                    .decode_state_value(&cursor, &state.cursor)
                    .with_context(|| {
                        format!("Invalid cursor value in state of stream {}", stream.id)
                    })?;
                self.cursor_window(conn, stream, cursor, lower_bound).await
            }
            Some(StreamStateValue::CursorBased(state)) => {
                warn!(
                    "Stream {} state tracks cursor {:?} but {} is configured; reading from scratch",
                    stream.id, state.cursor_field, cursor.name
                );
                self.cold_start(conn, stream, key, cursor).await
            }
        }
    }

    fn cdc_partition(
        &self,
        stream: &Stream,
        key: Option<Vec<Field>>,
        state: Option<StreamStateValue>,
    ) -> Result<Option<PartitionReadState>> {
        let position = self
            .cdc_position
            .ok_or_else(|| anyhow::anyhow!("No CDC start position for stream {}", stream.id))?;

        let lower_bound = match (&state, &key) {
            (Some(StreamStateValue::PrimaryKey(pk)), Some(key)) => self.key_bound(stream, key, pk)?,
            (Some(StreamStateValue::CursorBased(state)), _)
                if state.is_completed_snapshot_of(&stream.id.name, stream.id.namespace.as_deref()) =>
            {
                return Ok(Some(PartitionReadState::CdcStreaming { position }));
            }
            (Some(StreamStateValue::CursorBased(_)), _) => {
                warn!("Stream {} has cursor state but reads through CDC; snapshotting again", stream.id);
                None
            }
            _ => None,
        };

        Ok(Some(match key {
            Some(key) => PartitionReadState::CdcSnapshot {
                key,
                lower_bound,
                captured_position: position,
            },
            None => PartitionReadState::NonResumableSnapshot { cursor: None },
        }))
    }

    async fn cold_start(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        key: Option<Vec<Field>>,
        cursor: Field,
    ) -> Result<Option<PartitionReadState>> {
        let target = self.capture_target(conn, stream, cursor).await?;
        Ok(Some(snapshot_with_cursor(key, None, target)))
    }

    async fn cursor_window(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        cursor: Field,
        lower_bound: Value,
    ) -> Result<Option<PartitionReadState>> {
        let cutoff = self.exclude_today_cutoff(&cursor);
        let upper_bound = self
            .max_cursor(conn, stream, &cursor, cutoff.as_ref())
            .await?;

        // Null sorts first, so a null upper bound (empty table) is never greater
        if self.registry.compare(&cursor, &upper_bound, &lower_bound)? != Ordering::Greater {
            debug!(
                "Stream {}: upper bound {} does not exceed {}",
                stream.id, upper_bound, lower_bound
            );
            return Ok(None);
        }

        Ok(Some(PartitionReadState::CursorIncremental {
            cursor,
            lower_bound,
            upper_bound,
            exclude_today_cutoff: cutoff,
        }))
    }

    async fn capture_target(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        cursor: Field,
    ) -> Result<CursorTarget> {
        let cutoff = self.exclude_today_cutoff(&cursor);
        let upper_bound = self
            .max_cursor(conn, stream, &cursor, cutoff.as_ref())
            .await?;
        Ok(CursorTarget {
            field: cursor,
            upper_bound,
        })
    }

    async fn max_cursor(
        &self,
        conn: &mut dyn SourceConnection,
        stream: &Stream,
        cursor: &Field,
        cutoff: Option<&Value>,
    ) -> Result<Value> {
        let mut spec = SelectQuerySpec::max(stream.id.namespace.as_deref(), &stream.id.name, cursor.clone());
        if let Some(cutoff) = cutoff {
            spec = spec.filter(WhereNode::cmp(cursor, CmpOp::Lesser, cutoff.clone()));
        }
        let query = generate(&spec, &SqlServer, self.registry)?;

        let raw = fetch_optional(conn, &query, std::slice::from_ref(cursor))
            .await
            .with_context(|| format!("Failed to capture MAX({}) of {}", cursor.name, stream.id))?
            .and_then(|row| row.into_iter().next())
            .unwrap_or(Value::Null);
        Ok(self.registry.encode_literal(cursor, &raw)?.value)
    }

    fn exclude_today_cutoff(&self, cursor: &Field) -> Option<Value> {
        if !self.exclude_todays_data {
            return None;
        }
        let midnight = self.today.and_time(NaiveTime::MIN);
        match cursor.field_type {
            FieldType::Date => Some(Value::Date(self.today)),
            FieldType::LocalDateTime => Some(Value::LocalDateTime(midnight)),
            FieldType::OffsetDateTime => Some(Value::OffsetDateTime(
                Utc.from_utc_datetime(&midnight).fixed_offset(),
            )),
            _ => {
                debug!("Cursor {} is not temporal; today's data is included", cursor.name);
                None
            }
        }
    }

    // Last delivered key of an interrupted snapshot, or None to start over.
    fn key_bound(
        &self,
        stream: &Stream,
        key: &[Field],
        state: &PrimaryKeyState,
    ) -> Result<Option<Vec<Value>>> {
        let names: Vec<&str> = key.iter().map(|f| f.name.as_str()).collect();
        if state.pk_names != names {
            warn!(
                "Stream {} snapshot state is keyed by {:?} but the table is keyed by {:?}; restarting snapshot",
                stream.id, state.pk_names, names
            );
            return Ok(None);
        }

        let values = key
            .iter()
            .zip(&state.pk_values)
            .map(|(field, raw)| self.registry.decode_state_value(field, raw))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid key value in state of stream {}", stream.id))?;

        if values.iter().any(Value::is_null) {
            return Ok(None);
        }
        Ok(Some(values))
    }
}

fn snapshot_with_cursor(
    key: Option<Vec<Field>>,
    lower_bound: Option<Vec<Value>>,
    target: CursorTarget,
) -> PartitionReadState {
    match key {
        Some(key) => PartitionReadState::ResumableSnapshot {
            key,
            lower_bound,
            cursor: Some(target),
        },
        None => PartitionReadState::NonResumableSnapshot {
            cursor: Some(target),
        },
    }
}

/// The completed-snapshot sentinel of `stream`, decoded.
pub fn is_completed(stream: &Stream, state: &OpaqueStateValue) -> bool {
    matches!(
        state.migrate(),
        StreamStateValue::CursorBased(ref s)
            if s.is_completed_snapshot_of(&stream.id.name, stream.id.namespace.as_deref())
    )
}
