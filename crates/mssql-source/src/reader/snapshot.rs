use anyhow::{Context, Result};
use checkpoint::{OpaqueStateValue, SyncPhase};
use futures::TryStreamExt;
use select_query::{generate, keyset_after, SelectQuerySpec, SqlServer};
use sync_core::{Field, Value};
use tracing::debug;

use super::{value_at, CheckpointTimer, PartitionOutcome, PartitionReader};
use crate::cdc::Lsn;
use crate::connection::SourceConnection;
use crate::partition::{completed_state, cursor_state, snapshot_state, CursorTarget};
use crate::sink::StateMessage;

impl PartitionReader<'_> {
    fn columns(&self) -> SelectQuerySpec {
        SelectQuerySpec::columns(
            self.stream.id.namespace.as_deref(),
            &self.stream.id.name,
            self.stream.fields.clone(),
        )
    }

    async fn emit_stream_state(&self, phase: SyncPhase, state: OpaqueStateValue) -> Result<()> {
        self.sink
            .emit_state(StateMessage::Stream {
                stream: self.stream.id.clone(),
                phase,
                state,
            })
            .await
    }

    // State a finished snapshot hands over to the next invocation.
    async fn complete_snapshot(&self, cursor: Option<&CursorTarget>) -> Result<()> {
        match cursor {
            Some(target) => {
                let state = cursor_state(self.registry, &target.field, &target.upper_bound, 0)?;
                self.emit_stream_state(SyncPhase::CursorIncremental, state).await
            }
            None => {
                self.emit_stream_state(SyncPhase::Snapshot, completed_state(&self.stream.id))
                    .await
            }
        }
    }

    /// One unordered scan. Nothing to resume from, so the only state written
    /// is the completion state.
    pub(super) async fn read_full(
        &self,
        conn: &mut dyn SourceConnection,
        cursor: Option<&CursorTarget>,
    ) -> Result<PartitionOutcome> {
        let query = generate(&self.columns(), &SqlServer, self.registry)?;
        let mut records = 0u64;
        {
            let mut rows = conn
                .select(&query, &self.stream.fields)
                .await
                .with_context(|| format!("Failed to read {}", self.stream.id))?;
            while let Some(row) = rows.try_next().await? {
                if self.is_cancelled() {
                    return Ok(PartitionOutcome::Cancelled { records });
                }
                self.emit_row(&row, None).await?;
                records += 1;
            }
        }

        self.complete_snapshot(cursor).await?;
        Ok(PartitionOutcome::Completed { records })
    }

    /// Key-ordered pages of `page_size` rows after `lower_bound`.
    ///
    /// With `cdc_position` set every record carries the CDC metadata of the
    /// captured position and completion writes the snapshot sentinel.
    pub(super) async fn read_snapshot(
        &self,
        conn: &mut dyn SourceConnection,
        key: &[Field],
        lower_bound: Option<&[Value]>,
        cursor: Option<&CursorTarget>,
        cdc_position: Option<Lsn>,
    ) -> Result<PartitionOutcome> {
        let key_idx = key
            .iter()
            .map(|f| self.position_of(f))
            .collect::<Result<Vec<_>>>()?;
        let page_size = self.opts.page_size.max(1);
        let mut last_key: Option<Vec<Value>> = lower_bound.map(<[Value]>::to_vec);
        let mut timer = CheckpointTimer::new(self.opts.checkpoint_interval);
        let mut records = 0u64;

        loop {
            let mut spec = self.columns().order_by(key.to_vec()).limit(page_size);
            if let Some(after) = &last_key {
                spec = spec.filter(keyset_after(key, after)?);
            }
            let query = generate(&spec, &SqlServer, self.registry)?;
            debug!("{}: page after {:?}", self.stream.id, last_key);

            let mut page = 0u64;
            {
                let mut rows = conn
                    .select(&query, &self.stream.fields)
                    .await
                    .with_context(|| format!("Failed to read a page of {}", self.stream.id))?;
                while let Some(row) = rows.try_next().await? {
                    if self.is_cancelled() {
                        return Ok(PartitionOutcome::Cancelled { records });
                    }
                    self.emit_row(&row, cdc_position).await?;
                    records += 1;
                    page += 1;

                    let values: Vec<Value> = key_idx.iter().map(|&i| value_at(&row, i)).collect();
                    if timer.is_due() {
                        let state = snapshot_state(self.registry, key, &values)?;
                        self.emit_stream_state(SyncPhase::Snapshot, state).await?;
                        timer.reset();
                    }
                    last_key = Some(values);
                }
            }

            if page < page_size {
                break;
            }
        }

        self.complete_snapshot(cursor).await?;
        Ok(PartitionOutcome::Completed { records })
    }
}
