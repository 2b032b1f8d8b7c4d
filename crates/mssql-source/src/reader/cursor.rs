use std::cmp::Ordering;

use anyhow::{Context, Result};
use checkpoint::SyncPhase;
use futures::TryStreamExt;
use select_query::{generate, CmpOp, SelectQuerySpec, SqlServer, WhereNode};
use sync_core::{Field, Value};

use super::{value_at, CheckpointTimer, PartitionOutcome, PartitionReader};
use crate::connection::SourceConnection;
use crate::partition::cursor_state;
use crate::sink::StateMessage;

impl PartitionReader<'_> {
    async fn emit_cursor_state(&self, cursor: &Field, value: &Value, count: u64) -> Result<()> {
        let state = cursor_state(self.registry, cursor, value, count)?;
        self.sink
            .emit_state(StateMessage::Stream {
                stream: self.stream.id.clone(),
                phase: SyncPhase::CursorIncremental,
                state,
            })
            .await
    }

    /// Rows with `lower < cursor <= upper` (and `cursor < cutoff`), in
    /// cursor order.
    ///
    /// Rows sharing a cursor value are never split by a checkpoint: an
    /// intermediate state is only written once the next value shows up.
    pub(super) async fn read_window(
        &self,
        conn: &mut dyn SourceConnection,
        cursor: &Field,
        lower: &Value,
        upper: &Value,
        cutoff: Option<&Value>,
    ) -> Result<PartitionOutcome> {
        let idx = self.position_of(cursor)?;

        let mut spec = SelectQuerySpec::columns(
            self.stream.id.namespace.as_deref(),
            &self.stream.id.name,
            self.stream.fields.clone(),
        )
        .order_by(vec![cursor.clone()]);
        if !lower.is_null() {
            spec = spec.filter(WhereNode::cmp(cursor, CmpOp::Greater, lower.clone()));
        }
        spec = spec.filter(WhereNode::cmp(cursor, CmpOp::LesserOrEqual, upper.clone()));
        if let Some(cutoff) = cutoff {
            spec = spec.filter(WhereNode::cmp(cursor, CmpOp::Lesser, cutoff.clone()));
        }
        let query = generate(&spec, &SqlServer, self.registry)?;

        let mut timer = CheckpointTimer::new(self.opts.checkpoint_interval);
        let mut records = 0u64;
        // Latest cursor value and how many delivered rows carry it
        let mut current: Option<(Value, u64)> = None;
        {
            let mut rows = conn
                .select(&query, &self.stream.fields)
                .await
                .with_context(|| format!("Failed to read cursor window of {}", self.stream.id))?;
            while let Some(row) = rows.try_next().await? {
                if self.is_cancelled() {
                    return Ok(PartitionOutcome::Cancelled { records });
                }
                let value = value_at(&row, idx);

                match current.take() {
                    Some((previous, count))
                        if self.registry.compare(cursor, &value, &previous)? == Ordering::Equal =>
                    {
                        current = Some((previous, count + 1));
                    }
                    Some((previous, count)) => {
                        // Every row carrying `previous` was delivered
                        if timer.is_due() {
                            self.emit_cursor_state(cursor, &previous, count).await?;
                            timer.reset();
                        }
                        current = Some((value, 1));
                    }
                    None => current = Some((value, 1)),
                }

                self.emit_row(&row, None).await?;
                records += 1;
            }
        }

        let count = match &current {
            Some((last, count)) if self.registry.compare(cursor, last, upper)? == Ordering::Equal => {
                *count
            }
            _ => 0,
        };
        self.emit_cursor_state(cursor, upper, count).await?;
        Ok(PartitionOutcome::Completed { records })
    }
}
