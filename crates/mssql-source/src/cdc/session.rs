//! Replay of the change tables into the sink.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CdcTracker, Lsn};
use crate::checkpoint::MsSqlCdcCheckpoint;
use crate::connection::SourceConnection;
use crate::partition::completed_state;
use crate::reader::CheckpointTimer;
use crate::sink::{OutputSink, StateMessage};

/// How a CDC session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcOutcome {
    /// Every change up to `position` was delivered and checkpointed
    Completed { records: u64, position: Lsn },
    /// Stopped early; the last checkpoint stands
    Cancelled { records: u64 },
}

fn global_state(tracker: &CdcTracker, position: Lsn) -> StateMessage {
    StateMessage::Global {
        cdc: MsSqlCdcCheckpoint::new(position),
        streams: tracker
            .streams()
            .iter()
            .map(|t| (t.stream.id.clone(), completed_state(&t.stream.id)))
            .collect(),
    }
}

/// Deliver every change after the tracker's position up to the maximum LSN
/// captured when the session starts.
///
/// Intermediate checkpoints are only written between two commits, once
/// `checkpoint_interval` elapsed; the final one is written at the target.
pub async fn run_cdc_session(
    conn: &mut dyn SourceConnection,
    tracker: &mut CdcTracker,
    sink: &dyn OutputSink,
    checkpoint_interval: Duration,
    cancel: &CancellationToken,
) -> Result<CdcOutcome> {
    let target = CdcTracker::capture_position(conn).await?;
    let start = tracker.position();
    info!(
        "CDC session for {} streams from {} to {}",
        tracker.streams().len(),
        start,
        target
    );

    let mut replay = tracker.stream_from(conn, start, target).await?;
    let mut timer = CheckpointTimer::new(checkpoint_interval);
    let mut checkpointed = start;
    let mut records = 0u64;

    loop {
        if cancel.is_cancelled() {
            info!("CDC session cancelled after {} records", records);
            return Ok(CdcOutcome::Cancelled { records });
        }
        let Some(event) = replay.next(conn).await? else {
            break;
        };

        sink.emit_record(event.to_record(Utc::now())).await?;
        records += 1;

        let safe = tracker.advance(&event);
        if safe > checkpointed && timer.is_due() {
            debug!("Checkpointing CDC position {}", safe);
            sink.emit_state(global_state(tracker, safe)).await?;
            checkpointed = safe;
            timer.reset();
        }
    }

    let position = tracker.finish(target);
    sink.emit_state(global_state(tracker, position)).await?;
    info!("CDC session delivered {} records up to {}", records, position);
    Ok(CdcOutcome::Completed { records, position })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::TrackedStream;
    use crate::testing::{FakeDatabase, MemorySink, SinkEvent};
    use sync_core::{Field, FieldType, Stream, StreamId, SyncMode, Value};

    fn lsn(n: u8) -> Lsn {
        let mut bytes = [0u8; 10];
        bytes[7] = n;
        Lsn::new(bytes)
    }

    fn bytes(n: u8) -> Value {
        Value::Bytes(lsn(n).as_bytes().to_vec())
    }

    fn orders() -> TrackedStream {
        TrackedStream {
            stream: Stream {
                id: StreamId::new(Some("dbo"), "orders"),
                fields: vec![Field::new("id", FieldType::Integer)],
                sync_mode: SyncMode::Incremental,
                primary_key: vec![vec!["id".into()]],
                cursor: None,
            },
            instance: "dbo_orders".into(),
        }
    }

    fn change(start: u8, seq: u8, id: i64) -> Vec<Value> {
        vec![bytes(start), bytes(seq), Value::Integer(2), Value::Null, Value::Integer(id)]
    }

    fn scripted() -> FakeDatabase {
        let db = FakeDatabase::new();
        db.rows("fn_cdc_get_max_lsn", vec![vec![bytes(9)]]);
        db.rows("fn_cdc_get_min_lsn", vec![vec![bytes(1)]]);
        db.rows(
            "fn_cdc_get_all_changes",
            vec![change(3, 1, 1), change(3, 2, 2), change(4, 1, 3)],
        );
        db
    }

    fn global_position(event: &SinkEvent) -> Option<Lsn> {
        match event {
            SinkEvent::State(StateMessage::Global { cdc, .. }) => Some(cdc.lsn),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_session_checkpoints_at_target() {
        let db = scripted();
        let sink = MemorySink::new();
        let mut tracker = CdcTracker::new(lsn(2), vec![orders()]);
        let mut conn = db.connection();

        let outcome = run_cdc_session(
            &mut conn,
            &mut tracker,
            &sink,
            Duration::from_secs(3600),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, CdcOutcome::Completed { records: 3, position: lsn(9) });
        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert_eq!(global_position(&events[3]), Some(lsn(9)));
        match &events[3] {
            SinkEvent::State(StateMessage::Global { streams, .. }) => {
                assert_eq!(streams[0].0, orders().stream.id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_intermediate_checkpoints_fall_between_commits() {
        let db = scripted();
        let sink = MemorySink::new();
        let mut tracker = CdcTracker::new(lsn(2), vec![orders()]);
        let mut conn = db.connection();

        run_cdc_session(
            &mut conn,
            &mut tracker,
            &sink,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // records 1 and 2 share commit 3; commit 3 is complete once 4 starts
        let positions: Vec<Option<Lsn>> = sink.events().iter().map(global_position).collect();
        assert_eq!(
            positions,
            vec![None, None, None, Some(lsn(3)), Some(lsn(9))]
        );
    }

    #[tokio::test]
    async fn test_cancelled_session_writes_no_checkpoint() {
        let db = scripted();
        let sink = MemorySink::new();
        let mut tracker = CdcTracker::new(lsn(2), vec![orders()]);
        let mut conn = db.connection();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_cdc_session(&mut conn, &mut tracker, &sink, Duration::ZERO, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CdcOutcome::Cancelled { records: 0 });
        assert!(sink.states().is_empty());
    }
}
