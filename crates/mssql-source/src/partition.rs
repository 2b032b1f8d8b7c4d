//! Working representation of one stream's read for this invocation, and the
//! state values partitions write back.

use checkpoint::{CursorBasedState, OpaqueStateValue, PrimaryKeyState, StreamStateValue, SyncPhase};
use sync_core::{CodecError, Field, FieldTypeRegistry, StreamId, Value};

use crate::cdc::Lsn;

/// Cursor column and the bound captured with `MAX(cursor)` when the
/// partition was created.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorTarget {
    pub field: Field,
    pub upper_bound: Value,
}

/// How a stream is read this invocation. A stream with nothing left to read
/// gets no partition at all.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionReadState {
    /// One unordered full scan; only the completion state is ever written.
    NonResumableSnapshot { cursor: Option<CursorTarget> },

    /// Key-ordered pages, resumable after the last delivered key.
    ResumableSnapshot {
        key: Vec<Field>,
        lower_bound: Option<Vec<Value>>,
        cursor: Option<CursorTarget>,
    },

    /// Rows with `lower_bound < cursor <= upper_bound`, in cursor order.
    CursorIncremental {
        cursor: Field,
        lower_bound: Value,
        upper_bound: Value,
        exclude_today_cutoff: Option<Value>,
    },

    /// Initial snapshot of a CDC stream; streaming resumes at `captured_position`.
    CdcSnapshot {
        key: Vec<Field>,
        lower_bound: Option<Vec<Value>>,
        captured_position: Lsn,
    },

    /// Replay of the change tables after `position`.
    CdcStreaming { position: Lsn },
}

impl PartitionReadState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NonResumableSnapshot { .. } => "non-resumable snapshot",
            Self::ResumableSnapshot { .. } => "resumable snapshot",
            Self::CursorIncremental { .. } => "cursor incremental",
            Self::CdcSnapshot { .. } => "CDC snapshot",
            Self::CdcStreaming { .. } => "CDC streaming",
        }
    }

    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::NonResumableSnapshot { .. }
            | Self::ResumableSnapshot { .. }
            | Self::CdcSnapshot { .. } => SyncPhase::Snapshot,
            Self::CursorIncremental { .. } => SyncPhase::CursorIncremental,
            Self::CdcStreaming { .. } => SyncPhase::CdcStreaming,
        }
    }
}

/// State after a snapshot delivered every row up to `values` in `key` order.
pub fn snapshot_state(
    registry: &FieldTypeRegistry,
    key: &[Field],
    values: &[Value],
) -> Result<OpaqueStateValue, CodecError> {
    let pk_values = key
        .iter()
        .zip(values)
        .map(|(field, value)| registry.encode_state_value(field, value))
        .collect::<Result<Vec<_>, _>>()?;
    let pk_names = key.iter().map(|f| f.name.clone()).collect();
    Ok(StreamStateValue::PrimaryKey(PrimaryKeyState::new(pk_names, pk_values)).to_opaque())
}

/// State after every row with `cursor <= value` was delivered.
pub fn cursor_state(
    registry: &FieldTypeRegistry,
    cursor: &Field,
    value: &Value,
    record_count: u64,
) -> Result<OpaqueStateValue, CodecError> {
    let encoded = registry.encode_state_value(cursor, value)?;
    Ok(
        StreamStateValue::CursorBased(CursorBasedState::new(&cursor.name, encoded, record_count))
            .to_opaque(),
    )
}

/// Sentinel recorded once a snapshot without cursor finished.
pub fn completed_state(stream: &StreamId) -> OpaqueStateValue {
    StreamStateValue::CursorBased(CursorBasedState::completed_snapshot(
        &stream.name,
        stream.namespace.as_deref(),
    ))
    .to_opaque()
}
