//! Where records and state go.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use checkpoint::{OpaqueStateValue, SyncManager, SyncPhase};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use sync_core::StreamId;

use crate::checkpoint::MsSqlCdcCheckpoint;

/// One row of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub stream: StreamId,
    pub data: Map<String, JsonValue>,
    pub emitted_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "type": "RECORD",
            "record": {
                "stream": self.stream.name,
                "namespace": self.stream.namespace,
                "data": self.data,
                "emitted_at": self.emitted_at.timestamp_millis(),
            }
        })
    }
}

/// A checkpoint. Emitted only after every record it covers.
#[derive(Debug, Clone, PartialEq)]
pub enum StateMessage {
    /// Progress of one snapshot or cursor partition
    Stream {
        stream: StreamId,
        phase: SyncPhase,
        state: OpaqueStateValue,
    },
    /// Shared CDC position plus the state of every stream it covers
    Global {
        cdc: MsSqlCdcCheckpoint,
        streams: Vec<(StreamId, OpaqueStateValue)>,
    },
}

fn descriptor(stream: &StreamId) -> JsonValue {
    json!({ "name": stream.name, "namespace": stream.namespace })
}

impl StateMessage {
    pub fn to_json(&self) -> JsonValue {
        match self {
            StateMessage::Stream { stream, state, .. } => json!({
                "type": "STATE",
                "state": {
                    "type": "STREAM",
                    "stream": {
                        "stream_descriptor": descriptor(stream),
                        "stream_state": state,
                    }
                }
            }),
            StateMessage::Global { cdc, streams } => json!({
                "type": "STATE",
                "state": {
                    "type": "GLOBAL",
                    "global": {
                        "shared_state": cdc,
                        "stream_states": streams
                            .iter()
                            .map(|(stream, state)| json!({
                                "stream_descriptor": descriptor(stream),
                                "stream_state": state,
                            }))
                            .collect::<Vec<_>>(),
                    }
                }
            }),
        }
    }
}

/// Destination of a sync.
///
/// Implementations are shared by concurrently running partitions.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn emit_record(&self, record: SourceRecord) -> Result<()>;

    async fn emit_state(&self, state: StateMessage) -> Result<()>;
}

/// Forwards to an inner sink and persists every state it forwarded, so the
/// next invocation resumes where this one stopped.
pub struct PersistingSink {
    inner: Arc<dyn OutputSink>,
    manager: SyncManager,
}

impl PersistingSink {
    pub fn new(inner: Arc<dyn OutputSink>, manager: SyncManager) -> Self {
        Self { inner, manager }
    }
}

#[async_trait]
impl OutputSink for PersistingSink {
    async fn emit_record(&self, record: SourceRecord) -> Result<()> {
        self.inner.emit_record(record).await
    }

    async fn emit_state(&self, state: StateMessage) -> Result<()> {
        self.inner.emit_state(state.clone()).await?;

        match &state {
            StateMessage::Stream {
                stream,
                phase,
                state,
            } => {
                self.manager
                    .emit_stream_state(&stream.key(), phase.clone(), state)
                    .await
            }
            StateMessage::Global { cdc, streams } => {
                for (stream, state) in streams {
                    self.manager
                        .emit_stream_state(&stream.key(), SyncPhase::CdcStreaming, state)
                        .await?;
                }
                self.manager
                    .emit_checkpoint(cdc, SyncPhase::CdcStreaming)
                    .await
            }
        }
    }
}
