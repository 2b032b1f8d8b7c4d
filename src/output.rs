//! JSON Lines output.
//!
//! One `{"type":"RECORD",...}` or `{"type":"STATE",...}` object per line.
//! Records are buffered; every state line is preceded by a flush so the
//! records it covers are already out when the checkpoint appears.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdb_sync_mssql_source::{OutputSink, SourceRecord, StateMessage};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Writes records and states to `W` as JSON Lines.
pub struct JsonlSink<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<BufWriter<W>>,
}

impl JsonlSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, writer)),
        }
    }

    /// Write out buffered lines.
    pub async fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .await
            .flush()
            .await
            .context("Failed to flush output")
    }

    /// Flush buffered lines and hand back the writer.
    pub async fn into_inner(self) -> Result<W> {
        let mut writer = self.writer.into_inner();
        writer.flush().await?;
        Ok(writer.into_inner())
    }

    async fn write_line(&self, message: &JsonValue, flush_first: bool) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if flush_first {
            writer.flush().await.context("Failed to flush output")?;
        }
        writer.write_all(&line).await.context("Failed to write output")?;
        if flush_first {
            writer.flush().await.context("Failed to flush output")?;
        }
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> OutputSink for JsonlSink<W> {
    async fn emit_record(&self, record: SourceRecord) -> Result<()> {
        self.write_line(&record.to_json(), false).await
    }

    async fn emit_state(&self, state: StateMessage) -> Result<()> {
        self.write_line(&state.to_json(), true).await
    }
}
