//! Change table replay and position tracking.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use select_query::{Dialect, SqlServer};
use serde_json::{Map, Value as JsonValue};
use sync_core::temporal::format_local_date_time;
use sync_core::{Field, FieldType, Stream, StreamId, TypedValue, Value};
use tracing::{debug, info, warn};

use super::Lsn;
use crate::connection::{fetch_all, fetch_optional, raw_query, SourceConnection};
use crate::sink::SourceRecord;

pub const CDC_LSN: &str = "_ab_cdc_lsn";
pub const CDC_UPDATED_AT: &str = "_ab_cdc_updated_at";
pub const CDC_DELETED_AT: &str = "_ab_cdc_deleted_at";

/// A capture instance and the table it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInstance {
    pub stream: StreamId,
    pub name: String,
}

/// Capture instances of the database, one per table. When a table has two
/// instances (during a schema change) the most recently created one wins.
pub async fn list_capture_instances(
    conn: &mut dyn SourceConnection,
) -> Result<BTreeMap<StreamId, CaptureInstance>> {
    let query = raw_query(
        "SELECT s.name, t.name, ct.capture_instance FROM cdc.change_tables ct \
         JOIN sys.tables t ON t.object_id = ct.source_object_id \
         JOIN sys.schemas s ON s.schema_id = t.schema_id \
         ORDER BY ct.create_date",
        vec![],
    );
    let fields = [
        Field::new("schema", FieldType::String),
        Field::new("table", FieldType::String),
        Field::new("capture_instance", FieldType::String),
    ];

    let mut instances = BTreeMap::new();
    for row in fetch_all(conn, &query, &fields)
        .await
        .context("Failed to list CDC capture instances")?
    {
        let [Value::String(schema), Value::String(table), Value::String(name)] = &row[..] else {
            anyhow::bail!("Unexpected capture instance row: {row:?}");
        };
        let stream = StreamId::new(Some(schema.as_str()), table.clone());
        instances.insert(
            stream.clone(),
            CaptureInstance {
                stream,
                name: name.clone(),
            },
        );
    }
    Ok(instances)
}

/// `__$operation` of the change rows read with the `all` row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Delete,
    Insert,
    /// After image of an update
    Update,
}

impl ChangeOperation {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Delete),
            2 => Some(Self::Insert),
            4 => Some(Self::Update),
            _ => None,
        }
    }
}

/// One row of a change table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub stream: StreamId,
    /// Commit LSN of the transaction
    pub start_lsn: Lsn,
    /// Order of the change within its transaction
    pub seqval: Lsn,
    pub operation: ChangeOperation,
    pub commit_time: Option<NaiveDateTime>,
    /// Column values, in stream field order
    pub values: Vec<(String, Value)>,
}

impl ChangeEvent {
    pub fn to_record(&self, emitted_at: DateTime<Utc>) -> SourceRecord {
        let mut data: Map<String, JsonValue> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();

        let updated_at = self
            .commit_time
            .map(|t| format_local_date_time(&t))
            .unwrap_or_else(|| format_local_date_time(&emitted_at.naive_utc()));
        let deleted_at = match self.operation {
            ChangeOperation::Delete => Some(updated_at.clone()),
            _ => None,
        };
        add_cdc_metadata(&mut data, self.start_lsn, updated_at, deleted_at);

        SourceRecord {
            stream: self.stream.clone(),
            data,
            emitted_at,
        }
    }
}

/// Attach the change metadata columns every CDC stream record carries.
pub fn add_cdc_metadata(
    data: &mut Map<String, JsonValue>,
    lsn: Lsn,
    updated_at: String,
    deleted_at: Option<String>,
) {
    data.insert(CDC_LSN.to_string(), JsonValue::from(lsn.to_hex()));
    data.insert(CDC_UPDATED_AT.to_string(), JsonValue::from(updated_at));
    data.insert(
        CDC_DELETED_AT.to_string(),
        deleted_at.map_or(JsonValue::Null, JsonValue::from),
    );
}

/// A CDC stream and the capture instance its changes are read from.
#[derive(Debug, Clone)]
pub struct TrackedStream {
    pub stream: Stream,
    pub instance: String,
}

fn lsn_binding(lsn: Lsn) -> TypedValue {
    TypedValue::new(FieldType::Binary, Value::Bytes(lsn.as_bytes().to_vec()))
}

fn lsn_field(name: &str) -> Field {
    Field::new(name, FieldType::Binary)
}

fn lsn_value(value: Option<&Value>) -> Result<Option<Lsn>> {
    match value {
        Some(Value::Bytes(bytes)) => Ok(Some(Lsn::from_bytes(bytes)?)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => anyhow::bail!("Expected an LSN, got {other:?}"),
    }
}

/// Change rows read per capture instance and query, unless configured.
pub const DEFAULT_CHANGE_PAGE_SIZE: u64 = 10_000;

/// Reads the change tables of a set of streams and tracks how far every one
/// of them has been delivered.
///
/// The position is global: every change with a commit LSN at or below it was
/// handed to the sink, for every tracked stream.
#[derive(Debug)]
pub struct CdcTracker {
    streams: Vec<TrackedStream>,
    position: Lsn,
    // Commit LSN currently being delivered; complete once a later one starts.
    in_flight: Option<Lsn>,
    page_size: u64,
}

impl CdcTracker {
    pub fn new(position: Lsn, streams: Vec<TrackedStream>) -> Self {
        Self {
            streams,
            position,
            in_flight: None,
            page_size: DEFAULT_CHANGE_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn position(&self) -> Lsn {
        self.position
    }

    pub fn streams(&self) -> &[TrackedStream] {
        &self.streams
    }

    /// Current maximum LSN of the database.
    pub async fn capture_position(conn: &mut dyn SourceConnection) -> Result<Lsn> {
        let query = raw_query("SELECT sys.fn_cdc_get_max_lsn()", vec![]);
        let row = fetch_optional(conn, &query, &[lsn_field("max_lsn")])
            .await
            .context("Failed to read the maximum LSN")?;
        lsn_value(row.as_ref().and_then(|r| r.first()))?
            .ok_or_else(|| anyhow::anyhow!("fn_cdc_get_max_lsn returned NULL; is CDC enabled?"))
    }

    /// Oldest LSN still retained for a capture instance, if it holds any.
    pub async fn min_position(conn: &mut dyn SourceConnection, instance: &str) -> Result<Option<Lsn>> {
        let query = raw_query(
            "SELECT sys.fn_cdc_get_min_lsn(@P1)",
            vec![TypedValue::new(FieldType::String, Value::String(instance.to_string()))],
        );
        let row = fetch_optional(conn, &query, &[lsn_field("min_lsn")])
            .await
            .with_context(|| format!("Failed to read the minimum LSN of {instance}"))?;
        Ok(lsn_value(row.as_ref().and_then(|r| r.first()))?.filter(|lsn| !lsn.is_zero()))
    }

    /// Whether changes after `position` are still retained for every tracked
    /// capture instance.
    pub async fn is_position_valid(
        &self,
        conn: &mut dyn SourceConnection,
        position: Lsn,
    ) -> Result<bool> {
        for tracked in &self.streams {
            if let Some(min) = Self::min_position(conn, &tracked.instance).await? {
                if position < min {
                    warn!(
                        "Saved LSN {} precedes the minimum LSN {} of capture instance {}",
                        position, min, tracked.instance
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Every change with `position < LSN <= target`, in commit order.
    ///
    /// Change tables are read lazily, one page per capture instance at a
    /// time, so a long backlog is never held in memory at once.
    pub async fn stream_from(
        &self,
        conn: &mut dyn SourceConnection,
        position: Lsn,
        target: Lsn,
    ) -> Result<ChangeReplay> {
        let mut cursors = Vec::new();
        if target > position {
            for tracked in &self.streams {
                let Some(min) = Self::min_position(conn, &tracked.instance).await? else {
                    debug!("Capture instance {} holds no changes", tracked.instance);
                    continue;
                };
                let from = position.max(min);
                if from > target {
                    continue;
                }
                cursors.push(InstanceCursor {
                    tracked: tracked.clone(),
                    from,
                    last: None,
                    buffer: VecDeque::new(),
                    exhausted: false,
                });
            }
        }
        Ok(ChangeReplay {
            cursors,
            after: position,
            target,
            page_size: self.page_size,
        })
    }

    /// Record that `event` was handed to the sink; returns the position that
    /// is safe to checkpoint. Never moves backwards.
    pub fn advance(&mut self, event: &ChangeEvent) -> Lsn {
        match self.in_flight {
            Some(current) if event.start_lsn > current => {
                self.position = self.position.max(current);
                self.in_flight = Some(event.start_lsn);
            }
            Some(_) => {}
            None if event.start_lsn > self.position => self.in_flight = Some(event.start_lsn),
            None => {}
        }
        self.position
    }

    /// Every change up to `target` was handed to the sink.
    pub fn finish(&mut self, target: Lsn) -> Lsn {
        self.position = self.position.max(target);
        self.in_flight = None;
        info!("CDC position advanced to {}", self.position);
        self.position
    }
}

/// Changes of several capture instances merged into commit order.
#[derive(Debug)]
pub struct ChangeReplay {
    cursors: Vec<InstanceCursor>,
    after: Lsn,
    target: Lsn,
    page_size: u64,
}

impl ChangeReplay {
    /// The next change by (commit LSN, sequence value), reading a further
    /// page of an instance once its buffered rows are used up.
    pub async fn next(&mut self, conn: &mut dyn SourceConnection) -> Result<Option<ChangeEvent>> {
        let (after, target, page_size) = (self.after, self.target, self.page_size);
        for cursor in &mut self.cursors {
            while cursor.buffer.is_empty() && !cursor.exhausted {
                cursor.read_page(conn, after, target, page_size).await?;
            }
        }

        let next = self
            .cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.buffer.front().map(|e| ((e.start_lsn, e.seqval), i)))
            .min()
            .map(|(_, i)| i);
        Ok(next.and_then(|i| self.cursors[i].buffer.pop_front()))
    }
}

// Keyset position within one capture instance's change function.
#[derive(Debug)]
struct InstanceCursor {
    tracked: TrackedStream,
    from: Lsn,
    last: Option<(Lsn, Lsn)>,
    buffer: VecDeque<ChangeEvent>,
    exhausted: bool,
}

impl InstanceCursor {
    async fn read_page(
        &mut self,
        conn: &mut dyn SourceConnection,
        after: Lsn,
        to: Lsn,
        page_size: u64,
    ) -> Result<()> {
        let tracked = &self.tracked;
        let function = SqlServer.quote_identifier(&format!("fn_cdc_get_all_changes_{}", tracked.instance));
        let projection = tracked
            .stream
            .fields
            .iter()
            .map(|f| SqlServer.render_projection(f))
            .collect::<Vec<_>>()
            .join(", ");
        let mut bindings = vec![lsn_binding(self.from), lsn_binding(to), lsn_binding(after)];
        let mut filter = "[__$start_lsn] > @P3".to_string();
        if let Some((lsn, seqval)) = self.last {
            filter = "[__$start_lsn] > @P4 OR ([__$start_lsn] = @P4 AND [__$seqval] > @P5)".to_string();
            bindings.push(lsn_binding(lsn));
            bindings.push(lsn_binding(seqval));
        }
        let query = raw_query(
            format!(
                "SELECT TOP {page_size} [__$start_lsn], [__$seqval], [__$operation], \
                 sys.fn_cdc_map_lsn_to_time([__$start_lsn]) AS [__$commit_time], {projection} \
                 FROM cdc.{function}(@P1, @P2, N'all') \
                 WHERE {filter} \
                 ORDER BY [__$start_lsn], [__$seqval]"
            ),
            bindings,
        );

        let mut fields = vec![
            lsn_field("__$start_lsn"),
            lsn_field("__$seqval"),
            Field::new("__$operation", FieldType::Integer),
            Field::new("__$commit_time", FieldType::LocalDateTime),
        ];
        fields.extend(tracked.stream.fields.iter().cloned());

        let rows = fetch_all(conn, &query, &fields)
            .await
            .with_context(|| format!("Failed to read changes of {}", tracked.stream.id))?;
        let read = rows.len() as u64;

        for row in rows {
            let mut cells = row.into_iter();
            let start_lsn = lsn_value(cells.next().as_ref())?
                .ok_or_else(|| anyhow::anyhow!("Change row without __$start_lsn"))?;
            let seqval = lsn_value(cells.next().as_ref())?.unwrap_or_default();
            self.last = Some((start_lsn, seqval));
            let code = cells.next().and_then(|v| v.as_i64()).unwrap_or(0);
            let Some(operation) = ChangeOperation::from_code(code) else {
                warn!("Skipping change with unknown operation {} at {}", code, start_lsn);
                continue;
            };
            let commit_time = match cells.next() {
                Some(Value::LocalDateTime(t)) => Some(t),
                _ => None,
            };
            let values = tracked
                .stream
                .fields
                .iter()
                .map(|f| f.name.clone())
                .zip(cells)
                .collect();

            self.buffer.push_back(ChangeEvent {
                stream: tracked.stream.id.clone(),
                start_lsn,
                seqval,
                operation,
                commit_time,
                values,
            });
        }

        debug!(
            "Read {} changes of {} from {}",
            read, tracked.stream.id, tracked.instance
        );
        if read < page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}
