//! Per-stream state values and their migration.
//!
//! A stream's persisted state is an opaque JSON object. Over time the shape
//! of that object changed; [`StreamStateValue::parse`] accepts every shape
//! ever written and normalizes it to the current one. Parsing is total:
//! anything unrecognizable becomes the empty cursor-based state, which
//! restarts the stream from scratch instead of failing the sync.
//!
//! Current shapes (version 3):
//!
//! ```json
//! {"state_type": "cursor_based", "version": 3, "cursor_field": ["updated_at"],
//!  "cursor": "2024-01-01T00:00:00.000000", "cursor_record_count": 1}
//!
//! {"state_type": "primary_key", "version": 3, "pk_name": "id", "pk_value": 42,
//!  "incremental_state": { ...nested cursor_based state... }}
//! ```
//!
//! Composite keys store `pk_name` and `pk_value` as parallel arrays.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version stamped on every state written by this crate.
pub const STATE_VERSION: u64 = 3;

const STATE_TYPE: &str = "state_type";
const CURSOR_BASED: &str = "cursor_based";
const PRIMARY_KEY: &str = "primary_key";
const ORDERED_COLUMN: &str = "ordered_column";

/// Persisted stream state exactly as it was read from or will be written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueStateValue(pub Value);

impl OpaqueStateValue {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }

    /// Decode (and migrate) the wrapped JSON.
    pub fn migrate(&self) -> StreamStateValue {
        StreamStateValue::parse(&self.0)
    }
}

impl From<Value> for OpaqueStateValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Decoded stream state.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStateValue {
    CursorBased(CursorBasedState),
    PrimaryKey(PrimaryKeyState),
}

/// Progress of a cursor-driven read.
///
/// With an empty `cursor_field` and a null `cursor` this is either the
/// completed-snapshot sentinel (when it names its stream) or the
/// "start of stream" default (when it does not).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CursorBasedState {
    pub cursor_field: Vec<String>,
    /// Last cursor value fully handed off, in state encoding. `Null` when none.
    pub cursor: Value,
    /// Rows already emitted that carry exactly `cursor`.
    pub cursor_record_count: u64,
    pub stream_name: Option<String>,
    pub stream_namespace: Option<String>,
}

impl CursorBasedState {
    pub fn new(cursor_field: impl Into<String>, cursor: Value, cursor_record_count: u64) -> Self {
        Self {
            cursor_field: vec![cursor_field.into()],
            cursor,
            cursor_record_count,
            stream_name: None,
            stream_namespace: None,
        }
    }

    /// State recorded once a non-resumable snapshot finished.
    pub fn completed_snapshot(stream_name: &str, stream_namespace: Option<&str>) -> Self {
        Self {
            cursor_field: Vec::new(),
            cursor: Value::Null,
            cursor_record_count: 0,
            stream_name: Some(stream_name.to_string()),
            stream_namespace: stream_namespace.map(str::to_string),
        }
    }

    /// True for the sentinel written by [`Self::completed_snapshot`] for this stream.
    pub fn is_completed_snapshot_of(
        &self,
        stream_name: &str,
        stream_namespace: Option<&str>,
    ) -> bool {
        self.is_empty()
            && self.stream_name.as_deref() == Some(stream_name)
            && self.stream_namespace.as_deref() == stream_namespace
    }

    /// No cursor column and no cursor value.
    pub fn is_empty(&self) -> bool {
        self.cursor_field.is_empty() && self.cursor.is_null()
    }

    /// The cursor column, when one was recorded.
    pub fn cursor_name(&self) -> Option<&str> {
        self.cursor_field.first().map(String::as_str)
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(STATE_TYPE.into(), Value::from(CURSOR_BASED));
        obj.insert("version".into(), Value::from(STATE_VERSION));
        obj.insert(
            "cursor_field".into(),
            Value::Array(self.cursor_field.iter().cloned().map(Value::from).collect()),
        );
        obj.insert("cursor".into(), self.cursor.clone());
        obj.insert(
            "cursor_record_count".into(),
            Value::from(self.cursor_record_count),
        );
        if let Some(name) = &self.stream_name {
            obj.insert("stream_name".into(), Value::from(name.as_str()));
        }
        if let Some(namespace) = &self.stream_namespace {
            obj.insert("stream_namespace".into(), Value::from(namespace.as_str()));
        }
        Value::Object(obj)
    }
}

/// Progress of a key-ordered resumable snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyState {
    /// Key column names, in key order.
    pub pk_names: Vec<String>,
    /// Last key handed off, parallel to `pk_names`; each in state encoding.
    pub pk_values: Vec<Value>,
    /// Cursor state carried through a snapshot; `Some(Null)` and `Some({})`
    /// are preserved verbatim, `None` means the field was absent.
    pub incremental_state: Option<Value>,
}

impl PrimaryKeyState {
    pub fn new(pk_names: Vec<String>, pk_values: Vec<Value>) -> Self {
        Self {
            pk_names,
            pk_values,
            incremental_state: None,
        }
    }

    pub fn with_incremental_state(mut self, incremental_state: Option<Value>) -> Self {
        self.incremental_state = incremental_state;
        self
    }

    pub fn is_composite(&self) -> bool {
        self.pk_names.len() > 1
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(STATE_TYPE.into(), Value::from(PRIMARY_KEY));
        obj.insert("version".into(), Value::from(STATE_VERSION));
        if self.is_composite() {
            obj.insert(
                "pk_name".into(),
                Value::Array(self.pk_names.iter().cloned().map(Value::from).collect()),
            );
            obj.insert("pk_value".into(), Value::Array(self.pk_values.clone()));
        } else {
            let name = self.pk_names.first().cloned().unwrap_or_default();
            obj.insert("pk_name".into(), Value::from(name));
            obj.insert(
                "pk_value".into(),
                self.pk_values.first().cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(incremental) = &self.incremental_state {
            obj.insert("incremental_state".into(), incremental.clone());
        }
        Value::Object(obj)
    }
}

impl Default for StreamStateValue {
    fn default() -> Self {
        StreamStateValue::CursorBased(CursorBasedState::default())
    }
}

impl StreamStateValue {
    /// Decode any historical state shape. Never fails; unrecognized input
    /// yields the empty cursor-based state.
    pub fn parse(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };

        let has_pk_name = obj.get("pk_name").is_some_and(|v| !v.is_null());
        let result = match obj.get(STATE_TYPE).and_then(Value::as_str) {
            Some(PRIMARY_KEY) => parse_primary_key(obj, "pk_name", &["pk_value", "pk_val"], false),
            Some(ORDERED_COLUMN) => {
                parse_primary_key(obj, "ordered_col", &["ordered_col_val"], true)
            }
            // Early writers tagged key-ordered progress as cursor_based.
            Some(CURSOR_BASED) if has_pk_name => {
                parse_primary_key(obj, "pk_name", &["pk_value", "pk_val"], false)
            }
            Some(CURSOR_BASED) => Some(StreamStateValue::CursorBased(parse_cursor_based(obj))),
            Some(_) => None,
            None if has_pk_name => {
                parse_primary_key(obj, "pk_name", &["pk_value", "pk_val"], false)
            }
            None if obj.contains_key("ordered_col") => {
                parse_primary_key(obj, "ordered_col", &["ordered_col_val"], true)
            }
            None if obj.contains_key("cursor_field") || obj.contains_key("cursor") => {
                Some(StreamStateValue::CursorBased(parse_cursor_based(obj)))
            }
            None => None,
        };

        match result {
            Some(state) => state,
            None => {
                tracing::warn!("Unrecognized stream state, starting stream from scratch: {raw}");
                Self::default()
            }
        }
    }

    /// Encode in the current shape, stamped with [`STATE_VERSION`].
    pub fn to_opaque(&self) -> OpaqueStateValue {
        OpaqueStateValue(match self {
            StreamStateValue::CursorBased(state) => state.to_json(),
            StreamStateValue::PrimaryKey(state) => state.to_json(),
        })
    }

    /// The default every unrecognized input maps to.
    pub fn is_start_of_stream(&self) -> bool {
        matches!(self, StreamStateValue::CursorBased(state)
            if state.is_empty() && state.stream_name.is_none())
    }
}

fn parse_cursor_based(obj: &Map<String, Value>) -> CursorBasedState {
    let cursor_field = match obj.get("cursor_field") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(name)) if !name.is_empty() => vec![name.clone()],
        _ => Vec::new(),
    };

    CursorBasedState {
        cursor_field,
        cursor: obj.get("cursor").cloned().unwrap_or(Value::Null),
        cursor_record_count: obj
            .get("cursor_record_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        stream_name: obj
            .get("stream_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        stream_namespace: obj
            .get("stream_namespace")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn parse_primary_key(
    obj: &Map<String, Value>,
    name_key: &str,
    value_keys: &[&str],
    legacy_ordered: bool,
) -> Option<StreamStateValue> {
    let raw_value = value_keys
        .iter()
        .find_map(|key| obj.get(*key))
        .cloned()
        .unwrap_or(Value::Null);

    let (pk_names, pk_values) = match obj.get(name_key)? {
        Value::String(name) => {
            let value = if legacy_ordered {
                integer_string_to_number(raw_value)
            } else {
                raw_value
            };
            (vec![name.clone()], vec![value])
        }
        Value::Array(names) => {
            let names = names
                .iter()
                .map(|n| n.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()?;
            let values = match raw_value {
                Value::Array(values) if values.len() == names.len() => values,
                Value::Null => vec![Value::Null; names.len()],
                _ => return None,
            };
            (names, values)
        }
        _ => return None,
    };

    if pk_names.is_empty() {
        return None;
    }

    let incremental_state = obj.get("incremental_state").map(|nested| match nested {
        Value::Object(map) if !map.is_empty() => StreamStateValue::parse(nested).to_opaque().0,
        other => other.clone(),
    });

    Some(StreamStateValue::PrimaryKey(PrimaryKeyState {
        pk_names,
        pk_values,
        incremental_state,
    }))
}

/// Legacy ordered-column states stored integer keys as strings.
fn integer_string_to_number(value: Value) -> Value {
    match &value {
        Value::String(text) if is_canonical_integer(text) => text
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or(value),
        _ => value,
    }
}

fn is_canonical_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && text != "-0"
}
