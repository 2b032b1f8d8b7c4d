//! Field type registry.
//!
//! Every [`FieldType`] has a small codec implementing [`FieldCodec`]. The
//! registry is a dispatch table from type tag to codec and is the single
//! place where literals are coerced, checkpoint values are decoded and
//! encoded, and values are ordered.
//!
//! Numeric values never pass through floating point unless the field itself
//! is a double, so `"13"`, `13` and `13.0` over a decimal field all compare
//! equal.

use base64::Engine;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::TimeZone;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use crate::stream::Field;
use crate::temporal;
use crate::types::FieldType;
use crate::values::{TypedValue, Value};

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The registry has no codec for this type tag
    #[error("no codec registered for field type '{0}'")]
    Unregistered(FieldType),

    /// A raw value could not be parsed under the field type
    #[error("cannot decode '{raw}' as {field_type}: {reason}")]
    Decode {
        field_type: FieldType,
        raw: String,
        reason: String,
    },

    /// A value of another kind cannot be converted to the field type
    #[error("{kind} value '{value}' is not compatible with field type {field_type}")]
    Incompatible {
        field_type: FieldType,
        kind: &'static str,
        value: String,
    },

    /// Two values have no defined order
    #[error("values of field type {field_type} are not comparable: {reason}")]
    Incomparable { field_type: FieldType, reason: String },
}

impl CodecError {
    fn decode(field_type: FieldType, raw: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            field_type,
            raw: raw.to_string(),
            reason: reason.to_string(),
        }
    }

    fn incompatible(field_type: FieldType, value: &Value) -> Self {
        Self::Incompatible {
            field_type,
            kind: value.kind(),
            value: value.to_string(),
        }
    }
}

/// Per-type strategy used by the registry.
///
/// The registry strips nulls before calling into a codec, so codecs only ever
/// see non-null values.
pub trait FieldCodec: Send + Sync {
    /// The type tag this codec serves.
    fn field_type(&self) -> FieldType;

    /// Convert a non-null value into the canonical variant for this type.
    fn coerce(&self, value: &Value) -> Result<Value, CodecError>;

    /// Encode a canonical value for a checkpoint.
    fn encode(&self, value: &Value) -> serde_json::Value {
        value.to_json()
    }

    /// Order two canonical values.
    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError>;
}

/// Dispatch table from [`FieldType`] to its codec.
pub struct FieldTypeRegistry {
    codecs: HashMap<FieldType, Box<dyn FieldCodec>>,
}

impl Default for FieldTypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for FieldTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.codecs.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("FieldTypeRegistry")
            .field("types", &types)
            .finish()
    }
}

impl FieldTypeRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Create a registry with a codec for every [`FieldType`].
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(IntegerCodec(FieldType::Integer)));
        registry.register(Box::new(IntegerCodec(FieldType::Long)));
        registry.register(Box::new(DecimalCodec));
        registry.register(Box::new(DoubleCodec));
        registry.register(Box::new(BooleanCodec));
        registry.register(Box::new(TextCodec(FieldType::String)));
        registry.register(Box::new(TextCodec(FieldType::HierarchyId)));
        registry.register(Box::new(BinaryCodec));
        registry.register(Box::new(DateCodec));
        registry.register(Box::new(LocalDateTimeCodec));
        registry.register(Box::new(OffsetDateTimeCodec));
        registry
    }

    /// Register (or replace) the codec for its type tag.
    pub fn register(&mut self, codec: Box<dyn FieldCodec>) {
        self.codecs.insert(codec.field_type(), codec);
    }

    /// Look up the codec for a type tag.
    pub fn codec(&self, field_type: FieldType) -> Result<&dyn FieldCodec, CodecError> {
        self.codecs
            .get(&field_type)
            .map(|codec| codec.as_ref())
            .ok_or(CodecError::Unregistered(field_type))
    }

    /// Coerce `value` into a binding for `field`.
    pub fn encode_literal(&self, field: &Field, value: &Value) -> Result<TypedValue, CodecError> {
        if value.is_null() {
            return Ok(TypedValue::null(field.field_type));
        }
        let codec = self.codec(field.field_type)?;
        Ok(TypedValue::new(field.field_type, codec.coerce(value)?))
    }

    /// Decode a checkpoint value for `field`.
    ///
    /// JSON `null`, the empty string and the string `"null"` all decode to
    /// [`Value::Null`], whatever the field type.
    pub fn decode_state_value(
        &self,
        field: &Field,
        raw: &serde_json::Value,
    ) -> Result<Value, CodecError> {
        let codec = self.codec(field.field_type)?;
        match raw {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::String(s) if s.is_empty() || s == "null" => Ok(Value::Null),
            serde_json::Value::String(s) => codec.coerce(&Value::String(s.clone())),
            serde_json::Value::Bool(b) => codec.coerce(&Value::Boolean(*b)),
            serde_json::Value::Number(n) => codec.coerce(&number_value(field.field_type, n)?),
            other => Err(CodecError::decode(
                field.field_type,
                &other.to_string(),
                "expected a scalar",
            )),
        }
    }

    /// Encode a value of `field` for a checkpoint.
    pub fn encode_state_value(
        &self,
        field: &Field,
        value: &Value,
    ) -> Result<serde_json::Value, CodecError> {
        if value.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let codec = self.codec(field.field_type)?;
        Ok(codec.encode(&codec.coerce(value)?))
    }

    /// Order two values of `field`. Null sorts before every other value.
    pub fn compare(&self, field: &Field, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a.is_null(), b.is_null()) {
            (true, true) => return Ok(Ordering::Equal),
            (true, false) => return Ok(Ordering::Less),
            (false, true) => return Ok(Ordering::Greater),
            (false, false) => {}
        }
        let codec = self.codec(field.field_type)?;
        codec.cmp(&codec.coerce(a)?, &codec.coerce(b)?)
    }
}

// JSON numbers keep their exact text (serde_json arbitrary_precision); only doubles parse as floats.
fn number_value(field_type: FieldType, n: &serde_json::Number) -> Result<Value, CodecError> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Integer(i));
    }
    let text = n.to_string();
    if field_type == FieldType::Double {
        return text
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| CodecError::decode(field_type, &text, e));
    }
    parse_decimal(&text)
        .map(Value::Decimal)
        .ok_or_else(|| CodecError::decode(field_type, &text, "not an exact number"))
}

// Plain or scientific notation, any precision.
fn parse_decimal(text: &str) -> Option<BigDecimal> {
    BigDecimal::from_str(text.trim()).ok()
}

// Through the shortest text that round-trips the double, so 0.1 stays 0.1.
fn decimal_from_f64(value: f64) -> Option<BigDecimal> {
    if !value.is_finite() {
        return None;
    }
    parse_decimal(&value.to_string())
}

// ============================================================================
// Codecs
// ============================================================================

struct IntegerCodec(FieldType);

impl IntegerCodec {
    fn check_range(&self, value: i64) -> Result<Value, CodecError> {
        if self.0 == FieldType::Integer && i32::try_from(value).is_err() {
            return Err(CodecError::incompatible(self.0, &Value::Integer(value)));
        }
        Ok(Value::Integer(value))
    }
}

impl FieldCodec for IntegerCodec {
    fn field_type(&self) -> FieldType {
        self.0
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Integer(i) => self.check_range(*i),
            Value::Decimal(d) if d.is_integer() => d
                .to_i64()
                .ok_or_else(|| CodecError::incompatible(self.0, value))
                .and_then(|i| self.check_range(i)),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    return self.check_range(i);
                }
                match parse_decimal(trimmed) {
                    Some(d) => self.coerce(&Value::Decimal(d)),
                    None => Err(CodecError::decode(self.0, s, "not an integer")),
                }
            }
            other => Err(CodecError::incompatible(self.0, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(self.0, a, b)),
        }
    }
}

struct DecimalCodec;

impl FieldCodec for DecimalCodec {
    fn field_type(&self) -> FieldType {
        FieldType::Decimal
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Decimal(d) => Ok(Value::Decimal(d.clone())),
            Value::Integer(i) => Ok(Value::Decimal(BigDecimal::from(*i))),
            Value::Double(f) => decimal_from_f64(*f)
                .map(Value::Decimal)
                .ok_or_else(|| CodecError::incompatible(FieldType::Decimal, value)),
            Value::String(s) => parse_decimal(s)
                .map(Value::Decimal)
                .ok_or_else(|| CodecError::decode(FieldType::Decimal, s, "not a decimal")),
            other => Err(CodecError::incompatible(FieldType::Decimal, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Decimal(x), Value::Decimal(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::Decimal, a, b)),
        }
    }
}

struct DoubleCodec;

impl FieldCodec for DoubleCodec {
    fn field_type(&self) -> FieldType {
        FieldType::Double
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Double(f) => Ok(Value::Double(*f)),
            Value::Integer(i) => Ok(Value::Double(*i as f64)),
            Value::Decimal(d) => d
                .to_f64()
                .map(Value::Double)
                .ok_or_else(|| CodecError::incompatible(FieldType::Double, value)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| CodecError::decode(FieldType::Double, s, e)),
            other => Err(CodecError::incompatible(FieldType::Double, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Double(x), Value::Double(y)) => x
                .partial_cmp(y)
                .ok_or_else(|| incomparable(FieldType::Double, a, b)),
            _ => Err(incomparable(FieldType::Double, a, b)),
        }
    }
}

struct BooleanCodec;

impl FieldCodec for BooleanCodec {
    fn field_type(&self) -> FieldType {
        FieldType::Boolean
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Boolean(b) => Ok(Value::Boolean(*b)),
            Value::Integer(0) => Ok(Value::Boolean(false)),
            Value::Integer(1) => Ok(Value::Boolean(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                _ => Err(CodecError::decode(FieldType::Boolean, s, "not a boolean")),
            },
            other => Err(CodecError::incompatible(FieldType::Boolean, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Boolean(x), Value::Boolean(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::Boolean, a, b)),
        }
    }
}

struct TextCodec(FieldType);

impl FieldCodec for TextCodec {
    fn field_type(&self) -> FieldType {
        self.0
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Bytes(_) => Err(CodecError::incompatible(self.0, value)),
            other => Ok(Value::String(other.to_string())),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(self.0, a, b)),
        }
    }
}

struct BinaryCodec;

impl FieldCodec for BinaryCodec {
    fn field_type(&self) -> FieldType {
        FieldType::Binary
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
            Value::String(s) => base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .map(Value::Bytes)
                .map_err(|e| CodecError::decode(FieldType::Binary, s, e)),
            other => Err(CodecError::incompatible(FieldType::Binary, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Bytes(x), Value::Bytes(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::Binary, a, b)),
        }
    }
}

struct DateCodec;

impl FieldCodec for DateCodec {
    fn field_type(&self) -> FieldType {
        FieldType::Date
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::Date(d) => Ok(Value::Date(*d)),
            Value::LocalDateTime(dt) => Ok(Value::Date(dt.date())),
            Value::String(s) => temporal::parse_date(s)
                .map(Value::Date)
                .ok_or_else(|| CodecError::decode(FieldType::Date, s, "not a date")),
            other => Err(CodecError::incompatible(FieldType::Date, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::Date(x), Value::Date(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::Date, a, b)),
        }
    }
}

struct LocalDateTimeCodec;

impl FieldCodec for LocalDateTimeCodec {
    fn field_type(&self) -> FieldType {
        FieldType::LocalDateTime
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::LocalDateTime(dt) => Ok(Value::LocalDateTime(temporal::truncate_to_micros(*dt))),
            Value::Date(d) => Ok(Value::LocalDateTime(d.and_time(chrono::NaiveTime::MIN))),
            Value::String(s) => temporal::parse_local_date_time(s)
                .map(Value::LocalDateTime)
                .ok_or_else(|| {
                    CodecError::decode(FieldType::LocalDateTime, s, "not a local date-time")
                }),
            other => Err(CodecError::incompatible(FieldType::LocalDateTime, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::LocalDateTime(x), Value::LocalDateTime(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::LocalDateTime, a, b)),
        }
    }
}

struct OffsetDateTimeCodec;

impl FieldCodec for OffsetDateTimeCodec {
    fn field_type(&self) -> FieldType {
        FieldType::OffsetDateTime
    }

    fn coerce(&self, value: &Value) -> Result<Value, CodecError> {
        match value {
            Value::OffsetDateTime(dt) => {
                let local = temporal::truncate_to_micros(dt.naive_local());
                dt.offset()
                    .from_local_datetime(&local)
                    .single()
                    .map(Value::OffsetDateTime)
                    .ok_or_else(|| CodecError::incompatible(FieldType::OffsetDateTime, value))
            }
            Value::LocalDateTime(dt) => Ok(Value::OffsetDateTime(
                chrono::Utc
                    .from_utc_datetime(&temporal::truncate_to_micros(*dt))
                    .fixed_offset(),
            )),
            Value::String(s) => temporal::parse_offset_date_time(s)
                .map(Value::OffsetDateTime)
                .ok_or_else(|| {
                    CodecError::decode(FieldType::OffsetDateTime, s, "not a date-time")
                }),
            other => Err(CodecError::incompatible(FieldType::OffsetDateTime, other)),
        }
    }

    fn cmp(&self, a: &Value, b: &Value) -> Result<Ordering, CodecError> {
        match (a, b) {
            (Value::OffsetDateTime(x), Value::OffsetDateTime(y)) => Ok(x.cmp(y)),
            _ => Err(incomparable(FieldType::OffsetDateTime, a, b)),
        }
    }
}

fn incomparable(field_type: FieldType, a: &Value, b: &Value) -> CodecError {
    CodecError::Incomparable {
        field_type,
        reason: format!("{} vs {}", a.kind(), b.kind()),
    }
}
