//! Value representations.
//!
//! `Value` is the in-memory form of a single column value as read from the
//! source or decoded from a checkpoint. `TypedValue` pairs it with its
//! `FieldType` and is what query bindings carry.

use base64::Engine;
use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use std::str::FromStr;

use crate::temporal;
use crate::types::FieldType;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,

    /// Boolean value
    Boolean(bool),

    /// Any integral value that fits in 64 bits
    Integer(i64),

    /// Exact decimal of any precision
    Decimal(BigDecimal),

    /// Approximate number
    Double(f64),

    /// Character data
    String(String),

    /// Raw bytes
    Bytes(Vec<u8>),

    /// Calendar date
    Date(NaiveDate),

    /// Date-time without zone
    LocalDateTime(NaiveDateTime),

    /// Date-time with offset
    OffsetDateTime(DateTime<FixedOffset>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::LocalDateTime(_) => "local_date_time",
            Self::OffsetDateTime(_) => "offset_date_time",
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get this value as an exact decimal; integers widen losslessly.
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Self::Decimal(d) => Some(d.clone()),
            Self::Integer(i) => Some(BigDecimal::from(*i)),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// JSON rendition used for emitted records and checkpoint values.
    ///
    /// Numbers keep their exact textual form, bytes become base64 and
    /// temporal values use the canonical microsecond formats.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Decimal(d) => exact_number(&d.to_plain_string()),
            Self::Double(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Date(d) => serde_json::Value::String(temporal::format_date(d)),
            Self::LocalDateTime(dt) => {
                serde_json::Value::String(temporal::format_local_date_time(dt))
            }
            Self::OffsetDateTime(dt) => {
                serde_json::Value::String(temporal::format_offset_date_time(dt))
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// Builds a JSON number from its exact text; falls back to a string if the text is not a number.
fn exact_number(text: &str) -> serde_json::Value {
    serde_json::Number::from_str(text)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

/// Value paired with its field type.
///
/// Produced by [`crate::FieldTypeRegistry::encode_literal`]; the value is
/// always in the canonical variant for `field_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    /// The field type this value was encoded for
    pub field_type: FieldType,

    /// The canonical value
    pub value: Value,
}

impl TypedValue {
    /// Create a new typed value.
    pub fn new(field_type: FieldType, value: Value) -> Self {
        Self { field_type, value }
    }

    /// Create a typed null.
    pub fn null(field_type: FieldType) -> Self {
        Self::new(field_type, Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_json_keeps_exact_text() {
        let value = Value::Decimal(
            BigDecimal::from_str("1234567890123456789012345678.1234567891").unwrap(),
        );
        assert_eq!(
            value.to_json().to_string(),
            "1234567890123456789012345678.1234567891"
        );
    }

    #[test]
    fn test_bytes_json_is_base64() {
        let value = Value::Bytes(b"ABCDEFG".to_vec());
        assert_eq!(value.to_json(), json!("QUJDREVGRw=="));
    }

    #[test]
    fn test_integer_widens_to_decimal() {
        assert_eq!(Value::Integer(13).as_decimal(), Some(BigDecimal::from(13)));
        assert_eq!(Value::String("13".into()).as_decimal(), None);
    }
}
