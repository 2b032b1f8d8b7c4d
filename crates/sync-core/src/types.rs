//! Field type tags.
//!
//! `FieldType` is the closed set of column types the replication core knows how
//! to encode into queries, persist in checkpoints and compare. Native SQL Server
//! types are mapped onto these tags during discovery.

use serde::{Deserialize, Serialize};

/// Type tag attached to every field of a stream.
///
/// # YAML Format
///
/// Tags are written in snake case:
/// ```yaml
/// type: long
/// type: offset_date_time
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 32-bit signed integer (`int`, `smallint`, `tinyint`)
    Integer,

    /// 64-bit signed integer (`bigint`)
    Long,

    /// Arbitrary-precision decimal (`decimal`, `numeric`, `money`)
    Decimal,

    /// IEEE 754 double (`float`, `real`)
    Double,

    /// Boolean (`bit`)
    Boolean,

    /// Character data (`varchar`, `nvarchar`, `uniqueidentifier`, ...)
    String,

    /// Binary data (`binary`, `varbinary`, `image`, `timestamp`)
    Binary,

    /// Calendar date (`date`)
    Date,

    /// Date and time without zone (`datetime`, `datetime2`, `smalldatetime`)
    LocalDateTime,

    /// Date and time with explicit offset (`datetimeoffset`)
    OffsetDateTime,

    /// Hierarchical path (`hierarchyid`), read through its textual form
    HierarchyId,
}

impl FieldType {
    /// Get the string representation of this type tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Long => "long",
            FieldType::Decimal => "decimal",
            FieldType::Double => "double",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
            FieldType::Binary => "binary",
            FieldType::Date => "date",
            FieldType::LocalDateTime => "local_date_time",
            FieldType::OffsetDateTime => "offset_date_time",
            FieldType::HierarchyId => "hierarchy_id",
        }
    }

    /// Whether values of this type denote points in time.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            FieldType::Date | FieldType::LocalDateTime | FieldType::OffsetDateTime
        )
    }

    /// Whether values of this type are exact or approximate numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Long | FieldType::Decimal | FieldType::Double
        )
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_serde_names() {
        let json = serde_json::to_string(&FieldType::OffsetDateTime).unwrap();
        assert_eq!(json, "\"offset_date_time\"");

        let parsed: FieldType = serde_json::from_str("\"hierarchy_id\"").unwrap();
        assert_eq!(parsed, FieldType::HierarchyId);
        assert_eq!(parsed.to_string(), "hierarchy_id");
    }

    #[test]
    fn test_temporal_types() {
        assert!(FieldType::Date.is_temporal());
        assert!(FieldType::LocalDateTime.is_temporal());
        assert!(FieldType::OffsetDateTime.is_temporal());
        assert!(!FieldType::Long.is_temporal());
        assert!(!FieldType::String.is_temporal());
    }
}
