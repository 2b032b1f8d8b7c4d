//! Stream definitions for the rdb-sync framework.
//!
//! A [`Stream`] is one configured table or view: its identifier, declared
//! fields, sync mode, primary key and cursor. Streams are immutable for the
//! duration of a sync invocation and are loaded from a [`Catalog`] file.
//!
//! ## Catalog format
//!
//! ```yaml
//! streams:
//!   - namespace: dbo
//!     name: orders
//!     sync_mode: incremental
//!     primary_key: [[id]]
//!     cursor: updated_at
//!     fields:
//!       - name: id
//!         type: long
//!       - name: updated_at
//!         type: local_date_time
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::FieldType;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for catalog and stream configuration.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Error reading catalog file
    #[error("Failed to read catalog file: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing YAML (or JSON, which YAML accepts)
    #[error("Failed to parse catalog: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Key or cursor refers to a column the stream does not declare
    #[error("Field '{field}' not found in stream '{stream}'")]
    FieldNotFound { stream: String, field: String },

    /// A primary key path with no elements
    #[error("Stream '{0}' has an empty primary key path")]
    EmptyKeyPath(String),
}

// ============================================================================
// Stream Types
// ============================================================================

/// Stream identifier (namespace + name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    /// Schema the table belongs to (e.g. `dbo`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Table or view name
    pub name: String,
}

impl StreamId {
    /// Create a new stream identifier.
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Filesystem- and key-safe representation (`dbo.orders`).
    pub fn key(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Configured sync mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Re-read everything on every invocation
    FullRefresh,
    /// Read only what changed since the last checkpoint
    Incremental,
}

/// A column: name plus type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Column name
    pub name: String,

    /// Column type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Source column type, when discovery recorded it (`money`, `xml`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            native_type: None,
        }
    }

    pub fn with_native_type(mut self, native_type: impl Into<String>) -> Self {
        self.native_type = Some(native_type.into());
        self
    }

    /// Whether the source column has the given type, ignoring case.
    pub fn is_native(&self, native_type: &str) -> bool {
        self.native_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(native_type))
    }
}

/// One configured stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    /// Stream identifier
    #[serde(flatten)]
    pub id: StreamId,

    /// Declared fields, in projection order
    pub fields: Vec<Field>,

    /// Configured sync mode
    pub sync_mode: SyncMode,

    /// Configured primary key; each entry is a column path whose first element names the column
    #[serde(default)]
    pub primary_key: Vec<Vec<String>>,

    /// Configured cursor column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl Stream {
    /// Get a declared field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a column name to a declared field.
    pub fn require_field(&self, name: &str) -> Result<&Field, CatalogError> {
        self.field(name).ok_or_else(|| CatalogError::FieldNotFound {
            stream: self.id.to_string(),
            field: name.to_string(),
        })
    }

    /// Resolve the configured primary key to declared fields.
    pub fn primary_key_fields(&self) -> Result<Vec<Field>, CatalogError> {
        self.primary_key
            .iter()
            .map(|path| {
                let name = path
                    .first()
                    .ok_or_else(|| CatalogError::EmptyKeyPath(self.id.to_string()))?;
                self.require_field(name).cloned()
            })
            .collect()
    }

    /// Resolve the configured cursor to a declared field.
    pub fn cursor_field(&self) -> Result<Option<Field>, CatalogError> {
        self.cursor
            .as_deref()
            .map(|name| self.require_field(name).cloned())
            .transpose()
    }
}

/// Collection of configured streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Streams to sync
    pub streams: Vec<Stream>,
}

impl Catalog {
    /// Load a catalog from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a catalog from YAML (JSON is valid YAML).
    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Get a stream by identifier.
    pub fn stream(&self, id: &StreamId) -> Option<&Stream> {
        self.streams.iter().find(|s| &s.id == id)
    }
}
