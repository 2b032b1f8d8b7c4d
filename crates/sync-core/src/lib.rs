//! Core types for the rdb-sync framework.
//!
//! This crate provides the foundational types shared by the state codec, the
//! query builder and the SQL Server source:
//!
//! - [`FieldType`] - Type tag attached to every column of a stream
//! - [`Value`] / [`TypedValue`] - In-memory values, optionally paired with their type
//! - [`FieldTypeRegistry`] - Per-type codecs for literals, checkpoint values and ordering
//! - [`Stream`] / [`Catalog`] - Configured streams loaded from YAML or JSON
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint     (persists state values produced by the codecs)
//!    ├─── select-query   (binds TypedValues produced by encode_literal)
//!    └─── mssql-source   (partition factory, readers, CDC)
//! ```
//!
//! # Example
//!
//! ```rust
//! use sync_core::{Field, FieldType, FieldTypeRegistry, Value};
//!
//! let registry = FieldTypeRegistry::default();
//! let field = Field::new("amount", FieldType::Decimal);
//!
//! let from_state = registry
//!     .decode_state_value(&field, &serde_json::json!("13"))
//!     .unwrap();
//! let from_source = Value::Integer(13);
//!
//! assert_eq!(
//!     registry.compare(&field, &from_state, &from_source).unwrap(),
//!     std::cmp::Ordering::Equal
//! );
//! ```

pub mod registry;
pub mod stream;
pub mod temporal;
pub mod types;
pub mod values;

// Re-exports for convenience
pub use bigdecimal::BigDecimal;
pub use registry::{CodecError, FieldCodec, FieldTypeRegistry};
pub use stream::{Catalog, CatalogError, Field, Stream, StreamId, SyncMode};
pub use types::FieldType;
pub use values::{TypedValue, Value};
