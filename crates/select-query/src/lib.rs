//! Parametrized `SELECT` generation.
//!
//! Readers describe what they want as a [`SelectQuerySpec`]; [`generate`]
//! renders it through a [`Dialect`] into SQL text plus the ordered list of
//! [`TypedValue`](sync_core::TypedValue) bindings for its placeholders.
//! Every literal is coerced through the field type registry, so a bound is
//! always sent to the server with the type of the column it is compared to.
//!
//! ```rust
//! use select_query::{generate, keyset_after, SelectQuerySpec, SqlServer};
//! use sync_core::{Field, FieldType, FieldTypeRegistry, Value};
//!
//! let id = Field::new("id", FieldType::Integer);
//! let spec = SelectQuerySpec::columns(Some("dbo"), "users", vec![id.clone()])
//!     .filter(keyset_after(&[id.clone()], &[Value::Integer(10)]).unwrap())
//!     .order_by(vec![id])
//!     .limit(100);
//!
//! let query = generate(&spec, &SqlServer, &FieldTypeRegistry::default()).unwrap();
//! assert_eq!(
//!     query.sql,
//!     "SELECT TOP 100 [id] FROM [dbo].[users] WHERE [id] > @P1 ORDER BY [id]"
//! );
//! assert_eq!(query.bindings.len(), 1);
//! ```

mod ast;
mod dialect;
mod render;

#[cfg(test)]
mod tests;

pub use ast::{keyset_after, CmpOp, SelectNode, SelectQuerySpec, WhereNode};
pub use dialect::{Dialect, LimitPlacement, SqlServer};
pub use render::{generate, GeneratedQuery};

/// Error type for query generation.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A literal could not be coerced to its column's type
    #[error("cannot bind literal for column '{column}': {source}")]
    Literal {
        column: String,
        #[source]
        source: sync_core::CodecError,
    },

    /// A column projection with no columns
    #[error("select on {table} projects no columns")]
    EmptyProjection { table: String },

    /// A keyset predicate over zero columns
    #[error("keyset predicate needs at least one key column")]
    EmptyKeyset,

    /// Key columns and bound values differ in length
    #[error("keyset predicate has {keys} key columns but {values} values")]
    KeysetArity { keys: usize, values: usize },

    /// An empty AND/OR group
    #[error("empty {0} group in where clause")]
    EmptyGroup(&'static str),
}
