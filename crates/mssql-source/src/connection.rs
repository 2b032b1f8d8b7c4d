//! Connection seam between the readers and the database driver.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use select_query::GeneratedQuery;
use sync_core::{Field, TypedValue, Value};

/// One decoded row, parallel to the fields it was read with.
pub type SourceRow = Vec<Value>;

/// Rows of a running query, in the query's order.
pub type RowStream<'a> = BoxStream<'a, Result<SourceRow>>;

/// A single database session, owned by one reader at a time.
#[async_trait]
pub trait SourceConnection: Send {
    /// Run `query` and decode every column under the matching entry of `fields`.
    async fn select<'a>(
        &'a mut self,
        query: &'a GeneratedQuery,
        fields: &'a [Field],
    ) -> Result<RowStream<'a>>;

    /// Run a statement that returns no rows; yields the affected row count.
    async fn execute(&mut self, query: &GeneratedQuery) -> Result<u64>;
}

/// Hands out connections, e.g. from a pool.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>>;
}

/// Wrap hand-written SQL (catalog and CDC functions) in a [`GeneratedQuery`].
pub fn raw_query(sql: impl Into<String>, bindings: Vec<TypedValue>) -> GeneratedQuery {
    GeneratedQuery {
        sql: sql.into(),
        bindings,
    }
}

/// Run `query` and collect every row.
pub async fn fetch_all(
    conn: &mut dyn SourceConnection,
    query: &GeneratedQuery,
    fields: &[Field],
) -> Result<Vec<SourceRow>> {
    conn.select(query, fields).await?.try_collect().await
}

/// Run `query` and return its first row, if any.
pub async fn fetch_optional(
    conn: &mut dyn SourceConnection,
    query: &GeneratedQuery,
    fields: &[Field],
) -> Result<Option<SourceRow>> {
    let mut rows = conn.select(query, fields).await?;
    rows.try_next().await
}
