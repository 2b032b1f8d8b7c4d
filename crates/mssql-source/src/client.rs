//! Tiberius-backed connections and the connection pool.

use std::ops::DerefMut;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use deadpool_tiberius::{Manager, Pool};
use futures::StreamExt;
use select_query::GeneratedQuery;
use sync_core::{Field, FieldType, TypedValue, Value};
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnData, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::debug;

use crate::connection::{ConnectionProvider, RowStream, SourceConnection, SourceRow};
use crate::SourceOpts;

type TdsClient = Client<Compat<TcpStream>>;

/// Create the connection pool every reader draws from.
pub fn new_mssql_pool(opts: &SourceOpts) -> Result<Pool> {
    let mut manager = Manager::new()
        .host(&opts.host)
        .port(opts.port)
        .authentication(AuthMethod::sql_server(&opts.user, &opts.password))
        .database(&opts.database)
        .max_size(opts.max_connections);
    if opts.trust_cert {
        manager = manager.trust_cert();
    }

    manager.create_pool().map_err(|e| {
        anyhow::anyhow!(
            "Failed to create SQL Server connection pool for {}:{}/{}: {e}",
            opts.host,
            opts.port,
            opts.database
        )
    })
}

#[async_trait]
impl ConnectionProvider for Pool {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        let client = self
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire SQL Server connection: {e}"))?;
        Ok(Box::new(TiberiusConnection::new(client)))
    }
}

/// A [`SourceConnection`] over anything that dereferences to a tiberius client,
/// pooled or not.
pub struct TiberiusConnection<C> {
    client: C,
}

impl<C> TiberiusConnection<C>
where
    C: DerefMut<Target = TdsClient> + Send,
{
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> SourceConnection for TiberiusConnection<C>
where
    C: DerefMut<Target = TdsClient> + Send,
{
    async fn select<'a>(
        &'a mut self,
        query: &'a GeneratedQuery,
        fields: &'a [Field],
    ) -> Result<RowStream<'a>> {
        debug!("Executing query: {}", query.sql);
        let stream = prepare(query)
            .query(&mut *self.client)
            .await
            .with_context(|| format!("Query failed: {}", query.sql))?;

        let rows = stream.into_row_stream().map(move |row| {
            let row = row.context("Failed to fetch row")?;
            decode_row(&row, fields)
        });
        Ok(rows.boxed())
    }

    async fn execute(&mut self, query: &GeneratedQuery) -> Result<u64> {
        debug!("Executing statement: {}", query.sql);
        let result = prepare(query)
            .execute(&mut *self.client)
            .await
            .with_context(|| format!("Statement failed: {}", query.sql))?;
        Ok(result.rows_affected().iter().sum())
    }
}

fn prepare(query: &GeneratedQuery) -> Query<'_> {
    let mut q = Query::new(query.sql.as_str());
    for binding in &query.bindings {
        bind(&mut q, binding);
    }
    q
}

// Nulls are bound with the parameter type of their field.
fn bind<'a>(query: &mut Query<'a>, binding: &'a TypedValue) {
    match &binding.value {
        Value::Null => bind_null(query, binding.field_type),
        Value::Boolean(b) => query.bind(*b),
        Value::Integer(i) => match (binding.field_type, i32::try_from(*i)) {
            (FieldType::Integer, Ok(narrow)) => query.bind(narrow),
            _ => query.bind(*i),
        },
        Value::Decimal(d) => match to_numeric(d) {
            Some(n) => query.bind(n),
            // Wider than numeric(38); the server converts the text
            None => query.bind(d.to_plain_string()),
        },
        Value::Double(f) => query.bind(*f),
        Value::String(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::Date(d) => query.bind(*d),
        Value::LocalDateTime(dt) => query.bind(*dt),
        Value::OffsetDateTime(dt) => query.bind(*dt),
    }
}

// Mantissa and scale as SQL Server numeric, if they fit in 38 digits.
fn to_numeric(value: &BigDecimal) -> Option<Numeric> {
    let (mantissa, scale) = value.as_bigint_and_exponent();
    let (mantissa, scale) = if scale < 0 {
        value.with_scale(0).as_bigint_and_exponent()
    } else {
        (mantissa, scale)
    };
    let scale = u8::try_from(scale).ok().filter(|s| *s <= 37)?;
    let mantissa = mantissa.to_i128()?;
    (mantissa.unsigned_abs() < 10u128.pow(38)).then(|| Numeric::new_with_scale(mantissa, scale))
}

// Exact text of a numeric: mantissa digits with the point `scale` places from the right.
fn numeric_text(n: Numeric) -> String {
    let scale = usize::from(n.scale());
    let digits = format!("{:0>width$}", n.value().unsigned_abs(), width = scale + 1);
    let (int, frac) = digits.split_at(digits.len() - scale);
    let sign = if n.value() < 0 { "-" } else { "" };
    if frac.is_empty() {
        format!("{sign}{int}")
    } else {
        format!("{sign}{int}.{frac}")
    }
}

fn bind_null(query: &mut Query<'_>, field_type: FieldType) {
    match field_type {
        FieldType::Integer => query.bind(Option::<i32>::None),
        FieldType::Long => query.bind(Option::<i64>::None),
        FieldType::Decimal => query.bind(Option::<Numeric>::None),
        FieldType::Double => query.bind(Option::<f64>::None),
        FieldType::Boolean => query.bind(Option::<bool>::None),
        FieldType::String | FieldType::HierarchyId => query.bind(Option::<String>::None),
        FieldType::Binary => query.bind(Option::<Vec<u8>>::None),
        FieldType::Date => query.bind(Option::<NaiveDate>::None),
        FieldType::LocalDateTime => query.bind(Option::<NaiveDateTime>::None),
        FieldType::OffsetDateTime => query.bind(Option::<DateTime<FixedOffset>>::None),
    }
}

fn decode_row(row: &Row, fields: &[Field]) -> Result<SourceRow> {
    if row.len() != fields.len() {
        anyhow::bail!(
            "Query returned {} columns but {} were expected",
            row.len(),
            fields.len()
        );
    }

    row.cells()
        .zip(fields)
        .enumerate()
        .map(|(idx, ((column, data), field))| {
            decode_cell(row, idx, data).with_context(|| {
                format!(
                    "Failed to decode column '{}' as {}",
                    column.name(),
                    field.field_type
                )
            })
        })
        .collect()
}

fn decode_cell(row: &Row, idx: usize, data: &ColumnData<'static>) -> Result<Value> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| Value::Integer(i64::from(v))),
        ColumnData::I64(v) => v.map(Value::Integer),
        ColumnData::F32(v) => v.map(|v| Value::Double(f64::from(v))),
        ColumnData::F64(v) => v.map(Value::Double),
        ColumnData::Bit(v) => v.map(Value::Boolean),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())),
        // SQL Server renders uniqueidentifier in upper case
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string().to_uppercase())),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => match v {
            Some(n) => Some(Value::Decimal(
                BigDecimal::from_str(&numeric_text(*n))
                    .map_err(|e| anyhow::anyhow!("numeric {n} is not a decimal: {e}"))?,
            )),
            None => None,
        },
        ColumnData::Xml(v) => v.as_ref().map(|x| Value::String(x.to_string())),
        ColumnData::Date(_) => row.try_get::<NaiveDate, _>(idx)?.map(Value::Date),
        ColumnData::Time(_) => row
            .try_get::<NaiveTime, _>(idx)?
            .map(|t| Value::String(t.format("%H:%M:%S%.6f").to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            row.try_get::<NaiveDateTime, _>(idx)?
                .map(Value::LocalDateTime)
        }
        ColumnData::DateTimeOffset(_) => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(Value::OffsetDateTime),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(text: &str) -> Option<Numeric> {
        to_numeric(&BigDecimal::from_str(text).unwrap())
    }

    #[test]
    fn test_decimal_binds_as_numeric() {
        let n = numeric("-1234.5600").unwrap();
        assert_eq!(n.value(), -12345600);
        assert_eq!(n.scale(), 4);

        let widest = numeric("12345678901234567890123456789012345678").unwrap();
        assert_eq!(widest.value(), 12345678901234567890123456789012345678);
        assert_eq!(widest.scale(), 0);

        // Positive exponent is expanded to an integer
        let n = numeric("1E+3").unwrap();
        assert_eq!((n.value(), n.scale()), (1000, 0));
    }

    #[test]
    fn test_numeric_text_is_exact() {
        assert_eq!(numeric_text(Numeric::new_with_scale(-5, 1)), "-0.5");
        assert_eq!(numeric_text(Numeric::new_with_scale(123456, 4)), "12.3456");
        assert_eq!(numeric_text(Numeric::new_with_scale(7, 3)), "0.007");
        assert_eq!(numeric_text(Numeric::new_with_scale(42, 0)), "42");
        assert_eq!(
            numeric_text(Numeric::new_with_scale(
                -12345678901234567890123456789012345678,
                10
            )),
            "-1234567890123456789012345678.9012345678"
        );
    }

    #[test]
    fn test_decimal_wider_than_numeric_38_does_not_bind_as_numeric() {
        assert!(numeric("123456789012345678901234567890123456789").is_none());
        assert!(numeric("0.00000000000000000000000000000000000001").is_none());
    }
}
