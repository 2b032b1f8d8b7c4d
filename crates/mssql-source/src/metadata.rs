//! Table metadata: object kind, keys, clustered index and column types.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use select_query::{Dialect, SqlServer};
use sync_core::{Field, FieldType, Stream, StreamId, SyncMode, TypedValue, Value};
use tracing::{debug, info};

use crate::connection::{fetch_all, raw_query, SourceConnection};

/// Schemas that never hold user streams.
pub const SYSTEM_SCHEMAS: &[&str] = &[
    "sys",
    "INFORMATION_SCHEMA",
    "cdc",
    "guest",
    "db_owner",
    "db_accessadmin",
    "db_securityadmin",
    "db_ddladmin",
    "db_backupoperator",
    "db_datareader",
    "db_datawriter",
    "db_denydatareader",
    "db_denydatawriter",
];

/// Map a SQL Server `DATA_TYPE` to the field type it is read and checkpointed as.
pub fn field_type_for_native(data_type: &str) -> FieldType {
    match data_type.to_ascii_lowercase().as_str() {
        "tinyint" | "smallint" | "int" => FieldType::Integer,
        "bigint" => FieldType::Long,
        // money is read as decimal(19, 4); the driver would hand it over as a float
        "decimal" | "numeric" | "money" | "smallmoney" => FieldType::Decimal,
        "float" | "real" => FieldType::Double,
        "bit" => FieldType::Boolean,
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => FieldType::Binary,
        "date" => FieldType::Date,
        "datetime" | "datetime2" | "smalldatetime" => FieldType::LocalDateTime,
        "datetimeoffset" => FieldType::OffsetDateTime,
        "hierarchyid" => FieldType::HierarchyId,
        // char/varchar/nchar/nvarchar/text/ntext, uniqueidentifier, xml, time
        _ => FieldType::String,
    }
}

/// The clustered index of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredIndex {
    pub name: String,
    pub is_unique: bool,
    /// Key columns in key order
    pub columns: Vec<String>,
}

/// What discovery learned about one table or view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableMetadata {
    pub is_view: bool,
    /// Physical primary key columns, in key order
    pub primary_key: Vec<String>,
    pub clustered_index: Option<ClusteredIndex>,
}

impl TableMetadata {
    /// Physical primary key, else the catalog's logical key.
    pub fn declared_key(&self, stream: &Stream) -> Result<Vec<Field>> {
        if self.primary_key.is_empty() {
            return Ok(stream.primary_key_fields()?);
        }
        self.primary_key
            .iter()
            .map(|name| stream.require_field(name).cloned().map_err(anyhow::Error::from))
            .collect()
    }

    /// The column a snapshot is ordered and resumed by.
    ///
    /// A unique clustered index over a single column comes first, then the
    /// first column of the declared key. Non-unique and composite clustered
    /// indexes never qualify, and views have no resumption key at all.
    pub fn resumption_key(&self, stream: &Stream) -> Result<Option<Vec<Field>>> {
        if self.is_view {
            return Ok(None);
        }

        if let Some(index) = &self.clustered_index {
            if index.is_unique && index.columns.len() == 1 {
                let field = stream.require_field(&index.columns[0])?.clone();
                debug!(
                    "Stream {} resumes on clustered index {} ({})",
                    stream.id, index.name, field.name
                );
                return Ok(Some(vec![field]));
            }
        }

        let declared = self.declared_key(stream)?;
        Ok(declared.into_iter().next().map(|field| {
            debug!("Stream {} resumes on key column {}", stream.id, field.name);
            vec![field]
        }))
    }
}

fn text(value: &str) -> TypedValue {
    TypedValue::new(FieldType::String, Value::String(value.to_string()))
}

fn optional_text(value: Option<&str>) -> TypedValue {
    match value {
        Some(value) => text(value),
        None => TypedValue::null(FieldType::String),
    }
}

fn row_text(row: &[Value], idx: usize) -> Result<String> {
    match row.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => anyhow::bail!("Expected text in column {idx}, got {other:?}"),
    }
}

// `[schema].[table]` for OBJECT_ID.
fn object_name(id: &StreamId) -> String {
    let table = SqlServer.quote_identifier(&id.name);
    match &id.namespace {
        Some(namespace) => format!("{}.{}", SqlServer.quote_identifier(namespace), table),
        None => table,
    }
}

/// Load object kind, primary key and clustered index of one stream's table.
pub async fn load_table_metadata(
    conn: &mut dyn SourceConnection,
    id: &StreamId,
) -> Result<TableMetadata> {
    let kind = raw_query(
        "SELECT TABLE_TYPE FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA = COALESCE(@P1, SCHEMA_NAME()) AND TABLE_NAME = @P2",
        vec![optional_text(id.namespace.as_deref()), text(&id.name)],
    );
    let rows = fetch_all(conn, &kind, &[Field::new("TABLE_TYPE", FieldType::String)])
        .await
        .with_context(|| format!("Failed to look up {id}"))?;
    let Some(row) = rows.first() else {
        anyhow::bail!("Table or view {id} does not exist");
    };
    let is_view = row_text(row, 0)?.eq_ignore_ascii_case("VIEW");

    let object = text(&object_name(id));

    let pk = raw_query(
        "SELECT c.name FROM sys.indexes i \
         JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
         JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
         WHERE i.object_id = OBJECT_ID(@P1) AND i.is_primary_key = 1 \
         ORDER BY ic.key_ordinal",
        vec![object.clone()],
    );
    let primary_key = fetch_all(conn, &pk, &[Field::new("name", FieldType::String)])
        .await?
        .iter()
        .map(|row| row_text(row, 0))
        .collect::<Result<Vec<_>>>()?;

    let clustered = raw_query(
        "SELECT i.name, i.is_unique, c.name FROM sys.indexes i \
         JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
         JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
         WHERE i.object_id = OBJECT_ID(@P1) AND i.type = 1 AND ic.key_ordinal > 0 \
         ORDER BY ic.key_ordinal",
        vec![object],
    );
    let rows = fetch_all(
        conn,
        &clustered,
        &[
            Field::new("index_name", FieldType::String),
            Field::new("is_unique", FieldType::Boolean),
            Field::new("column_name", FieldType::String),
        ],
    )
    .await?;

    let mut clustered_index: Option<ClusteredIndex> = None;
    for row in &rows {
        let index = clustered_index.get_or_insert(ClusteredIndex {
            name: row_text(row, 0)?,
            is_unique: matches!(row.get(1), Some(Value::Boolean(true))),
            columns: Vec::new(),
        });
        index.columns.push(row_text(row, 2)?);
    }

    debug!("Metadata for {id}: view={is_view} pk={primary_key:?} clustered={clustered_index:?}");

    Ok(TableMetadata {
        is_view,
        primary_key,
        clustered_index,
    })
}

/// Build a catalog entry for every user table and view.
///
/// Streams come out as full refresh with their physical primary key; sync
/// mode and cursor are left for the operator to configure.
pub async fn discover_streams(conn: &mut dyn SourceConnection) -> Result<Vec<Stream>> {
    let columns = raw_query(
        "SELECT c.TABLE_SCHEMA, c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE \
         FROM INFORMATION_SCHEMA.COLUMNS c \
         JOIN INFORMATION_SCHEMA.TABLES t \
           ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
         ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION",
        Vec::new(),
    );
    let rows = fetch_all(
        conn,
        &columns,
        &[
            Field::new("TABLE_SCHEMA", FieldType::String),
            Field::new("TABLE_NAME", FieldType::String),
            Field::new("COLUMN_NAME", FieldType::String),
            Field::new("DATA_TYPE", FieldType::String),
        ],
    )
    .await
    .context("Failed to list columns")?;

    let mut tables: BTreeMap<StreamId, Vec<Field>> = BTreeMap::new();
    for row in &rows {
        let schema = row_text(row, 0)?;
        if SYSTEM_SCHEMAS.contains(&schema.as_str()) {
            continue;
        }
        let id = StreamId::new(Some(&schema), row_text(row, 1)?);
        let data_type = row_text(row, 3)?;
        let field = Field::new(row_text(row, 2)?, field_type_for_native(&data_type))
            .with_native_type(data_type);
        tables.entry(id).or_default().push(field);
    }

    let mut streams = Vec::with_capacity(tables.len());
    for (id, fields) in tables {
        let metadata = load_table_metadata(conn, &id).await?;
        streams.push(Stream {
            id,
            fields,
            sync_mode: SyncMode::FullRefresh,
            primary_key: metadata
                .primary_key
                .iter()
                .map(|column| vec![column.clone()])
                .collect(),
            cursor: None,
        });
    }

    info!("Discovered {} streams", streams.len());
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(primary_key: &[&str]) -> Stream {
        Stream {
            id: StreamId::new(Some("dbo"), "orders"),
            fields: vec![
                Field::new("id", FieldType::Long),
                Field::new("code", FieldType::String),
                Field::new("updated_at", FieldType::LocalDateTime),
            ],
            sync_mode: SyncMode::Incremental,
            primary_key: primary_key.iter().map(|c| vec![c.to_string()]).collect(),
            cursor: Some("updated_at".into()),
        }
    }

    fn clustered(columns: &[&str], is_unique: bool) -> Option<ClusteredIndex> {
        Some(ClusteredIndex {
            name: "ix_orders".into(),
            is_unique,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        })
    }

    fn names(fields: Option<Vec<Field>>) -> Option<Vec<String>> {
        fields.map(|f| f.into_iter().map(|f| f.name).collect())
    }

    #[test]
    fn test_native_type_mapping() {
        assert_eq!(field_type_for_native("INT"), FieldType::Integer);
        assert_eq!(field_type_for_native("bigint"), FieldType::Long);
        assert_eq!(field_type_for_native("numeric"), FieldType::Decimal);
        assert_eq!(field_type_for_native("rowversion"), FieldType::Binary);
        assert_eq!(field_type_for_native("datetime2"), FieldType::LocalDateTime);
        assert_eq!(field_type_for_native("datetimeoffset"), FieldType::OffsetDateTime);
        assert_eq!(field_type_for_native("hierarchyid"), FieldType::HierarchyId);
        assert_eq!(field_type_for_native("uniqueidentifier"), FieldType::String);
        assert_eq!(field_type_for_native("money"), FieldType::Decimal);
        assert_eq!(field_type_for_native("smallmoney"), FieldType::Decimal);
        assert_eq!(field_type_for_native("real"), FieldType::Double);
    }

    #[tokio::test]
    async fn test_discovery_records_native_types() {
        let db = crate::testing::FakeDatabase::new();
        db.rows(
            "INFORMATION_SCHEMA.TABLES",
            vec![vec![Value::String("BASE TABLE".into())]],
        );
        db.rows(
            "INFORMATION_SCHEMA.COLUMNS",
            vec![
                column_row("id", "int"),
                column_row("price", "money"),
                column_row("note", "nvarchar"),
            ],
        );
        db.rows("is_primary_key = 1", vec![vec![Value::String("id".into())]]);
        db.rows("i.type = 1", vec![]);

        let streams = discover_streams(&mut db.connection()).await.unwrap();
        assert_eq!(streams.len(), 1);
        let price = &streams[0].fields[1];
        assert_eq!(price.field_type, FieldType::Decimal);
        assert!(price.is_native("money"));
        assert_eq!(streams[0].primary_key, vec![vec!["id".to_string()]]);
    }

    fn column_row(name: &str, data_type: &str) -> Vec<Value> {
        ["sales", "orders", name, data_type]
            .into_iter()
            .map(|s| Value::String(s.into()))
            .collect()
    }

    #[test]
    fn test_unique_clustered_index_beats_composite_key() {
        let metadata = TableMetadata {
            is_view: false,
            primary_key: vec!["id".into(), "code".into()],
            clustered_index: clustered(&["updated_at"], true),
        };
        let stream = stream(&[]);
        assert_eq!(
            names(metadata.resumption_key(&stream).unwrap()),
            Some(vec!["updated_at".into()])
        );

        // The declared key is untouched
        let declared: Vec<String> = metadata
            .declared_key(&stream)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(declared, vec!["id".to_string(), "code".to_string()]);
    }

    #[test]
    fn test_composite_key_resumes_on_first_column() {
        let metadata = TableMetadata {
            is_view: false,
            primary_key: vec!["id".into(), "code".into()],
            clustered_index: clustered(&["id", "code"], true),
        };
        assert_eq!(
            names(metadata.resumption_key(&stream(&[])).unwrap()),
            Some(vec!["id".into()])
        );
    }

    #[test]
    fn test_non_unique_clustered_index_falls_back_to_key() {
        let metadata = TableMetadata {
            is_view: false,
            primary_key: vec!["id".into()],
            clustered_index: clustered(&["updated_at"], false),
        };
        assert_eq!(
            names(metadata.resumption_key(&stream(&[])).unwrap()),
            Some(vec!["id".into()])
        );
    }

    #[test]
    fn test_logical_key_used_without_physical_key() {
        let metadata = TableMetadata::default();
        assert_eq!(
            names(metadata.resumption_key(&stream(&["code"])).unwrap()),
            Some(vec!["code".into()])
        );
    }

    #[test]
    fn test_unique_single_column_clustered_index_without_key() {
        let metadata = TableMetadata {
            clustered_index: clustered(&["id"], true),
            ..Default::default()
        };
        assert_eq!(
            names(metadata.resumption_key(&stream(&[])).unwrap()),
            Some(vec!["id".into()])
        );
    }

    #[test]
    fn test_ineligible_clustered_indexes() {
        let non_unique = TableMetadata {
            clustered_index: clustered(&["id"], false),
            ..Default::default()
        };
        assert_eq!(non_unique.resumption_key(&stream(&[])).unwrap(), None);

        let composite = TableMetadata {
            clustered_index: clustered(&["id", "code"], true),
            ..Default::default()
        };
        assert_eq!(composite.resumption_key(&stream(&[])).unwrap(), None);
    }

    #[test]
    fn test_views_never_resume() {
        let metadata = TableMetadata {
            is_view: true,
            primary_key: vec!["id".into()],
            clustered_index: None,
        };
        assert_eq!(metadata.resumption_key(&stream(&["id"])).unwrap(), None);
    }

    #[test]
    fn test_undeclared_key_column_is_an_error() {
        let metadata = TableMetadata {
            primary_key: vec!["tenant_id".into()],
            ..Default::default()
        };
        let err = metadata.resumption_key(&stream(&[])).unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn test_object_name_is_quoted() {
        assert_eq!(
            object_name(&StreamId::new(Some("dbo"), "odd]name")),
            "[dbo].[odd]]name]"
        );
        assert_eq!(object_name(&StreamId::new(None, "t")), "[t]");
    }
}
