//! Unit tests for query generation.

use chrono::NaiveDate;
use sync_core::{BigDecimal, Field, FieldType, FieldTypeRegistry, Value};

use crate::{
    generate, keyset_after, CmpOp, Dialect, LimitPlacement, QueryError,
    SelectQuerySpec, SqlServer, WhereNode,
};

/// Dialect with trailing LIMIT and `$n` placeholders.
struct Trailing;

impl Dialect for Trailing {
    fn quote_identifier(&self, ident: &str) -> String {
        format!(r#""{ident}""#)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn limit_placement(&self) -> LimitPlacement {
        LimitPlacement::Trailing
    }

    fn render_limit(&self, limit: u64) -> String {
        format!("LIMIT {limit}")
    }

    fn name(&self) -> &'static str {
        "trailing"
    }
}

fn registry() -> FieldTypeRegistry {
    FieldTypeRegistry::default()
}

fn keys() -> Vec<Field> {
    vec![
        Field::new("k1", FieldType::Integer),
        Field::new("k2", FieldType::String),
        Field::new("k3", FieldType::Long),
    ]
}

#[test]
fn test_keyset_after_three_columns() {
    let keys = keys();
    let values = vec![
        Value::Integer(1),
        Value::String("b".into()),
        Value::Integer(3),
    ];
    let spec = SelectQuerySpec::columns(Some("dbo"), "t", keys.clone())
        .filter(keyset_after(&keys, &values).unwrap())
        .order_by(keys.clone());

    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT [k1], [k2], [k3] FROM [dbo].[t] WHERE [k1] > @P1 \
         OR ([k1] = @P2 AND [k2] > @P3) \
         OR ([k1] = @P4 AND [k2] = @P5 AND [k3] > @P6) \
         ORDER BY [k1], [k2], [k3]"
    );

    let bound: Vec<Value> = query.bindings.iter().map(|b| b.value.clone()).collect();
    assert_eq!(
        bound,
        vec![
            Value::Integer(1),
            Value::Integer(1),
            Value::String("b".into()),
            Value::Integer(1),
            Value::String("b".into()),
            Value::Integer(3),
        ]
    );
    assert_eq!(query.bindings[2].field_type, FieldType::String);
}

#[test]
fn test_keyset_with_trailing_dialect_placeholders() {
    let keys = &keys()[..2];
    let values = vec![Value::Integer(9), Value::String("z".into())];
    let node = keyset_after(keys, &values).unwrap();

    let spec = SelectQuerySpec::columns(None, "t", keys.to_vec())
        .filter(node)
        .limit(10);
    let query = generate(&spec, &Trailing, &registry()).unwrap();
    assert_eq!(
        query.sql,
        r#"SELECT "k1", "k2" FROM "t" WHERE "k1" > $1 OR ("k1" = $2 AND "k2" > $3) LIMIT 10"#
    );
}

#[test]
fn test_keyset_single_column_is_a_plain_comparison() {
    let id = Field::new("id", FieldType::Integer);
    let node = keyset_after(&[id.clone()], &[Value::Integer(5)]).unwrap();
    assert_eq!(node, WhereNode::cmp(&id, CmpOp::Greater, Value::Integer(5)));
}

#[test]
fn test_keyset_rejects_bad_arity() {
    let keys = keys();
    assert!(matches!(
        keyset_after(&keys, &[Value::Integer(1)]),
        Err(QueryError::KeysetArity { keys: 3, values: 1 })
    ));
    assert!(matches!(
        keyset_after(&[], &[]),
        Err(QueryError::EmptyKeyset)
    ));
}

#[test]
fn test_limit_placement_per_dialect() {
    let id = Field::new("id", FieldType::Integer);
    let spec = SelectQuerySpec::columns(Some("s"), "t", vec![id.clone()])
        .order_by(vec![id])
        .limit(500);

    let leading = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(leading.sql, "SELECT TOP 500 [id] FROM [s].[t] ORDER BY [id]");

    let trailing = generate(&spec, &Trailing, &registry()).unwrap();
    assert_eq!(
        trailing.sql,
        r#"SELECT "id" FROM "s"."t" ORDER BY "id" LIMIT 500"#
    );
}

#[test]
fn test_hierarchyid_projects_as_string() {
    let spec = SelectQuerySpec::columns(
        Some("dbo"),
        "org",
        vec![
            Field::new("id", FieldType::Integer),
            Field::new("node", FieldType::HierarchyId),
        ],
    );
    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT [id], [node].ToString() AS [node_text] FROM [dbo].[org]"
    );
}

#[test]
fn test_hierarchyid_key_orders_by_the_raw_column() {
    let node = Field::new("node", FieldType::HierarchyId);
    let spec = SelectQuerySpec::columns(Some("dbo"), "org", vec![node.clone()])
        .filter(keyset_after(std::slice::from_ref(&node), &[Value::String("/1/2/".into())]).unwrap())
        .order_by(vec![node])
        .limit(100);

    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT TOP 100 [node].ToString() AS [node_text] FROM [dbo].[org] \
         WHERE [node] > @P1 ORDER BY [node]"
    );
}

#[test]
fn test_money_is_read_as_exact_decimal() {
    let id = Field::new("id", FieldType::Integer);
    let price = Field::new("price", FieldType::Decimal).with_native_type("money");
    let spec = SelectQuerySpec::columns(Some("dbo"), "items", vec![id, price.clone()])
        .filter(keyset_after(std::slice::from_ref(&price), &[Value::Decimal(BigDecimal::from(5))]).unwrap())
        .order_by(vec![price.clone()])
        .limit(10);

    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT TOP 10 [id], CAST([price] AS decimal(19, 4)) AS [price_text] \
         FROM [dbo].[items] WHERE [price] > @P1 ORDER BY [price]"
    );

    let max = generate(&SelectQuerySpec::max(Some("dbo"), "items", price), &SqlServer, &registry())
        .unwrap();
    assert_eq!(
        max.sql,
        "SELECT CAST(MAX([price]) AS decimal(19, 4)) FROM [dbo].[items]"
    );
}

#[test]
fn test_max_of_hierarchyid_is_read_as_text() {
    let node = Field::new("node", FieldType::HierarchyId);
    let query = generate(&SelectQuerySpec::max(None, "org", node), &SqlServer, &registry()).unwrap();
    assert_eq!(query.sql, "SELECT MAX([node]).ToString() FROM [org]");
}

#[test]
fn test_max_mode_with_cutoff() {
    let ts = Field::new("updated_at", FieldType::LocalDateTime);
    let midnight = NaiveDate::from_ymd_opt(2024, 6, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let spec = SelectQuerySpec::max(Some("dbo"), "orders", ts.clone()).filter(WhereNode::cmp(
        &ts,
        CmpOp::Lesser,
        Value::String("2024-06-01T00:00:00".into()),
    ));

    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT MAX([updated_at]) FROM [dbo].[orders] WHERE [updated_at] < @P1"
    );
    assert_eq!(query.bindings[0].value, Value::LocalDateTime(midnight));
}

#[test]
fn test_filters_are_anded() {
    let amount = Field::new("amount", FieldType::Decimal);
    let spec = SelectQuerySpec::columns(None, "t", vec![amount.clone()])
        .filter(WhereNode::cmp(&amount, CmpOp::Greater, Value::Integer(10)))
        .filter(WhereNode::cmp(
            &amount,
            CmpOp::LesserOrEqual,
            Value::String("20.5".into()),
        ))
        .filter(WhereNode::cmp(&amount, CmpOp::GreaterOrEqual, Value::Integer(0)));

    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(
        query.sql,
        "SELECT [amount] FROM [t] WHERE [amount] > @P1 AND [amount] <= @P2 AND [amount] >= @P3"
    );
    assert_eq!(query.bindings[0].value, Value::Decimal(BigDecimal::from(10)));
    assert_eq!(
        query.bindings[1].value,
        Value::Decimal("20.5".parse::<BigDecimal>().unwrap())
    );
}

#[test]
fn test_identifiers_are_escaped() {
    let field = Field::new("odd]name", FieldType::String);
    let spec = SelectQuerySpec::columns(Some("my schema"), "t]x", vec![field]);
    let query = generate(&spec, &SqlServer, &registry()).unwrap();
    assert_eq!(query.sql, "SELECT [odd]]name] FROM [my schema].[t]]x]");
}

#[test]
fn test_incompatible_literal_is_an_error() {
    let id = Field::new("id", FieldType::Integer);
    let spec = SelectQuerySpec::columns(None, "t", vec![id.clone()]).filter(WhereNode::cmp(
        &id,
        CmpOp::Greater,
        Value::String("not a number".into()),
    ));

    let err = generate(&spec, &SqlServer, &registry()).unwrap_err();
    assert!(matches!(err, QueryError::Literal { ref column, .. } if column == "id"));
}

#[test]
fn test_empty_projection_is_an_error() {
    let spec = SelectQuerySpec::columns(None, "t", Vec::new());
    assert!(matches!(
        generate(&spec, &SqlServer, &registry()),
        Err(QueryError::EmptyProjection { .. })
    ));
}
