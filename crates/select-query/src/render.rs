//! Renders a [`SelectQuerySpec`] into SQL text and bindings.

use sync_core::{Field, FieldTypeRegistry, TypedValue, Value};

use crate::ast::{SelectNode, SelectQuerySpec, WhereNode};
use crate::dialect::{Dialect, LimitPlacement};
use crate::QueryError;

/// SQL text plus the values for its placeholders, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedQuery {
    pub sql: String,
    pub bindings: Vec<TypedValue>,
}

/// Accumulates SQL and bindings while walking the spec.
struct Renderer<'a> {
    sql: String,
    bindings: Vec<TypedValue>,
    dialect: &'a dyn Dialect,
    registry: &'a FieldTypeRegistry,
}

impl<'a> Renderer<'a> {
    fn new(dialect: &'a dyn Dialect, registry: &'a FieldTypeRegistry) -> Self {
        Self {
            sql: String::new(),
            bindings: Vec::new(),
            dialect,
            registry,
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn add_param(&mut self, field: &Field, value: &Value) -> Result<(), QueryError> {
        let bound = self
            .registry
            .encode_literal(field, value)
            .map_err(|source| QueryError::Literal {
                column: field.name.clone(),
                source,
            })?;
        let placeholder = self.dialect.placeholder(self.bindings.len());
        self.bindings.push(bound);
        self.sql.push_str(&placeholder);
        Ok(())
    }

    fn render_table(&mut self, spec: &SelectQuerySpec) {
        if let Some(namespace) = &spec.namespace {
            let ns = self.dialect.quote_identifier(namespace);
            self.push(&ns);
            self.push(".");
        }
        let table = self.dialect.quote_identifier(&spec.table);
        self.push(&table);
    }

    fn render_where(&mut self, node: &WhereNode, nested: bool) -> Result<(), QueryError> {
        match node {
            WhereNode::Cmp { field, op, value } => {
                let column = self.dialect.quote_identifier(&field.name);
                self.push(&column);
                self.push(" ");
                self.push(op.as_sql());
                self.push(" ");
                self.add_param(field, value)
            }
            WhereNode::And(nodes) => self.render_group(nodes, " AND ", "AND", nested),
            WhereNode::Or(nodes) => self.render_group(nodes, " OR ", "OR", nested),
        }
    }

    fn render_group(
        &mut self,
        nodes: &[WhereNode],
        separator: &str,
        name: &'static str,
        nested: bool,
    ) -> Result<(), QueryError> {
        if nodes.is_empty() {
            return Err(QueryError::EmptyGroup(name));
        }
        let parenthesize = nested && nodes.len() > 1;
        if parenthesize {
            self.push("(");
        }
        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.render_where(node, true)?;
        }
        if parenthesize {
            self.push(")");
        }
        Ok(())
    }
}

/// Render `spec` for `dialect`, coercing every literal through `registry`.
pub fn generate(
    spec: &SelectQuerySpec,
    dialect: &dyn Dialect,
    registry: &FieldTypeRegistry,
) -> Result<GeneratedQuery, QueryError> {
    let mut r = Renderer::new(dialect, registry);

    r.push("SELECT ");
    if let (Some(limit), LimitPlacement::Leading) = (spec.limit, dialect.limit_placement()) {
        r.push(&dialect.render_limit(limit));
        r.push(" ");
    }

    match &spec.select {
        SelectNode::Columns(fields) => {
            if fields.is_empty() {
                return Err(QueryError::EmptyProjection {
                    table: spec.table.clone(),
                });
            }
            let projection = fields
                .iter()
                .map(|f| dialect.render_projection(f))
                .collect::<Vec<_>>()
                .join(", ");
            r.push(&projection);
        }
        SelectNode::Max(field) => {
            r.push(&dialect.render_max(field));
        }
    }

    r.push(" FROM ");
    r.render_table(spec);

    if let Some(filter) = &spec.filter {
        r.push(" WHERE ");
        r.render_where(filter, false)?;
    }

    if !spec.order_by.is_empty() {
        let order = spec
            .order_by
            .iter()
            .map(|f| dialect.quote_identifier(&f.name))
            .collect::<Vec<_>>()
            .join(", ");
        r.push(" ORDER BY ");
        r.push(&order);
    }

    if let (Some(limit), LimitPlacement::Trailing) = (spec.limit, dialect.limit_placement()) {
        r.push(" ");
        r.push(&dialect.render_limit(limit));
    }

    Ok(GeneratedQuery {
        sql: r.sql,
        bindings: r.bindings,
    })
}
