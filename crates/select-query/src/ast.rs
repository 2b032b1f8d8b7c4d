//! Query description handed to the renderer.

use sync_core::{Field, Value};

use crate::QueryError;

/// Projection of a select.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectNode {
    /// Plain column list.
    Columns(Vec<Field>),
    /// `MAX(column)`, used to capture a cursor's upper bound.
    Max(Field),
}

/// Comparison operators available in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    Greater,
    GreaterOrEqual,
    Lesser,
    LesserOrEqual,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Equal => "=",
            CmpOp::Greater => ">",
            CmpOp::GreaterOrEqual => ">=",
            CmpOp::Lesser => "<",
            CmpOp::LesserOrEqual => "<=",
        }
    }
}

/// Predicate tree. Literals are bound, never inlined.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    And(Vec<WhereNode>),
    Or(Vec<WhereNode>),
    Cmp {
        field: Field,
        op: CmpOp,
        value: Value,
    },
}

impl WhereNode {
    pub fn cmp(field: &Field, op: CmpOp, value: Value) -> Self {
        WhereNode::Cmp {
            field: field.clone(),
            op,
            value,
        }
    }

    /// Conjunction that collapses single-element groups.
    pub fn and(mut nodes: Vec<WhereNode>) -> Self {
        if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            WhereNode::And(nodes)
        }
    }

    /// Disjunction that collapses single-element groups.
    pub fn or(mut nodes: Vec<WhereNode>) -> Self {
        if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            WhereNode::Or(nodes)
        }
    }
}

/// Everything needed to render one `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuerySpec {
    pub namespace: Option<String>,
    pub table: String,
    pub select: SelectNode,
    pub filter: Option<WhereNode>,
    pub order_by: Vec<Field>,
    pub limit: Option<u64>,
}

impl SelectQuerySpec {
    pub fn columns(namespace: Option<&str>, table: &str, fields: Vec<Field>) -> Self {
        Self::new(namespace, table, SelectNode::Columns(fields))
    }

    pub fn max(namespace: Option<&str>, table: &str, field: Field) -> Self {
        Self::new(namespace, table, SelectNode::Max(field))
    }

    fn new(namespace: Option<&str>, table: &str, select: SelectNode) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            table: table.to_string(),
            select,
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// AND `node` into the existing filter.
    pub fn filter(mut self, node: WhereNode) -> Self {
        self.filter = Some(match self.filter.take() {
            None => node,
            Some(WhereNode::And(mut nodes)) => {
                nodes.push(node);
                WhereNode::And(nodes)
            }
            Some(existing) => WhereNode::And(vec![existing, node]),
        });
        self
    }

    pub fn order_by(mut self, fields: Vec<Field>) -> Self {
        self.order_by = fields;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Rows strictly after `values` in lexicographic `keys` order:
/// `(k1 > v1) OR (k1 = v1 AND k2 > v2) OR ...`.
pub fn keyset_after(keys: &[Field], values: &[Value]) -> Result<WhereNode, QueryError> {
    if keys.is_empty() {
        return Err(QueryError::EmptyKeyset);
    }
    if keys.len() != values.len() {
        return Err(QueryError::KeysetArity {
            keys: keys.len(),
            values: values.len(),
        });
    }

    let disjuncts = (0..keys.len())
        .map(|i| {
            let mut conj: Vec<WhereNode> = keys[..i]
                .iter()
                .zip(&values[..i])
                .map(|(k, v)| WhereNode::cmp(k, CmpOp::Equal, v.clone()))
                .collect();
            conj.push(WhereNode::cmp(&keys[i], CmpOp::Greater, values[i].clone()));
            WhereNode::and(conj)
        })
        .collect();
    Ok(WhereNode::or(disjuncts))
}
