//! Defines the `Dialect` trait for database-specific SQL syntax.

use sync_core::{Field, FieldType};

/// Where a row cap goes in a `SELECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPlacement {
    /// Right after `SELECT` (`SELECT TOP n ...`).
    Leading,
    /// At the end of the statement (`... LIMIT n`).
    Trailing,
}

pub trait Dialect: Send + Sync {
    /// Wraps an identifier (like a table or column name) in the correct
    /// quotation marks for the dialect.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Returns the placeholder for the zero-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    fn limit_placement(&self) -> LimitPlacement;

    /// Renders the row cap clause, without surrounding whitespace.
    fn render_limit(&self, limit: u64) -> String;

    /// Renders one projected column. Types the driver cannot read natively
    /// are converted server-side; rows are read by position, so the alias of
    /// a converted column is free. It must differ from the column name, or an
    /// `ORDER BY` on that name sorts by the converted value.
    fn render_projection(&self, field: &Field) -> String {
        self.quote_identifier(&field.name)
    }

    /// Renders the maximum of a column, converted the same way as its
    /// projection.
    fn render_max(&self, field: &Field) -> String {
        format!("MAX({})", self.quote_identifier(&field.name))
    }

    /// Returns the name of the dialect.
    fn name(&self) -> &'static str;
}

/// `money` and `smallmoney` are read as this exact type instead of as floats.
const MONEY_AS: &str = "decimal(19, 4)";

fn is_money(field: &Field) -> bool {
    field.is_native("money") || field.is_native("smallmoney")
}

/// Microsoft SQL Server (T-SQL).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServer;

impl Dialect for SqlServer {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index + 1)
    }

    fn limit_placement(&self) -> LimitPlacement {
        LimitPlacement::Leading
    }

    fn render_limit(&self, limit: u64) -> String {
        format!("TOP {limit}")
    }

    fn render_projection(&self, field: &Field) -> String {
        let quoted = self.quote_identifier(&field.name);
        let alias = || self.quote_identifier(&format!("{}_text", field.name));
        match field.field_type {
            FieldType::HierarchyId => format!("{quoted}.ToString() AS {}", alias()),
            _ if is_money(field) => format!("CAST({quoted} AS {MONEY_AS}) AS {}", alias()),
            _ => quoted,
        }
    }

    fn render_max(&self, field: &Field) -> String {
        let quoted = self.quote_identifier(&field.name);
        match field.field_type {
            FieldType::HierarchyId => format!("MAX({quoted}).ToString()"),
            _ if is_money(field) => format!("CAST(MAX({quoted}) AS {MONEY_AS})"),
            _ => format!("MAX({quoted})"),
        }
    }

    fn name(&self) -> &'static str {
        "SQL Server"
    }
}
