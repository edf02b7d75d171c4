//! Source warehouse access.
//!
//! The engine only needs a narrow set of read operations from the warehouse:
//! distribution statistics for chunk planning, and row fetches for workers.
//! [`SourceReader`] captures exactly that, so planners and workers can be
//! exercised against in-memory fakes.

mod warehouse;

pub use warehouse::WarehouseReader;

use crate::error::Result;
use crate::pg::qualify_table;
use async_trait::async_trait;

/// A table in the source warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub schema: String,
    pub name: String,
}

impl SourceTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted `schema.table`.
    pub fn qualified(&self) -> String {
        qualify_table(&self.schema, &self.name)
    }

    /// Unquoted `schema.table` for logs.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Rows fetched from the source, every value rendered as text (NULL as `None`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Statistics of an integer partition expression over matching rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumericBounds {
    /// MIN and MAX over non-NULL values, `None` when no row has a value.
    pub range: Option<(i64, i64)>,
    /// `COUNT(expr)`: rows with a value.
    pub rows: i64,
    /// `COUNT(*)`: every matching row.
    pub total: i64,
}

impl NumericBounds {
    /// Matching rows whose expression is NULL.
    pub fn null_rows(&self) -> i64 {
        (self.total - self.rows).max(0)
    }
}

/// Read access to the source warehouse.
///
/// Every `filter` argument is a complete boolean SQL predicate over the table.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// `COUNT(*)` of rows matching `filter`.
    async fn count_rows(&self, table: &SourceTable, filter: &str) -> Result<i64>;

    /// MIN, MAX and non-NULL count of an integer expression, with the count
    /// of all matching rows.
    async fn numeric_bounds(
        &self,
        table: &SourceTable,
        column_expr: &str,
        filter: &str,
    ) -> Result<NumericBounds>;

    /// Distinct values of `column` with their row counts, ordered by `sort_column`.
    async fn value_counts(
        &self,
        table: &SourceTable,
        column: &str,
        sort_column: &str,
        filter: &str,
    ) -> Result<Vec<(String, i64)>>;

    /// Distinct calendar dates (`YYYY-MM-DD`) of `column` with row counts, ascending.
    async fn date_counts(
        &self,
        table: &SourceTable,
        column: &str,
        filter: &str,
    ) -> Result<Vec<(String, i64)>>;

    /// Stored data type of a column, lower-cased, if the column exists.
    async fn column_type(&self, table: &SourceTable, column: &str) -> Result<Option<String>>;

    /// Column names in ordinal order.
    async fn columns(&self, table: &SourceTable) -> Result<Vec<String>>;

    /// Run a query whose result columns are all text.
    async fn fetch(&self, query: &str) -> Result<RowBatch>;

    /// Round-trip check.
    async fn ping(&self) -> Result<()>;
}

/// Whether a stored type name is a character type.
pub fn is_text_type(data_type: &str) -> bool {
    let t = data_type.to_lowercase();
    t.starts_with("varchar")
        || t.starts_with("character")
        || t.starts_with("char")
        || t.starts_with("text")
        || t.starts_with("string")
        || t.starts_with("nvarchar")
        || t.starts_with("bpchar")
}
