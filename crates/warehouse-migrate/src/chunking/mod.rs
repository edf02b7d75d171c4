//! Chunk planning.
//!
//! A table filtered by a base predicate is split into disjoint
//! [`ChunkDescriptor`]s that together cover every matching row. Each
//! strategy implements [`ChunkingStrategy`]; [`select_strategy`] picks one
//! from the partition column's declared type and the load type.
//!
//! Descriptors are plain data and serialize to JSON, which is how the status
//! ledger stores them so a resumed run can execute pending chunks without
//! re-running distribution analysis.

mod date;
mod grouped;
mod numeric;
mod offset;
mod single;

pub use date::DateRangeStrategy;
pub use grouped::GroupedValuesStrategy;
pub use numeric::NumericRangeStrategy;
pub use offset::OffsetStrategy;
pub use single::SingleChunkStrategy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TableConfig;
use crate::error::Result;
use crate::pg::{quote_ident, quote_literal};
use crate::source::{SourceReader, SourceTable};

/// Hard cap on values per `IN (...)` list.
pub const MAX_IN_LIST_VALUES: usize = 1000;

/// Row-estimate tolerance for grouped-values chunks.
pub const GROUPED_ROW_TOLERANCE: f64 = 1.2;

/// Strategy family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Single,
    NumericRange,
    GroupedValues,
    DateRange,
    OffsetBased,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::Single => "single",
            StrategyKind::NumericRange => "numeric_range",
            StrategyKind::GroupedValues => "grouped_values",
            StrategyKind::DateRange => "date_range",
            StrategyKind::OffsetBased => "offset_based",
        };
        f.write_str(s)
    }
}

/// Strategy-specific bounds of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkMetadata {
    Single,
    NumericRange {
        id_column: String,
        min_id: i64,
        max_id: i64,
    },
    GroupedValues {
        id_column: String,
        value_count: usize,
        values: Vec<String>,
    },
    DateRange {
        date_column: String,
        dates: Vec<String>,
    },
    /// One oversized date split into ordered LIMIT/OFFSET pages.
    DateRangeOffset {
        date_column: String,
        date_value: String,
        offset: i64,
        limit: i64,
        sub_chunk_index: usize,
        total_sub_chunks: usize,
        order_columns: Vec<String>,
    },
    OffsetBased {
        sort_column: String,
        offset: i64,
        limit: i64,
    },
    /// Rows whose partition column is NULL, which no range, list or date
    /// predicate matches.
    NullPartition {
        column: String,
        planned_by: StrategyKind,
    },
}

/// One independently fetchable and loadable slice of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: i32,
    /// Complete source-side predicate, base filter included.
    pub filter: String,
    pub estimated_rows: i64,
    /// Precomputed load mode. `None` leaves the choice to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_copy_mode: Option<bool>,
    pub metadata: ChunkMetadata,
}

impl ChunkDescriptor {
    pub fn strategy(&self) -> StrategyKind {
        match self.metadata {
            ChunkMetadata::Single => StrategyKind::Single,
            ChunkMetadata::NumericRange { .. } => StrategyKind::NumericRange,
            ChunkMetadata::GroupedValues { .. } => StrategyKind::GroupedValues,
            ChunkMetadata::DateRange { .. } | ChunkMetadata::DateRangeOffset { .. } => {
                StrategyKind::DateRange
            }
            ChunkMetadata::OffsetBased { .. } => StrategyKind::OffsetBased,
            ChunkMetadata::NullPartition { planned_by, .. } => planned_by,
        }
    }

    /// Page window for chunks that cannot be expressed as a pure predicate.
    /// Returns `(order_columns, offset, limit)`.
    pub fn page(&self) -> Option<(Vec<String>, i64, i64)> {
        match &self.metadata {
            ChunkMetadata::DateRangeOffset {
                order_columns,
                offset,
                limit,
                ..
            } => Some((order_columns.clone(), *offset, *limit)),
            ChunkMetadata::OffsetBased {
                sort_column,
                offset,
                limit,
            } => Some((vec![sort_column.clone()], *offset, *limit)),
            _ => None,
        }
    }

    /// Whether the filter already narrows the key space (so a chunk-scoped
    /// watermark lookup is meaningful).
    pub fn is_key_scoped(&self) -> bool {
        !matches!(
            self.metadata,
            ChunkMetadata::Single | ChunkMetadata::OffsetBased { .. }
        )
    }

    /// The chunk's key bounds as a predicate over the target table.
    ///
    /// Only the partition column is referenced, never the source base filter,
    /// so the predicate is valid wherever the target carries that column.
    pub fn target_scope(&self) -> Option<String> {
        let dates_predicate = |column: &str, dates: &[String]| {
            let list = dates
                .iter()
                .map(|d| quote_literal(d))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}::date IN ({})", quote_ident(column), list)
        };
        match &self.metadata {
            ChunkMetadata::NumericRange {
                id_column,
                min_id,
                max_id,
            } => Some(format!(
                "{c} >= {} AND {c} <= {}",
                min_id,
                max_id,
                c = quote_ident(id_column)
            )),
            ChunkMetadata::GroupedValues {
                id_column, values, ..
            } => {
                let list = values
                    .iter()
                    .map(|v| quote_literal(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!("{}::text IN ({})", quote_ident(id_column), list))
            }
            ChunkMetadata::DateRange { date_column, dates } => {
                Some(dates_predicate(date_column, dates))
            }
            ChunkMetadata::DateRangeOffset {
                date_column,
                date_value,
                ..
            } => Some(dates_predicate(date_column, std::slice::from_ref(date_value))),
            ChunkMetadata::NullPartition { column, .. } => {
                Some(format!("{} IS NULL", quote_ident(column)))
            }
            ChunkMetadata::Single | ChunkMetadata::OffsetBased { .. } => None,
        }
    }

    /// Column the chunk is partitioned on, if any.
    pub fn partition_column(&self) -> Option<&str> {
        match &self.metadata {
            ChunkMetadata::NumericRange { id_column, .. }
            | ChunkMetadata::GroupedValues { id_column, .. } => Some(id_column),
            ChunkMetadata::DateRange { date_column, .. }
            | ChunkMetadata::DateRangeOffset { date_column, .. } => Some(date_column),
            ChunkMetadata::OffsetBased { sort_column, .. } => Some(sort_column),
            ChunkMetadata::NullPartition { column, .. } => Some(column),
            ChunkMetadata::Single => None,
        }
    }

    /// Serialize for the status ledger.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a descriptor persisted with [`ChunkDescriptor::to_json`].
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Inputs shared by every strategy.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub table: SourceTable,
    /// Base predicate, `1=1` when unfiltered.
    pub filter: String,
    pub batch_size: usize,
}

impl ChunkRequest {
    pub fn new(table: SourceTable, filter: impl Into<String>, batch_size: usize) -> Self {
        Self {
            table,
            filter: filter.into(),
            batch_size: batch_size.max(1),
        }
    }

    /// The base predicate combined with another clause.
    pub(crate) fn and(&self, clause: &str) -> String {
        format!("({}) AND {}", self.filter, clause)
    }
}

/// Chunk for the rows of `base` whose partition column is NULL.
pub(crate) fn null_partition_chunk(
    base: &str,
    column: &str,
    chunk_id: i32,
    rows: i64,
    planned_by: StrategyKind,
) -> ChunkDescriptor {
    ChunkDescriptor {
        chunk_id,
        filter: format!("({}) AND {} IS NULL", base, quote_ident(column)),
        estimated_rows: rows,
        use_copy_mode: None,
        metadata: ChunkMetadata::NullPartition {
            column: column.to_string(),
            planned_by,
        },
    }
}

/// Rows of `base` whose partition column is NULL.
pub(crate) async fn count_null_rows(
    source: &dyn SourceReader,
    table: &SourceTable,
    base: &str,
    column: &str,
) -> Result<i64> {
    source
        .count_rows(table, &format!("({}) AND {} IS NULL", base, quote_ident(column)))
        .await
}

/// The single capability shared by all strategies.
#[async_trait]
pub trait ChunkingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Compute an ordered list of disjoint chunks covering the filtered table.
    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>>;
}

/// Column type families relevant to strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFamily {
    Numeric,
    Temporal,
    Opaque,
    Other,
}

/// Classify a declared column type.
pub fn column_family(data_type: &str) -> ColumnFamily {
    let t = data_type.trim().to_lowercase();
    let base = t.split('(').next().unwrap_or("").trim();
    match base {
        "int" | "integer" | "bigint" | "smallint" | "int2" | "int4" | "int8" | "number"
        | "serial" | "bigserial" => ColumnFamily::Numeric,
        "date" | "datetime" | "timestamp" | "timestamptz" | "timestamp_ntz" | "timestamp_ltz"
        | "timestamp_tz" | "timestamp with time zone" | "timestamp without time zone" => {
            ColumnFamily::Temporal
        }
        "uuid" | "varchar" | "string" | "text" | "char" | "character" | "character varying"
        | "nvarchar" => ColumnFamily::Opaque,
        _ => ColumnFamily::Other,
    }
}

/// Pick a strategy for a table.
///
/// Returns the strategy and the column it partitions on.
pub fn select_strategy(table: &TableConfig) -> (StrategyKind, Option<String>) {
    let (column, data_type) = match table.chunking_column() {
        Some(c) => c,
        None => return (StrategyKind::Single, None),
    };

    match column_family(data_type) {
        ColumnFamily::Numeric => (StrategyKind::NumericRange, Some(column.to_string())),
        ColumnFamily::Temporal => (StrategyKind::DateRange, Some(column.to_string())),
        ColumnFamily::Opaque => match (&table.source_watermark, table.is_incremental()) {
            (Some(wm), true) => (StrategyKind::DateRange, Some(wm.clone())),
            _ => (StrategyKind::GroupedValues, Some(column.to_string())),
        },
        ColumnFamily::Other => (StrategyKind::OffsetBased, Some(column.to_string())),
    }
}

/// Per-table planning options beyond the shared request.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Ordering column for grouped-values and offset chunking.
    pub sort_column: Option<String>,
    /// Deterministic tie-breakers for paginated date sub-chunks.
    pub uniqueness_columns: Vec<String>,
    /// Extra predicate restricting a date-range plan to rows past the target's high-water mark.
    pub watermark_filter: Option<String>,
}

/// Build the strategy object for a selection.
pub fn build_strategy(
    kind: StrategyKind,
    column: Option<String>,
    request: ChunkRequest,
    options: PlanOptions,
) -> Box<dyn ChunkingStrategy> {
    match (kind, column) {
        (StrategyKind::NumericRange, Some(col)) => Box::new(NumericRangeStrategy::new(request, col)),
        (StrategyKind::GroupedValues, Some(col)) => {
            let sort = options.sort_column.unwrap_or_else(|| col.clone());
            Box::new(GroupedValuesStrategy::new(request, col, sort))
        }
        (StrategyKind::DateRange, Some(col)) => Box::new(
            DateRangeStrategy::new(request, col, options.uniqueness_columns)
                .with_watermark_filter(options.watermark_filter),
        ),
        (StrategyKind::OffsetBased, Some(col)) => {
            let sort = options.sort_column.unwrap_or(col);
            Box::new(OffsetStrategy::new(request, sort))
        }
        (_, _) => Box::new(SingleChunkStrategy::new(request)),
    }
}

/// Precompute bulk-copy eligibility per chunk.
///
/// When the target was truncated at run start every chunk may bulk-append.
/// Otherwise a numeric-range chunk may bulk-append only if its id band does
/// not overlap the target's existing key range. Other chunks are left
/// undecided.
pub fn apply_copy_mode(
    chunks: &mut [ChunkDescriptor],
    target_key_range: Option<(i64, i64)>,
    target_truncated: bool,
) {
    for chunk in chunks.iter_mut() {
        if target_truncated {
            chunk.use_copy_mode = Some(true);
            continue;
        }
        if let ChunkMetadata::NumericRange { min_id, max_id, .. } = chunk.metadata {
            let overlaps = match target_key_range {
                Some((tmin, tmax)) => min_id <= tmax && max_id >= tmin,
                None => false,
            };
            chunk.use_copy_mode = Some(!overlaps);
        }
    }
}

/// `ceil(a / b)` for positive integers.
pub(crate) fn div_ceil(a: i64, b: i64) -> i64 {
    if b <= 0 {
        return 0;
    }
    a / b + i64::from(a % b != 0)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory source fake used by the planner tests.

    use super::*;
    use crate::source::{NumericBounds, RowBatch};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct StatsSource {
        pub count: i64,
        /// Answer to counts restricted to a NULL partition column.
        pub null_count: i64,
        pub bounds: NumericBounds,
        pub values: Vec<(String, i64)>,
        pub dates: Vec<(String, i64)>,
        pub column_type: Option<String>,
        pub seen_filters: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceReader for StatsSource {
        async fn count_rows(&self, _t: &SourceTable, filter: &str) -> Result<i64> {
            self.seen_filters.lock().unwrap().push(filter.to_string());
            if filter.ends_with(" IS NULL") {
                return Ok(self.null_count);
            }
            Ok(self.count)
        }
        async fn numeric_bounds(
            &self,
            _t: &SourceTable,
            column_expr: &str,
            filter: &str,
        ) -> Result<NumericBounds> {
            self.seen_filters
                .lock()
                .unwrap()
                .push(format!("{} | {}", column_expr, filter));
            Ok(self.bounds)
        }
        async fn value_counts(
            &self,
            _t: &SourceTable,
            _c: &str,
            _s: &str,
            filter: &str,
        ) -> Result<Vec<(String, i64)>> {
            self.seen_filters.lock().unwrap().push(filter.to_string());
            Ok(self.values.clone())
        }
        async fn date_counts(
            &self,
            _t: &SourceTable,
            _c: &str,
            filter: &str,
        ) -> Result<Vec<(String, i64)>> {
            self.seen_filters.lock().unwrap().push(filter.to_string());
            Ok(self.dates.clone())
        }
        async fn column_type(&self, _t: &SourceTable, _c: &str) -> Result<Option<String>> {
            Ok(self.column_type.clone())
        }
        async fn columns(&self, _t: &SourceTable) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn fetch(&self, _q: &str) -> Result<RowBatch> {
            Ok(RowBatch::default())
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    pub fn request(batch_size: usize) -> ChunkRequest {
        ChunkRequest::new(SourceTable::new("ANALYTICS", "EVENTS"), "1=1", batch_size)
    }
}
