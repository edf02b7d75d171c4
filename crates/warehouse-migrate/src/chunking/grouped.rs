//! Distinct-value grouping for high-cardinality opaque keys.

use async_trait::async_trait;
use tracing::info;

use super::{
    count_null_rows, null_partition_chunk, ChunkDescriptor, ChunkMetadata, ChunkRequest,
    ChunkingStrategy, StrategyKind, GROUPED_ROW_TOLERANCE, MAX_IN_LIST_VALUES,
};
use crate::error::Result;
use crate::pg::{quote_ident, quote_literal};
use crate::source::SourceReader;

pub struct GroupedValuesStrategy {
    request: ChunkRequest,
    column: String,
    sort_column: String,
}

impl GroupedValuesStrategy {
    pub fn new(
        request: ChunkRequest,
        column: impl Into<String>,
        sort_column: impl Into<String>,
    ) -> Self {
        Self {
            request,
            column: column.into(),
            sort_column: sort_column.into(),
        }
    }

    /// Pack ordered `(value, rows)` pairs into chunks.
    ///
    /// A boundary is forced before a value when adding its rows would push the
    /// chunk past `batch_size * 1.2`, or when the chunk already holds the
    /// maximum number of `IN` list values.
    pub fn plan(&self, value_counts: &[(String, i64)]) -> Vec<ChunkDescriptor> {
        let row_limit = self.request.batch_size as f64 * GROUPED_ROW_TOLERANCE;

        let mut chunks = Vec::new();
        let mut values: Vec<String> = Vec::new();
        let mut rows: i64 = 0;

        for (value, count) in value_counts {
            let over_rows = rows > 0 && (rows + count) as f64 > row_limit;
            let over_values = values.len() >= MAX_IN_LIST_VALUES;
            if !values.is_empty() && (over_rows || over_values) {
                chunks.push(self.chunk(chunks.len() as i32, std::mem::take(&mut values), rows));
                rows = 0;
            }
            values.push(value.clone());
            rows += count;
        }
        if !values.is_empty() {
            chunks.push(self.chunk(chunks.len() as i32, values, rows));
        }
        chunks
    }

    fn chunk(&self, chunk_id: i32, values: Vec<String>, rows: i64) -> ChunkDescriptor {
        let list = values
            .iter()
            .map(|v| quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        ChunkDescriptor {
            chunk_id,
            filter: self
                .request
                .and(&format!("{} IN ({})", quote_ident(&self.column), list)),
            estimated_rows: rows,
            use_copy_mode: None,
            metadata: ChunkMetadata::GroupedValues {
                id_column: self.column.clone(),
                value_count: values.len(),
                values,
            },
        }
    }
}

#[async_trait]
impl ChunkingStrategy for GroupedValuesStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GroupedValues
    }

    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>> {
        let counts = source
            .value_counts(
                &self.request.table,
                &self.column,
                &self.sort_column,
                &self.request.filter,
            )
            .await?;
        let mut chunks = self.plan(&counts);
        let nulls = count_null_rows(source, &self.request.table, &self.request.filter, &self.column)
            .await?;
        if nulls > 0 {
            chunks.push(null_partition_chunk(
                &self.request.filter,
                &self.column,
                chunks.len() as i32,
                nulls,
                StrategyKind::GroupedValues,
            ));
        }
        info!(
            "{}: {} distinct values of {} ({} NULL rows) -> {} chunks",
            self.request.table.full_name(),
            counts.len(),
            self.column,
            nulls,
            chunks.len()
        );
        Ok(chunks)
    }
}
