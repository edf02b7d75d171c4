//! Calendar-date grouping, with LIMIT/OFFSET paging for oversized dates.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    count_null_rows, div_ceil, null_partition_chunk, ChunkDescriptor, ChunkMetadata,
    ChunkRequest, ChunkingStrategy, StrategyKind,
};
use crate::error::Result;
use crate::pg::{quote_ident, quote_literal};
use crate::source::SourceReader;

pub struct DateRangeStrategy {
    request: ChunkRequest,
    column: String,
    uniqueness_columns: Vec<String>,
    watermark_filter: Option<String>,
}

impl DateRangeStrategy {
    pub fn new(
        request: ChunkRequest,
        column: impl Into<String>,
        uniqueness_columns: Vec<String>,
    ) -> Self {
        Self {
            request,
            column: column.into(),
            uniqueness_columns,
            watermark_filter: None,
        }
    }

    /// Restrict planning to rows past the target's high-water mark.
    pub fn with_watermark_filter(mut self, filter: Option<String>) -> Self {
        self.watermark_filter = filter;
        self
    }

    fn base_filter(&self) -> String {
        match &self.watermark_filter {
            Some(wm) => self.request.and(wm),
            None => self.request.filter.clone(),
        }
    }

    fn date_expr(&self) -> String {
        format!("{}::date", quote_ident(&self.column))
    }

    /// Pack ordered `(date, rows)` pairs into chunks of at most `batch_size`
    /// rows. A date that alone exceeds `batch_size` is paged.
    pub fn plan(&self, date_counts: &[(String, i64)]) -> Vec<ChunkDescriptor> {
        let base = self.base_filter();
        let batch = self.request.batch_size as i64;

        let mut chunks = Vec::new();
        let mut dates: Vec<String> = Vec::new();
        let mut rows: i64 = 0;

        for (date, count) in date_counts {
            if *count > batch {
                if !dates.is_empty() {
                    let id = chunks.len() as i32;
                    chunks.push(self.group_chunk(&base, id, std::mem::take(&mut dates), rows));
                    rows = 0;
                }
                self.push_pages(&base, &mut chunks, date, *count);
                continue;
            }

            if !dates.is_empty() && rows + count > batch {
                let id = chunks.len() as i32;
                chunks.push(self.group_chunk(&base, id, std::mem::take(&mut dates), rows));
                rows = 0;
            }
            dates.push(date.clone());
            rows += count;
        }
        if !dates.is_empty() {
            let id = chunks.len() as i32;
            chunks.push(self.group_chunk(&base, id, dates, rows));
        }
        chunks
    }

    fn group_chunk(&self, base: &str, chunk_id: i32, dates: Vec<String>, rows: i64) -> ChunkDescriptor {
        let predicate = if dates.len() == 1 {
            format!("{} = {}", self.date_expr(), quote_literal(&dates[0]))
        } else {
            let list = dates
                .iter()
                .map(|d| quote_literal(d))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} IN ({})", self.date_expr(), list)
        };
        ChunkDescriptor {
            chunk_id,
            filter: format!("({}) AND {}", base, predicate),
            estimated_rows: rows,
            use_copy_mode: None,
            metadata: ChunkMetadata::DateRange {
                date_column: self.column.clone(),
                dates,
            },
        }
    }

    fn push_pages(&self, base: &str, chunks: &mut Vec<ChunkDescriptor>, date: &str, count: i64) {
        let batch = self.request.batch_size as i64;
        let pages = div_ceil(count, batch);

        if self.uniqueness_columns.is_empty() {
            warn!(
                "{}: date {} has {} rows and is paged without a uniqueness key; \
                 pages ordered only by {} may overlap or skip rows",
                self.request.table.full_name(),
                date,
                count,
                self.column
            );
        }

        let mut order_columns = vec![self.column.clone()];
        order_columns.extend(
            self.uniqueness_columns
                .iter()
                .filter(|c| **c != self.column)
                .cloned(),
        );

        let filter = format!("({}) AND {} = {}", base, self.date_expr(), quote_literal(date));
        for page in 0..pages {
            let offset = page * batch;
            chunks.push(ChunkDescriptor {
                chunk_id: chunks.len() as i32,
                filter: filter.clone(),
                estimated_rows: batch.min(count - offset),
                use_copy_mode: None,
                metadata: ChunkMetadata::DateRangeOffset {
                    date_column: self.column.clone(),
                    date_value: date.to_string(),
                    offset,
                    limit: batch,
                    sub_chunk_index: page as usize,
                    total_sub_chunks: pages as usize,
                    order_columns: order_columns.clone(),
                },
            });
        }
    }
}

#[async_trait]
impl ChunkingStrategy for DateRangeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DateRange
    }

    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>> {
        let base = self.base_filter();
        let counts = source
            .date_counts(&self.request.table, &self.column, &base)
            .await?;
        let mut chunks = self.plan(&counts);
        let nulls = count_null_rows(source, &self.request.table, &base, &self.column).await?;
        if nulls > 0 {
            info!(
                "{}: {} rows with NULL {} -> 1 chunk",
                self.request.table.full_name(),
                nulls,
                self.column
            );
            chunks.push(null_partition_chunk(
                &base,
                &self.column,
                chunks.len() as i32,
                nulls,
                StrategyKind::DateRange,
            ));
        }
        info!(
            "{}: {} distinct dates of {}{} -> {} chunks",
            self.request.table.full_name(),
            counts.len(),
            self.column,
            if self.watermark_filter.is_some() {
                " (incremental)"
            } else {
                ""
            },
            chunks.len()
        );
        Ok(chunks)
    }
}
