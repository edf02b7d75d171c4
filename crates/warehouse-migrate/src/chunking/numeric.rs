//! Equal-width id bands over a numeric partition column.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    div_ceil, null_partition_chunk, ChunkDescriptor, ChunkMetadata, ChunkRequest,
    ChunkingStrategy, StrategyKind,
};
use crate::error::Result;
use crate::pg::quote_ident;
use crate::source::{is_text_type, SourceReader};

pub struct NumericRangeStrategy {
    request: ChunkRequest,
    column: String,
}

impl NumericRangeStrategy {
    pub fn new(request: ChunkRequest, column: impl Into<String>) -> Self {
        Self {
            request,
            column: column.into(),
        }
    }

    /// Split `[min, max]` into `ceil(total / batch)` bands. The last band absorbs the remainder.
    pub fn plan(&self, column_expr: &str, min: i64, max: i64, total: i64) -> Vec<ChunkDescriptor> {
        if total <= 0 || max < min {
            return Vec::new();
        }

        let batch = self.request.batch_size as i64;
        let num_chunks = div_ceil(total, batch).max(1);

        // Band arithmetic in i128: the width of [i64::MIN, i64::MAX] does not fit in i64.
        let (min_w, max_w) = (i128::from(min), i128::from(max));
        let parts = i128::from(num_chunks);
        let step = ((max_w - min_w + parts) / parts).max(1);

        let mut chunks = Vec::with_capacity(num_chunks as usize);
        for i in 0..num_chunks {
            let lo_w = min_w + i128::from(i) * step;
            if lo_w > max_w {
                break;
            }
            let is_last = i == num_chunks - 1;
            let hi_w = if is_last {
                max_w
            } else {
                (lo_w + step - 1).min(max_w)
            };
            // Both lie within [min, max].
            let (lo, hi) = (lo_w as i64, hi_w as i64);
            let estimated_rows = if is_last {
                (total - batch * i).max(0)
            } else {
                batch
            };

            chunks.push(ChunkDescriptor {
                chunk_id: i as i32,
                filter: self.request.and(&format!(
                    "{e} >= {} AND {e} <= {}",
                    lo,
                    hi,
                    e = column_expr
                )),
                estimated_rows,
                use_copy_mode: None,
                metadata: ChunkMetadata::NumericRange {
                    id_column: self.column.clone(),
                    min_id: lo,
                    max_id: hi,
                },
            });
        }
        chunks
    }
}

#[async_trait]
impl ChunkingStrategy for NumericRangeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NumericRange
    }

    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>> {
        let quoted = quote_ident(&self.column);

        // A numeric id stored as text must be cast, or MIN/MAX and the band
        // comparisons would order lexicographically.
        let stored_type = source.column_type(&self.request.table, &self.column).await?;
        let column_expr = match stored_type.as_deref() {
            Some(t) if is_text_type(t) => {
                debug!(
                    "{}: {} stored as {}, casting to bigint",
                    self.request.table.full_name(),
                    self.column,
                    t
                );
                format!("CAST({} AS BIGINT)", quoted)
            }
            _ => quoted,
        };

        let bounds = source
            .numeric_bounds(&self.request.table, &column_expr, &self.request.filter)
            .await?;
        if bounds.total == 0 {
            info!("{}: no rows match filter", self.request.table.full_name());
            return Ok(Vec::new());
        }

        let mut chunks = match bounds.range {
            Some((min, max)) => {
                let chunks = self.plan(&column_expr, min, max, bounds.rows);
                info!(
                    "{}: numeric range {}..={} ({} rows) -> {} chunks",
                    self.request.table.full_name(),
                    min,
                    max,
                    bounds.rows,
                    chunks.len()
                );
                chunks
            }
            None => Vec::new(),
        };

        let nulls = bounds.null_rows();
        if nulls > 0 {
            info!(
                "{}: {} rows with NULL {} -> 1 chunk",
                self.request.table.full_name(),
                nulls,
                self.column
            );
            chunks.push(null_partition_chunk(
                &self.request.filter,
                &self.column,
                chunks.len() as i32,
                nulls,
                StrategyKind::NumericRange,
            ));
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::testing::{request, StatsSource};
    use crate::source::NumericBounds;

    fn bounds(chunks: &[ChunkDescriptor]) -> Vec<(i64, i64)> {
        chunks
            .iter()
            .filter_map(|c| match c.metadata {
                ChunkMetadata::NumericRange { min_id, max_id, .. } => Some((min_id, max_id)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_three_bands_for_24500_rows() {
        let strategy = NumericRangeStrategy::new(request(10_000), "id");
        let chunks = strategy.plan("\"id\"", 1, 25_000, 24_500);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            bounds(&chunks),
            vec![(1, 8_334), (8_335, 16_668), (16_669, 25_000)]
        );
        let estimates: Vec<_> = chunks.iter().map(|c| c.estimated_rows).collect();
        assert_eq!(estimates, vec![10_000, 10_000, 4_500]);
        assert_eq!(
            chunks[0].filter,
            "(1=1) AND \"id\" >= 1 AND \"id\" <= 8334"
        );
    }

    #[test]
    fn test_bands_are_disjoint_and_cover_range() {
        let strategy = NumericRangeStrategy::new(request(7), "id");
        for (min, max, total) in [(1, 100, 100), (-50, 50, 13), (10, 10, 1), (0, 1_000_003, 64)] {
            let b = bounds(&strategy.plan("\"id\"", min, max, total));
            assert_eq!(b.first().unwrap().0, min);
            assert_eq!(b.last().unwrap().1, max);
            for pair in b.windows(2) {
                assert_eq!(pair[0].1 + 1, pair[1].0);
            }
        }
    }

    #[test]
    fn test_sparse_range_stops_early() {
        // More chunks requested than distinct ids available.
        let strategy = NumericRangeStrategy::new(request(1), "id");
        let b = bounds(&strategy.plan("\"id\"", 1, 3, 10));
        assert_eq!(b, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_empty_table() {
        let strategy = NumericRangeStrategy::new(request(100), "id");
        assert!(strategy.plan("\"id\"", 0, 0, 0).is_empty());
    }

    #[tokio::test]
    async fn test_text_column_is_cast() {
        let source = StatsSource {
            bounds: NumericBounds {
                range: Some((1, 20)),
                rows: 20,
                total: 20,
            },
            column_type: Some("character varying".into()),
            ..Default::default()
        };
        let chunks = NumericRangeStrategy::new(request(10), "id")
            .create_chunks(&source)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].filter.contains("CAST(\"id\" AS BIGINT) >= 1"));
        let seen = source.seen_filters.lock().unwrap();
        assert!(seen[0].starts_with("CAST(\"id\" AS BIGINT)"));
    }

    #[tokio::test]
    async fn test_no_rows_yields_no_chunks() {
        let source = StatsSource::default();
        let chunks = NumericRangeStrategy::new(request(10), "id")
            .create_chunks(&source)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_bands_near_integer_limits() {
        let strategy = NumericRangeStrategy::new(request(10), "id");
        let b = bounds(&strategy.plan("\"id\"", i64::MIN, i64::MAX, 30));
        assert_eq!(b.len(), 3);
        assert_eq!(b.first().unwrap().0, i64::MIN);
        assert_eq!(b.last().unwrap().1, i64::MAX);
        for pair in b.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }

        let strategy = NumericRangeStrategy::new(request(2), "id");
        let b = bounds(&strategy.plan("\"id\"", i64::MAX - 5, i64::MAX, 6));
        assert_eq!(
            b,
            vec![
                (i64::MAX - 5, i64::MAX - 4),
                (i64::MAX - 3, i64::MAX - 2),
                (i64::MAX - 1, i64::MAX)
            ]
        );
    }

    #[tokio::test]
    async fn test_null_ids_get_trailing_chunk() {
        let source = StatsSource {
            bounds: NumericBounds {
                range: Some((1, 20)),
                rows: 20,
                total: 23,
            },
            ..Default::default()
        };
        let chunks = NumericRangeStrategy::new(request(10), "id")
            .create_chunks(&source)
            .await
            .unwrap();

        assert_eq!(bounds(&chunks), vec![(1, 10), (11, 20)]);
        let last = chunks.last().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(last.chunk_id, 2);
        assert_eq!(last.filter, "(1=1) AND \"id\" IS NULL");
        assert_eq!(last.estimated_rows, 3);
        assert_eq!(last.strategy(), StrategyKind::NumericRange);
    }

    #[tokio::test]
    async fn test_all_null_ids_yield_only_null_chunk() {
        let source = StatsSource {
            bounds: NumericBounds {
                range: None,
                rows: 0,
                total: 4,
            },
            ..Default::default()
        };
        let chunks = NumericRangeStrategy::new(request(10), "id")
            .create_chunks(&source)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0].metadata,
            ChunkMetadata::NullPartition { .. }
        ));
    }
}
