//! LIMIT/OFFSET windows, the fallback strategy.
//!
//! Window boundaries are computed from a row count taken at planning time.
//! Rows inserted or deleted in the source between planning and execution
//! shift later windows, so rows can be skipped or fetched twice at chunk
//! boundaries. This is the weakest of the strategies and is only selected
//! when no other applies.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{div_ceil, ChunkDescriptor, ChunkMetadata, ChunkRequest, ChunkingStrategy, StrategyKind};
use crate::error::Result;
use crate::source::SourceReader;

pub struct OffsetStrategy {
    request: ChunkRequest,
    sort_column: String,
}

impl OffsetStrategy {
    pub fn new(request: ChunkRequest, sort_column: impl Into<String>) -> Self {
        Self {
            request,
            sort_column: sort_column.into(),
        }
    }

    pub fn plan(&self, total: i64) -> Vec<ChunkDescriptor> {
        let batch = self.request.batch_size as i64;
        (0..div_ceil(total, batch))
            .map(|i| {
                let offset = i * batch;
                ChunkDescriptor {
                    chunk_id: i as i32,
                    filter: self.request.filter.clone(),
                    estimated_rows: batch.min(total - offset),
                    use_copy_mode: None,
                    metadata: ChunkMetadata::OffsetBased {
                        sort_column: self.sort_column.clone(),
                        offset,
                        limit: batch,
                    },
                }
            })
            .collect()
    }
}

#[async_trait]
impl ChunkingStrategy for OffsetStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OffsetBased
    }

    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>> {
        let total = source
            .count_rows(&self.request.table, &self.request.filter)
            .await?;
        let chunks = self.plan(total);
        if chunks.len() > 1 {
            warn!(
                "{}: using OFFSET chunking on {}; concurrent source changes can shift chunk boundaries",
                self.request.table.full_name(),
                self.sort_column
            );
        }
        info!(
            "{}: {} rows -> {} offset chunks",
            self.request.table.full_name(),
            total,
            chunks.len()
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::testing::{request, StatsSource};

    #[test]
    fn test_windows() {
        let strategy = OffsetStrategy::new(request(1_000), "created");
        let chunks = strategy.plan(2_500);
        let windows: Vec<_> = chunks.iter().map(|c| c.page().unwrap()).collect();
        let sort = vec!["created".to_string()];
        assert_eq!(
            windows,
            vec![
                (sort.clone(), 0, 1_000),
                (sort.clone(), 1_000, 1_000),
                (sort, 2_000, 1_000)
            ]
        );
        let estimates: Vec<_> = chunks.iter().map(|c| c.estimated_rows).collect();
        assert_eq!(estimates, vec![1_000, 1_000, 500]);
        assert!(chunks.iter().all(|c| c.filter == "1=1"));
    }

    #[tokio::test]
    async fn test_empty_table_has_no_windows() {
        let source = StatsSource::default();
        let chunks = OffsetStrategy::new(request(10), "created")
            .create_chunks(&source)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }
}
