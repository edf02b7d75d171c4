use async_trait::async_trait;

use super::{ChunkDescriptor, ChunkMetadata, ChunkRequest, ChunkingStrategy, StrategyKind};
use crate::error::Result;
use crate::source::SourceReader;

/// One chunk covering the whole filtered table.
pub struct SingleChunkStrategy {
    request: ChunkRequest,
}

impl SingleChunkStrategy {
    pub fn new(request: ChunkRequest) -> Self {
        Self { request }
    }
}

#[async_trait]
impl ChunkingStrategy for SingleChunkStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Single
    }

    async fn create_chunks(&self, source: &dyn SourceReader) -> Result<Vec<ChunkDescriptor>> {
        let total = source
            .count_rows(&self.request.table, &self.request.filter)
            .await?;
        Ok(vec![ChunkDescriptor {
            chunk_id: 0,
            filter: self.request.filter.clone(),
            estimated_rows: total,
            use_copy_mode: None,
            metadata: ChunkMetadata::Single,
        }])
    }
}
