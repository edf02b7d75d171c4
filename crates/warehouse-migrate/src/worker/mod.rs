//! Chunk execution.
//!
//! A [`MigrationWorker`] takes one [`ChunkDescriptor`], fetches its rows from
//! the warehouse and writes them to the target, returning the number of rows
//! actually persisted. Everything the worker needs is handed to it in a
//! [`WorkerContext`] built once per table by the orchestrator, including the
//! initial-full-load flag, so concurrent workers of a table never disagree
//! about load mode.
//!
//! Load failures are reduced to a [`LoadOutcome`] and resolved by a fixed
//! ladder:
//!
//! - uniqueness conflict on bulk copy: discard under insert-only mode,
//!   otherwise merge the same rows
//! - key collision caused by a lagging sequence: advance it and retry once
//! - memory pressure: re-read the chunk in ordered pages of shrinking size
//! - transient: retried by [`RetryPolicy`]

mod retry;

pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::chunking::ChunkDescriptor;
use crate::config::TableConfig;
use crate::error::{ErrorKind, MigrateError, Result};
use crate::pg::{quote_ident, quote_literal};
use crate::source::{RowBatch, SourceReader, SourceTable};
use crate::target::{MergeSpec, TargetSession, TargetTable, TargetWriter};

/// A source column and the target column it is loaded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

/// Pair source columns with target columns of the same name.
///
/// Exact matches win; otherwise names are compared case-insensitively, since
/// warehouses commonly fold identifiers to upper case. Columns present on
/// only one side are left out.
pub fn map_columns(source: &[String], target: &[String]) -> Vec<ColumnMapping> {
    target
        .iter()
        .filter_map(|t| {
            source
                .iter()
                .find(|s| *s == t)
                .or_else(|| source.iter().find(|s| s.eq_ignore_ascii_case(t)))
                .map(|s| ColumnMapping {
                    source: s.clone(),
                    target: t.clone(),
                })
        })
        .collect()
}

/// How a batch is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// COPY append, no conflict handling.
    Copy,
    /// Staged upsert on the uniqueness key.
    Merge,
}

/// Result of one fetch-and-load step.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(u64),
    MemoryPressure(MigrateError),
    Conflict(MigrateError),
    SequenceCollision(MigrateError),
    Failed(MigrateError),
}

impl LoadOutcome {
    /// Classify a raw load result. `loaded_columns` are the target columns
    /// the statement supplied: a conflict on a key the statement did not
    /// supply can only come from a column default, i.e. a sequence.
    pub fn classify(result: Result<u64>, loaded_columns: &[String]) -> Self {
        let e = match result {
            Ok(n) => return LoadOutcome::Loaded(n),
            Err(e) => e,
        };
        match e.kind() {
            ErrorKind::MemoryPressure => LoadOutcome::MemoryPressure(e),
            ErrorKind::SequenceCollision => LoadOutcome::SequenceCollision(e),
            ErrorKind::Conflict => {
                let keys = e.conflict_key_columns();
                if !keys.is_empty() && keys.iter().all(|k| !loaded_columns.contains(k)) {
                    LoadOutcome::SequenceCollision(e)
                } else {
                    LoadOutcome::Conflict(e)
                }
            }
            _ => LoadOutcome::Failed(e),
        }
    }

    pub fn into_result(self) -> Result<u64> {
        match self {
            LoadOutcome::Loaded(n) => Ok(n),
            LoadOutcome::MemoryPressure(e)
            | LoadOutcome::Conflict(e)
            | LoadOutcome::SequenceCollision(e)
            | LoadOutcome::Failed(e) => Err(e),
        }
    }
}

/// Everything a worker needs for one table.
pub struct WorkerContext {
    pub source: Arc<dyn SourceReader>,
    pub target: Arc<dyn TargetWriter>,
    pub source_table: SourceTable,
    pub target_table: TargetTable,
    pub table: TableConfig,
    /// Columns loaded, in target order.
    pub columns: Vec<ColumnMapping>,
    /// Target was empty with no watermark when the table started.
    pub initial_full_load: bool,
    /// Target was truncated at the start of this run.
    pub target_truncated: bool,
    /// Target high-water mark looked up once for chunks that cannot scope it.
    pub global_watermark: Option<String>,
    pub retry: RetryPolicy,
    /// Page sizes tried, largest first, after memory pressure.
    pub sub_batch_sizes: Vec<usize>,
    /// Log prefix, `source.table`.
    pub label: String,
}

/// Executes chunks of one table. Shared between tasks through an `Arc`.
pub struct MigrationWorker {
    ctx: WorkerContext,
    target_columns: Vec<String>,
}

impl MigrationWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let target_columns = ctx.columns.iter().map(|c| c.target.clone()).collect();
        Self {
            ctx,
            target_columns,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Fetch and load one chunk. Returns rows persisted.
    pub async fn process_chunk(&self, chunk: &ChunkDescriptor) -> Result<u64> {
        let prefix = format!("{} chunk {}", self.ctx.label, chunk.chunk_id);
        let watermark = self.resolve_watermark(chunk).await;
        let mode = self.load_mode(chunk);
        debug!(
            "{}: mode {:?}, watermark {:?}, ~{} rows",
            prefix, mode, watermark, chunk.estimated_rows
        );

        let this = self;
        let wm = watermark.as_deref();
        let label = prefix.as_str();
        let mut retries = 0u32;
        let rows = self
            .ctx
            .retry
            .run(
                &prefix,
                move || this.attempt(chunk, wm, label),
                |_| retries += 1,
            )
            .await?;

        if retries > 0 {
            info!("{}: succeeded after {} retries", prefix, retries);
        }
        debug!("{}: {} rows", prefix, rows);
        Ok(rows)
    }

    /// Load mode for a chunk.
    ///
    /// Tables without a uniqueness key can only be appended to. Otherwise a
    /// precomputed per-chunk decision wins, then a truncated or empty target
    /// allows bulk copy, and anything else merges.
    pub fn load_mode(&self, chunk: &ChunkDescriptor) -> LoadMode {
        if self.ctx.table.uniqueness_columns.is_empty() {
            return LoadMode::Copy;
        }
        match chunk.use_copy_mode {
            Some(true) => LoadMode::Copy,
            Some(false) => LoadMode::Merge,
            None if self.ctx.target_truncated || self.ctx.initial_full_load => LoadMode::Copy,
            None => LoadMode::Merge,
        }
    }

    /// Target high-water mark used to narrow the fetch.
    ///
    /// Chunks whose filter bounds the key space look up the mark within
    /// their own scope. Paged chunks share the mark computed once for the
    /// table: their windows are positions in one ordered row set, and every
    /// page must see that set filtered the same way.
    async fn resolve_watermark(&self, chunk: &ChunkDescriptor) -> Option<String> {
        if self.ctx.initial_full_load || self.ctx.target_truncated {
            return None;
        }
        self.ctx.table.source_watermark.as_ref()?;
        let target_wm = self.ctx.table.target_watermark.as_deref()?;

        let scoped = chunk.is_key_scoped()
            && chunk.page().is_none()
            && chunk
                .partition_column()
                .map(|c| self.ctx.columns.iter().any(|m| m.target == c))
                .unwrap_or(false);
        if !scoped {
            return self.ctx.global_watermark.clone();
        }

        let scope = chunk.target_scope();
        match self
            .ctx
            .target
            .max_watermark(&self.ctx.target_table, target_wm, scope.as_deref())
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "{} chunk {}: watermark lookup failed, fetching unfiltered: {}",
                    self.ctx.label, chunk.chunk_id, e
                );
                None
            }
        }
    }

    /// One try at a chunk. Every write of the attempt shares one target
    /// session; a retry opens a fresh one.
    async fn attempt(
        &self,
        chunk: &ChunkDescriptor,
        watermark: Option<&str>,
        prefix: &str,
    ) -> Result<u64> {
        let session = self.ctx.target.session().await?;
        let session = session.as_ref();
        let window = chunk
            .page()
            .map(|(order, offset, limit)| (self.source_order(&order), offset, limit));
        let query = self.build_query(chunk, watermark, window.as_ref());

        let outcome = match self.ctx.source.fetch(&query).await {
            Ok(batch) if batch.is_empty() => LoadOutcome::Loaded(0),
            Ok(batch) => self.load_batch(session, chunk, &batch).await,
            Err(e) => LoadOutcome::classify(Err(e), &self.target_columns),
        };

        match outcome {
            LoadOutcome::MemoryPressure(e) => {
                warn!("{}: memory pressure, switching to sub-batches: {}", prefix, e);
                self.load_in_sub_batches(session, chunk, watermark, prefix, e)
                    .await
            }
            other => other.into_result(),
        }
    }

    /// Source-side SELECT for a chunk, optionally windowed.
    pub fn build_query(
        &self,
        chunk: &ChunkDescriptor,
        watermark: Option<&str>,
        window: Option<&(Vec<String>, i64, i64)>,
    ) -> String {
        let select = self
            .ctx
            .columns
            .iter()
            .map(|m| format!("{}::text AS {}", quote_ident(&m.source), quote_ident(&m.target)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM {} WHERE ({})",
            select,
            self.ctx.source_table.qualified(),
            chunk.filter
        );
        if let (Some(wm), Some(column)) = (watermark, self.ctx.table.source_watermark.as_deref()) {
            sql.push_str(&format!(" AND {} > {}", quote_ident(column), quote_literal(wm)));
        }
        if let Some((order, offset, limit)) = window {
            if !order.is_empty() {
                let order = order.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
                sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
            }
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
        }
        sql
    }

    /// Write one fetched batch, resolving conflicts.
    async fn load_batch(
        &self,
        session: &dyn TargetSession,
        chunk: &ChunkDescriptor,
        batch: &RowBatch,
    ) -> LoadOutcome {
        let table = &self.ctx.target_table;
        match self.load_mode(chunk) {
            LoadMode::Copy => {
                let outcome = self
                    .with_sequence_heal(session, || session.copy_rows(table, batch))
                    .await;
                match outcome {
                    LoadOutcome::Conflict(e) => {
                        self.resolve_copy_conflict(session, batch, e).await
                    }
                    other => other,
                }
            }
            LoadMode::Merge => {
                let keys = &self.ctx.table.uniqueness_columns;
                self.with_sequence_heal(session, || self.merge(session, batch, keys))
                    .await
            }
        }
    }

    async fn resolve_copy_conflict(
        &self,
        session: &dyn TargetSession,
        batch: &RowBatch,
        cause: MigrateError,
    ) -> LoadOutcome {
        if self.ctx.table.insert_only_mode {
            warn!(
                "{}: bulk copy of {} rows hit existing keys; insert-only mode discards the batch, 0 rows inserted",
                self.ctx.label,
                batch.len()
            );
            return LoadOutcome::Loaded(0);
        }

        let keys = if self.ctx.table.uniqueness_columns.is_empty() {
            cause.conflict_key_columns()
        } else {
            self.ctx.table.uniqueness_columns.clone()
        };
        if keys.is_empty() {
            return LoadOutcome::Failed(cause);
        }

        info!(
            "{}: bulk copy hit existing keys, merging on ({})",
            self.ctx.label,
            keys.join(", ")
        );
        self.with_sequence_heal(session, || self.merge(session, batch, &keys))
            .await
    }

    async fn merge(
        &self,
        session: &dyn TargetSession,
        batch: &RowBatch,
        keys: &[String],
    ) -> Result<u64> {
        let spec = MergeSpec {
            key_columns: keys,
            watermark: self.ctx.table.target_watermark.as_deref(),
            insert_only: self.ctx.table.insert_only_mode,
        };
        session
            .upsert_rows(&self.ctx.target_table, batch, spec)
            .await
    }

    /// Run a load; on a sequence collision advance the sequence and run it once more.
    async fn with_sequence_heal<F, Fut>(
        &self,
        session: &dyn TargetSession,
        mut load: F,
    ) -> LoadOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let e = match LoadOutcome::classify(load().await, &self.target_columns) {
            LoadOutcome::SequenceCollision(e) => e,
            other => return other,
        };

        let keys = e.conflict_key_columns();
        warn!(
            "{}: key collision on ({}) not supplied by the load, advancing sequence",
            self.ctx.label,
            keys.join(", ")
        );
        match session
            .reset_sequence(&self.ctx.target_table, &keys)
            .await
        {
            Ok(true) => {}
            Ok(false) => return LoadOutcome::Failed(e),
            Err(reset_err) => {
                error!("{}: sequence reset failed: {}", self.ctx.label, reset_err);
                return LoadOutcome::Failed(e);
            }
        }

        match LoadOutcome::classify(load().await, &self.target_columns) {
            LoadOutcome::SequenceCollision(e) => LoadOutcome::Failed(e),
            other => other,
        }
    }

    /// Re-read the chunk in ordered pages, shrinking the page size each time
    /// memory runs out. Progress carries over between sizes.
    async fn load_in_sub_batches(
        &self,
        session: &dyn TargetSession,
        chunk: &ChunkDescriptor,
        watermark: Option<&str>,
        prefix: &str,
        cause: MigrateError,
    ) -> Result<u64> {
        let order = self.sub_batch_order(chunk);
        if order.is_empty() {
            warn!(
                "{}: no uniqueness or partition column to order sub-batches by; pages may overlap or miss rows",
                prefix
            );
        }
        let (base_offset, window) = match chunk.page() {
            Some((_, offset, limit)) => (offset, Some(limit)),
            None => (0, None),
        };

        let mut progress = SubBatchProgress::default();
        let mut last_error = cause;
        for &size in &self.ctx.sub_batch_sizes {
            let size = size.max(1) as i64;
            match self
                .drain_pages(
                    session,
                    chunk,
                    watermark,
                    &order,
                    base_offset,
                    window,
                    size,
                    &mut progress,
                )
                .await
            {
                Ok(()) => {
                    info!(
                        "{}: completed in sub-batches of {} ({} rows)",
                        prefix, size, progress.loaded
                    );
                    return Ok(progress.loaded);
                }
                Err(e) if e.kind() == ErrorKind::MemoryPressure => {
                    warn!(
                        "{}: sub-batch size {} ran out of memory after {} rows",
                        prefix, size, progress.fetched
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        error!("{}: memory pressure at every sub-batch size", prefix);
        Err(last_error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_pages(
        &self,
        session: &dyn TargetSession,
        chunk: &ChunkDescriptor,
        watermark: Option<&str>,
        order: &[String],
        base_offset: i64,
        window: Option<i64>,
        size: i64,
        progress: &mut SubBatchProgress,
    ) -> Result<()> {
        loop {
            let limit = match window {
                Some(w) => size.min(w - progress.fetched),
                None => size,
            };
            if limit <= 0 {
                return Ok(());
            }

            let page = (order.to_vec(), base_offset + progress.fetched, limit);
            let query = self.build_query(chunk, watermark, Some(&page));
            let batch = self.ctx.source.fetch(&query).await?;
            let fetched = batch.len() as i64;
            if fetched == 0 {
                return Ok(());
            }

            let loaded = self.load_batch(session, chunk, &batch).await.into_result()?;
            progress.fetched += fetched;
            progress.loaded += loaded;
            if fetched < limit {
                return Ok(());
            }
        }
    }

    /// Deterministic order for sub-batch pages, as source column names.
    fn sub_batch_order(&self, chunk: &ChunkDescriptor) -> Vec<String> {
        if let Some((order, _, _)) = chunk.page() {
            return self.source_order(&order);
        }
        if !self.ctx.table.uniqueness_columns.is_empty() {
            return self.source_order(&self.ctx.table.uniqueness_columns);
        }
        chunk
            .partition_column()
            .map(|c| vec![c.to_string()])
            .unwrap_or_default()
    }

    /// Translate target column names to their source counterparts.
    fn source_order(&self, columns: &[String]) -> Vec<String> {
        columns
            .iter()
            .map(|c| {
                self.ctx
                    .columns
                    .iter()
                    .find(|m| &m.target == c)
                    .map(|m| m.source.clone())
                    .unwrap_or_else(|| c.clone())
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct SubBatchProgress {
    fetched: i64,
    loaded: u64,
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::chunking::{null_partition_chunk, ChunkMetadata, StrategyKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn worker(
        source: Arc<FakeSource>,
        target: Arc<FakeTarget>,
        table: TableConfig,
        initial_full_load: bool,
    ) -> MigrationWorker {
        let names = vec!["id".to_string(), "note".to_string(), "updated_at".to_string()];
        MigrationWorker::new(WorkerContext {
            source,
            target,
            source_table: SourceTable::new("ANALYTICS", "EVENTS"),
            target_table: TargetTable::new("analytics", "events"),
            table,
            columns: map_columns(&names, &names),
            initial_full_load,
            target_truncated: false,
            global_watermark: Some("2023-12-31".into()),
            retry: RetryPolicy::immediate(3),
            sub_batch_sizes: vec![10, 5, 2],
            label: "analytics.EVENTS".into(),
        })
    }

    fn numeric_chunk(lo: i64, hi: i64) -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_id: 0,
            filter: format!("(1=1) AND \"id\" >= {} AND \"id\" <= {}", lo, hi),
            estimated_rows: hi - lo + 1,
            use_copy_mode: None,
            metadata: ChunkMetadata::NumericRange {
                id_column: "id".into(),
                min_id: lo,
                max_id: hi,
            },
        }
    }

    fn single_chunk() -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_id: 0,
            filter: "1=1".into(),
            estimated_rows: 0,
            use_copy_mode: None,
            metadata: ChunkMetadata::Single,
        }
    }

    #[test]
    fn test_map_columns_folds_case() {
        let source = vec!["ID".to_string(), "NOTE".to_string(), "EXTRA".to_string()];
        let target = vec!["id".to_string(), "note".to_string(), "loaded_at".to_string()];
        let mapped = map_columns(&source, &target);
        assert_eq!(
            mapped,
            vec![
                ColumnMapping {
                    source: "ID".into(),
                    target: "id".into()
                },
                ColumnMapping {
                    source: "NOTE".into(),
                    target: "note".into()
                },
            ]
        );
    }

    #[test]
    fn test_load_mode_selection() {
        let source = Arc::new(FakeSource::with_rows(0));
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target.clone(), table_config(), false);
        let mut chunk = numeric_chunk(1, 10);
        assert_eq!(w.load_mode(&chunk), LoadMode::Merge);
        chunk.use_copy_mode = Some(true);
        assert_eq!(w.load_mode(&chunk), LoadMode::Copy);

        let w = worker(source.clone(), target.clone(), table_config(), true);
        assert_eq!(w.load_mode(&numeric_chunk(1, 10)), LoadMode::Copy);

        let mut no_key = table_config();
        no_key.uniqueness_columns.clear();
        let w = worker(source, target, no_key, false);
        let mut chunk = numeric_chunk(1, 10);
        chunk.use_copy_mode = Some(false);
        assert_eq!(w.load_mode(&chunk), LoadMode::Copy);
    }

    #[test]
    fn test_build_query_casts_and_windows() {
        let source = Arc::new(FakeSource::with_rows(0));
        let target = Arc::new(FakeTarget::new());
        let mut table = table_config();
        table.source_watermark = Some("updated_at".into());
        let w = worker(source, target, table, false);
        let page = (vec!["id".to_string()], 20, 10);
        let sql = w.build_query(&single_chunk(), Some("2024-01-01"), Some(&page));
        assert_eq!(
            sql,
            "SELECT \"id\"::text AS \"id\", \"note\"::text AS \"note\", \"updated_at\"::text AS \"updated_at\" \
             FROM \"ANALYTICS\".\"EVENTS\" WHERE (1=1) AND \"updated_at\" > '2024-01-01' \
             ORDER BY \"id\" LIMIT 10 OFFSET 20"
        );
    }

    #[tokio::test]
    async fn test_bulk_copy_into_empty_target() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target.clone(), table_config(), true);

        assert_eq!(w.process_chunk(&numeric_chunk(1, 3)).await.unwrap(), 3);
        assert_eq!(target.len(), 3);
        assert_eq!(target.copies.load(Ordering::SeqCst), 1);
        assert_eq!(target.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_null_partition_chunk_loads_null_rows() {
        let source = Arc::new(FakeSource::with_nullable_bucket(10, 5));
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target.clone(), table_config(), true);
        let chunk = null_partition_chunk("1=1", "bucket", 2, 2, StrategyKind::NumericRange);

        assert_eq!(w.process_chunk(&chunk).await.unwrap(), 2);
        let keys: Vec<String> = target.rows.lock().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["10".to_string(), "5".to_string()]);
        assert!(source.queries()[0].ends_with("WHERE ((1=1) AND \"bucket\" IS NULL)"));
    }

    #[tokio::test]
    async fn test_memory_pressure_converges_through_sub_batches() {
        let baseline_source = Arc::new(FakeSource::with_rows(25));
        let baseline_target = Arc::new(FakeTarget::new());
        let baseline = worker(baseline_source, baseline_target, table_config(), true)
            .process_chunk(&single_chunk())
            .await
            .unwrap();

        let mut source = FakeSource::with_rows(25);
        source.oom_above = Some(5);
        let source = Arc::new(source);
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target.clone(), table_config(), true);

        let rows = w.process_chunk(&single_chunk()).await.unwrap();
        assert_eq!(rows, baseline);
        assert_eq!(target.len(), 25);

        let queries = source.queries();
        assert!(queries.iter().any(|q| q.ends_with("ORDER BY \"id\" LIMIT 10 OFFSET 0")));
        assert!(queries.iter().any(|q| q.ends_with("ORDER BY \"id\" LIMIT 5 OFFSET 20")));
    }

    #[tokio::test]
    async fn test_memory_pressure_at_every_size_fails_the_chunk() {
        let mut source = FakeSource::with_rows(25);
        source.oom_above = Some(1);
        let source = Arc::new(source);
        let target = Arc::new(FakeTarget::new());
        let w = worker(source, target, table_config(), true);

        let err = w.process_chunk(&single_chunk()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryPressure);
    }

    #[tokio::test]
    async fn test_copy_conflict_falls_back_to_merge() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::with_keys(&["2"]));
        let w = worker(source, target.clone(), table_config(), false);
        let mut chunk = numeric_chunk(1, 3);
        chunk.use_copy_mode = Some(true);

        assert_eq!(w.process_chunk(&chunk).await.unwrap(), 3);
        assert_eq!(target.copies.load(Ordering::SeqCst), 1);
        assert_eq!(target.upserts.load(Ordering::SeqCst), 1);
        assert_eq!(target.len(), 3);
    }

    #[tokio::test]
    async fn test_insert_only_conflict_discards_batch() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::with_keys(&["2"]));
        let mut table = table_config();
        table.insert_only_mode = true;
        let w = worker(source, target.clone(), table, false);
        let mut chunk = numeric_chunk(1, 3);
        chunk.use_copy_mode = Some(true);

        assert_eq!(w.process_chunk(&chunk).await.unwrap(), 0);
        assert_eq!(target.upserts.load(Ordering::SeqCst), 0);
        assert_eq!(target.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_does_not_count_skipped_rows() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::with_keys(&["1", "2"]));
        let mut table = table_config();
        table.insert_only_mode = true;
        let w = worker(source, target.clone(), table, false);

        assert_eq!(w.process_chunk(&numeric_chunk(1, 3)).await.unwrap(), 1);
        assert_eq!(target.copies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequence_collision_heals_once() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::new());
        target.sequence_behind.store(true, Ordering::SeqCst);
        let w = worker(source, target.clone(), table_config(), true);

        assert_eq!(w.process_chunk(&numeric_chunk(1, 3)).await.unwrap(), 3);
        assert_eq!(target.sequence_resets.load(Ordering::SeqCst), 1);
        assert_eq!(target.copies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_retries() {
        let source = FakeSource::with_rows(3);
        source.transient_failures.store(10, Ordering::SeqCst);
        let source = Arc::new(source);
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target, table_config(), true);

        let err = w.process_chunk(&numeric_chunk(1, 3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(source.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_error_then_success() {
        let source = FakeSource {
            transient_failures: AtomicU32::new(1),
            ..FakeSource::with_rows(3)
        };
        let source = Arc::new(source);
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target, table_config(), true);

        assert_eq!(w.process_chunk(&numeric_chunk(1, 3)).await.unwrap(), 3);
        assert_eq!(source.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_chunk_writes_share_one_session() {
        let target = FakeTarget::with_keys(&["2"]);
        target.sequence_behind.store(true, Ordering::SeqCst);
        let target = Arc::new(target);
        let w = worker(Arc::new(FakeSource::with_rows(3)), target.clone(), table_config(), true);

        // copy, sequence reset, copy again, then merge after the key conflict
        assert_eq!(w.process_chunk(&single_chunk()).await.unwrap(), 3);
        assert_eq!(target.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(*target.session_writes.lock().unwrap(), vec![0, 0, 0, 0]);

        let mut source = FakeSource::with_rows(25);
        source.oom_above = Some(5);
        let target = Arc::new(FakeTarget::new());
        let w = worker(Arc::new(source), target.clone(), table_config(), true);

        w.process_chunk(&single_chunk()).await.unwrap();
        assert_eq!(target.sessions.load(Ordering::SeqCst), 1);
        let writes = target.session_writes.lock().unwrap().clone();
        assert!(writes.len() > 1);
        assert!(writes.iter().all(|&id| id == 0));
    }

    #[tokio::test]
    async fn test_retry_opens_a_fresh_session() {
        let source = FakeSource {
            transient_failures: AtomicU32::new(1),
            ..FakeSource::with_rows(3)
        };
        let target = Arc::new(FakeTarget::new());
        let w = worker(Arc::new(source), target.clone(), table_config(), true);

        assert_eq!(w.process_chunk(&numeric_chunk(1, 3)).await.unwrap(), 3);
        assert_eq!(target.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(*target.session_writes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_systemic_fetch_error_is_not_retried() {
        let source = FakeSource {
            fail_with: Some("column \"note\" does not exist".into()),
            ..FakeSource::with_rows(3)
        };
        let source = Arc::new(source);
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target, table_config(), true);

        let err = w.process_chunk(&numeric_chunk(1, 3)).await.unwrap_err();
        assert!(err.is_systemic());
        assert_eq!(source.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_scope_per_chunk_kind() {
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget {
            watermark: Some("2024-01-05".into()),
            ..FakeTarget::with_keys(&["1"])
        });
        let mut table = table_config();
        table.source_watermark = Some("updated_at".into());
        table.target_watermark = Some("updated_at".into());
        let w = worker(source.clone(), target.clone(), table.clone(), false);

        w.process_chunk(&numeric_chunk(1, 3)).await.unwrap();
        assert_eq!(
            target.watermark_scopes.lock().unwrap().clone(),
            vec![Some("\"id\" >= 1 AND \"id\" <= 3".to_string())]
        );
        assert!(source.queries()[0].contains("AND \"updated_at\" > '2024-01-05'"));

        // unscoped chunks use the mark looked up once for the table
        w.process_chunk(&single_chunk()).await.unwrap();
        assert_eq!(target.watermark_scopes.lock().unwrap().len(), 1);
        assert!(source.queries()[1].contains("AND \"updated_at\" > '2023-12-31'"));

        // initial full load skips lookups altogether
        let source = Arc::new(FakeSource::with_rows(3));
        let target = Arc::new(FakeTarget::new());
        let w = worker(source.clone(), target.clone(), table, true);
        w.process_chunk(&numeric_chunk(1, 3)).await.unwrap();
        assert!(target.watermark_scopes.lock().unwrap().is_empty());
        assert!(!source.queries()[0].contains("updated_at\" >"));
    }

    #[test]
    fn test_classify_sequence_collision() {
        let loaded = vec!["id".to_string(), "note".to_string()];
        let err = |key: &str| MigrateError::Load {
            table: "analytics.events".into(),
            message: "duplicate key value violates unique constraint".into(),
            sqlstate: Some("23505".into()),
            constraint: Some("events_pkey".into()),
            detail: Some(format!("Key ({})=(1) already exists.", key)),
        };
        assert!(matches!(
            LoadOutcome::classify(Err(err("row_id")), &loaded),
            LoadOutcome::SequenceCollision(_)
        ));
        assert!(matches!(
            LoadOutcome::classify(Err(err("id")), &loaded),
            LoadOutcome::Conflict(_)
        ));
        assert!(matches!(
            LoadOutcome::classify(Ok(4), &loaded),
            LoadOutcome::Loaded(4)
        ));
    }
}
