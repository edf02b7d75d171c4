//! In-process status ledger.
//!
//! Same semantics as the database ledger without durability. Used as the
//! ledger in orchestrator tests and by callers that do not need resume.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    truncate_error, ChunkUpdate, PendingChunk, RunRecord, RunStatus, RunUpdate, StatusTracker,
    TableKey, TableProgress, TableStatusRecord, TableUpdate, TaskStatus,
};
use crate::chunking::ChunkDescriptor;
use crate::error::{MigrateError, Result};
use crate::target::{CapturedIndexes, TargetTable};

#[derive(Debug, Clone)]
struct ChunkRow {
    descriptor: ChunkDescriptor,
    status: TaskStatus,
    rows_copied: i64,
    retry_count: i32,
    error_message: Option<String>,
}

#[derive(Default)]
struct Ledger {
    runs: BTreeMap<String, RunRecord>,
    tables: BTreeMap<(String, TableKey), TableStatusRecord>,
    chunks: BTreeMap<(String, String, String, i32), ChunkRow>,
}

fn chunk_key(run_id: &str, key: &TableKey, chunk_id: i32) -> (String, String, String, i32) {
    (
        run_id.to_string(),
        key.source_name.clone(),
        key.source_table.clone(),
        chunk_id,
    )
}

/// Ledger held in memory.
#[derive(Default)]
pub struct MemoryStatusTracker {
    inner: Mutex<Ledger>,
}

impl MemoryStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> Result<std::sync::MutexGuard<'_, Ledger>> {
        self.inner
            .lock()
            .map_err(|_| MigrateError::State("in-memory ledger lock poisoned".into()))
    }

    /// Insert a run with an explicit start time.
    pub fn insert_run(&self, record: RunRecord) -> Result<()> {
        self.ledger()?.runs.insert(record.run_id.clone(), record);
        Ok(())
    }

    /// Current status of one chunk.
    pub fn chunk_status(&self, run_id: &str, key: &TableKey, chunk_id: i32) -> Option<TaskStatus> {
        self.inner
            .lock()
            .ok()?
            .chunks
            .get(&chunk_key(run_id, key, chunk_id))
            .map(|c| c.status)
    }

    /// Last recorded error of one chunk.
    pub fn chunk_error(&self, run_id: &str, key: &TableKey, chunk_id: i32) -> Option<String> {
        self.inner
            .lock()
            .ok()?
            .chunks
            .get(&chunk_key(run_id, key, chunk_id))
            .and_then(|c| c.error_message.clone())
    }

    /// Retry counter of one chunk.
    pub fn chunk_retries(&self, run_id: &str, key: &TableKey, chunk_id: i32) -> Option<i32> {
        self.inner
            .lock()
            .ok()?
            .chunks
            .get(&chunk_key(run_id, key, chunk_id))
            .map(|c| c.retry_count)
    }
}

#[async_trait]
impl StatusTracker for MemoryStatusTracker {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn create_run(
        &self,
        execution_hash: &str,
        source_names: &[String],
        total_tables: i32,
    ) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.insert_run(RunRecord {
            run_id: run_id.clone(),
            execution_hash: execution_hash.to_string(),
            source_names: source_names.to_vec(),
            status: RunStatus::Running,
            total_tables,
            completed_tables: 0,
            failed_tables: 0,
            total_rows: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        })?;
        Ok(run_id)
    }

    async fn update_run_status(&self, run_id: &str, update: RunUpdate) -> Result<()> {
        let mut ledger = self.ledger()?;
        if let Some(run) = ledger.runs.get_mut(run_id) {
            run.status = update.status;
            if let Some(v) = update.completed_tables {
                run.completed_tables = v;
            }
            if let Some(v) = update.failed_tables {
                run.failed_tables = v;
            }
            if let Some(v) = update.total_rows {
                run.total_rows = v;
            }
            if let Some(e) = update.error_message {
                run.error_message = Some(truncate_error(&e));
            }
            run.completed_at = match update.status {
                RunStatus::Running => None,
                _ => Some(Utc::now()),
            };
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.ledger()?.runs.get(run_id).cloned())
    }

    async fn find_resumable_run(
        &self,
        execution_hash: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<RunRecord>> {
        let cutoff = Utc::now() - max_age;
        Ok(self
            .ledger()?
            .runs
            .values()
            .filter(|r| {
                r.execution_hash == execution_hash
                    && r.status.is_resumable()
                    && r.started_at > cutoff
            })
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn create_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        target: &TargetTable,
    ) -> Result<()> {
        self.ledger()?
            .tables
            .entry((run_id.to_string(), key.clone()))
            .or_insert_with(|| TableStatusRecord {
                source_name: key.source_name.clone(),
                source_schema: key.source_schema.clone(),
                source_table: key.source_table.clone(),
                target_schema: target.schema.clone(),
                target_table: target.name.clone(),
                status: TaskStatus::Pending,
                total_chunks: 0,
                completed_chunks: 0,
                failed_chunks: 0,
                total_rows_copied: 0,
                indexes_disabled: false,
                disabled_indexes: None,
                started_at: None,
                completed_at: None,
                error_message: None,
            });
        Ok(())
    }

    async fn update_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        update: TableUpdate,
    ) -> Result<()> {
        let mut ledger = self.ledger()?;
        if let Some(t) = ledger.tables.get_mut(&(run_id.to_string(), key.clone())) {
            t.status = update.status;
            if let Some(v) = update.total_chunks {
                t.total_chunks = v;
            }
            if let Some(v) = update.completed_chunks {
                t.completed_chunks = v;
            }
            if let Some(v) = update.failed_chunks {
                t.failed_chunks = v;
            }
            if let Some(v) = update.rows_copied {
                t.total_rows_copied = v;
            }
            if let Some(e) = update.error_message {
                t.error_message = Some(truncate_error(&e));
            }
            match update.status {
                TaskStatus::InProgress => {
                    t.started_at.get_or_insert_with(Utc::now);
                }
                TaskStatus::Completed | TaskStatus::Failed => t.completed_at = Some(Utc::now()),
                TaskStatus::Pending => {}
            }
        }
        Ok(())
    }

    async fn get_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
    ) -> Result<Option<TableStatusRecord>> {
        Ok(self
            .ledger()?
            .tables
            .get(&(run_id.to_string(), key.clone()))
            .cloned())
    }

    async fn list_table_statuses(&self, run_id: &str) -> Result<Vec<TableStatusRecord>> {
        Ok(self
            .ledger()?
            .tables
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn get_table_progress(&self, run_id: &str, key: &TableKey) -> Result<TableProgress> {
        let ledger = self.ledger()?;
        let mut progress = TableProgress::default();
        for ((run, source, table, _), chunk) in ledger.chunks.iter() {
            if run != run_id || *source != key.source_name || *table != key.source_table {
                continue;
            }
            match chunk.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
            }
            progress.rows_copied += chunk.rows_copied;
        }
        Ok(progress)
    }

    async fn create_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk: &ChunkDescriptor,
    ) -> Result<()> {
        // Same shape the database ledger persists.
        let descriptor = ChunkDescriptor::from_json(chunk.to_json()?)?;
        self.ledger()?
            .chunks
            .entry(chunk_key(run_id, key, chunk.chunk_id))
            .or_insert(ChunkRow {
                descriptor,
                status: TaskStatus::Pending,
                rows_copied: 0,
                retry_count: 0,
                error_message: None,
            });
        Ok(())
    }

    async fn update_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk_id: i32,
        update: ChunkUpdate,
    ) -> Result<()> {
        let mut ledger = self.ledger()?;
        if let Some(c) = ledger.chunks.get_mut(&chunk_key(run_id, key, chunk_id)) {
            c.status = update.status;
            if let Some(rows) = update.rows_copied {
                c.rows_copied = rows;
            }
            if update.status == TaskStatus::Completed {
                c.error_message = None;
            } else if let Some(e) = update.error_message {
                c.error_message = Some(truncate_error(&e));
            }
            if update.increment_retry {
                c.retry_count += 1;
            }
        }
        Ok(())
    }

    async fn get_pending_chunks(&self, run_id: &str, key: &TableKey) -> Result<Vec<PendingChunk>> {
        let ledger = self.ledger()?;
        Ok(ledger
            .chunks
            .iter()
            .filter(|((run, source, table, _), c)| {
                run == run_id
                    && *source == key.source_name
                    && *table == key.source_table
                    && c.status != TaskStatus::Completed
            })
            .map(|(_, c)| PendingChunk {
                descriptor: c.descriptor.clone(),
                status: c.status,
                retry_count: c.retry_count,
                error_message: c.error_message.clone(),
            })
            .collect())
    }

    async fn discard_chunks(&self, run_id: &str, key: &TableKey) -> Result<u64> {
        let mut ledger = self.ledger()?;
        let before = ledger.chunks.len();
        ledger.chunks.retain(|(run, source, table, _), _| {
            !(run == run_id && *source == key.source_name && *table == key.source_table)
        });
        Ok((before - ledger.chunks.len()) as u64)
    }

    async fn mark_indexes_disabled(
        &self,
        run_id: &str,
        key: &TableKey,
        captured: &CapturedIndexes,
    ) -> Result<()> {
        let mut ledger = self.ledger()?;
        if let Some(t) = ledger.tables.get_mut(&(run_id.to_string(), key.clone())) {
            t.indexes_disabled = true;
            t.disabled_indexes = Some(captured.clone());
        }
        Ok(())
    }

    async fn mark_indexes_restored(&self, run_id: &str, key: &TableKey) -> Result<()> {
        let mut ledger = self.ledger()?;
        if let Some(t) = ledger.tables.get_mut(&(run_id.to_string(), key.clone())) {
            t.indexes_disabled = false;
            t.disabled_indexes = None;
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
