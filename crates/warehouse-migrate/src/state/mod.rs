//! Durable run, table and chunk bookkeeping.
//!
//! The [`StatusTracker`] trait is the only way any component mutates the
//! ledger. The orchestrator works with `Arc<dyn StatusTracker>` without
//! knowing where the ledger lives:
//!
//! - **PostgreSQL**: [`DbStatusTracker`], tables in the target store
//! - **Memory**: [`MemoryStatusTracker`], for dry runs and tests
//!
//! Every write is committed on its own, never batched behind a data load, so
//! the ledger reflects what happened up to the moment a process died.

mod db;
mod memory;

pub use db::DbStatusTracker;
pub use memory::MemoryStatusTracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunking::ChunkDescriptor;
use crate::error::{MigrateError, Result};
use crate::target::{CapturedIndexes, TargetTable};

/// Longest error text kept in the ledger.
pub const MAX_ERROR_LEN: usize = 500;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(MigrateError::State(format!("Invalid run status: {}", s))),
        }
    }

    /// A run can be picked up again unless it completed.
    pub fn is_resumable(self) -> bool {
        self != RunStatus::Completed
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table or chunk status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(MigrateError::State(format!("Invalid task status: {}", s))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one source table within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub source_name: String,
    pub source_schema: String,
    pub source_table: String,
}

impl TableKey {
    pub fn new(
        source_name: impl Into<String>,
        source_schema: impl Into<String>,
        source_table: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            source_schema: source_schema.into(),
            source_table: source_table.into(),
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source_name, self.source_table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub execution_hash: String,
    pub source_names: Vec<String>,
    pub status: RunStatus,
    pub total_tables: i32,
    pub completed_tables: i32,
    pub failed_tables: i32,
    pub total_rows: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields changed by [`StatusTracker::update_run_status`]. `None` leaves a field as is.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub completed_tables: Option<i32>,
    pub failed_tables: Option<i32>,
    pub total_rows: Option<i64>,
    pub error_message: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            completed_tables: None,
            failed_tables: None,
            total_rows: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatusRecord {
    pub source_name: String,
    pub source_schema: String,
    pub source_table: String,
    pub target_schema: String,
    pub target_table: String,
    pub status: TaskStatus,
    pub total_chunks: i32,
    pub completed_chunks: i32,
    pub failed_chunks: i32,
    pub total_rows_copied: i64,
    pub indexes_disabled: bool,
    /// DDL needed to recreate indexes dropped for this load.
    pub disabled_indexes: Option<CapturedIndexes>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields changed by [`StatusTracker::update_table_status`].
#[derive(Debug, Clone)]
pub struct TableUpdate {
    pub status: TaskStatus,
    pub total_chunks: Option<i32>,
    pub completed_chunks: Option<i32>,
    pub failed_chunks: Option<i32>,
    pub rows_copied: Option<i64>,
    pub error_message: Option<String>,
}

impl TableUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            total_chunks: None,
            completed_chunks: None,
            failed_chunks: None,
            rows_copied: None,
            error_message: None,
        }
    }
}

/// Fields changed by [`StatusTracker::update_chunk_status`].
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub status: TaskStatus,
    pub rows_copied: Option<i64>,
    pub error_message: Option<String>,
    pub increment_retry: bool,
}

impl ChunkUpdate {
    pub fn in_progress() -> Self {
        Self {
            status: TaskStatus::InProgress,
            rows_copied: None,
            error_message: None,
            increment_retry: false,
        }
    }

    pub fn completed(rows: i64) -> Self {
        Self {
            status: TaskStatus::Completed,
            rows_copied: Some(rows),
            error_message: None,
            increment_retry: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            rows_copied: None,
            error_message: Some(error.into()),
            increment_retry: true,
        }
    }
}

/// A chunk persisted in a non-completed state.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub descriptor: ChunkDescriptor,
    pub status: TaskStatus,
    pub retry_count: i32,
    /// Last recorded failure, cleared when the chunk completes.
    pub error_message: Option<String>,
}

/// Chunk counts by status for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableProgress {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub rows_copied: i64,
}

impl TableProgress {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Ledger operations.
#[async_trait]
pub trait StatusTracker: Send + Sync {
    /// Create ledger tables if missing. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Start a new run in `running` state and return its id.
    async fn create_run(
        &self,
        execution_hash: &str,
        source_names: &[String],
        total_tables: i32,
    ) -> Result<String>;

    /// Sets `completed_at` on terminal statuses.
    async fn update_run_status(&self, run_id: &str, update: RunUpdate) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent resumable run with this hash that started within `max_age`.
    async fn find_resumable_run(
        &self,
        execution_hash: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<RunRecord>>;

    /// Record a table as `pending`. A no-op if it already exists.
    async fn create_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        target: &TargetTable,
    ) -> Result<()>;

    async fn update_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        update: TableUpdate,
    ) -> Result<()>;

    async fn get_table_status(&self, run_id: &str, key: &TableKey)
        -> Result<Option<TableStatusRecord>>;

    async fn list_table_statuses(&self, run_id: &str) -> Result<Vec<TableStatusRecord>>;

    async fn get_table_progress(&self, run_id: &str, key: &TableKey) -> Result<TableProgress>;

    /// Record a chunk as `pending`. A no-op if it already exists.
    async fn create_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk: &ChunkDescriptor,
    ) -> Result<()>;

    async fn update_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk_id: i32,
        update: ChunkUpdate,
    ) -> Result<()>;

    /// Chunks not yet completed, ordered by id.
    async fn get_pending_chunks(&self, run_id: &str, key: &TableKey) -> Result<Vec<PendingChunk>>;

    /// Delete every chunk record of a table. Returns the number removed.
    async fn discard_chunks(&self, run_id: &str, key: &TableKey) -> Result<u64>;

    async fn mark_indexes_disabled(
        &self,
        run_id: &str,
        key: &TableKey,
        captured: &CapturedIndexes,
    ) -> Result<()>;

    async fn mark_indexes_restored(&self, run_id: &str, key: &TableKey) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Clip error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
