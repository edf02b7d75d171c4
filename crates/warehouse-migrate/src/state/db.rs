//! Database-backed status ledger.
//!
//! Stores run, table and chunk status in PostgreSQL tables within a
//! dedicated schema of the target database (`migration_status` by default).
//! Each statement runs on its own pooled connection in autocommit mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tracing::{debug, info};

use super::{
    truncate_error, ChunkUpdate, PendingChunk, RunRecord, RunStatus, RunUpdate, StatusTracker,
    TableKey, TableProgress, TableStatusRecord, TableUpdate, TaskStatus,
};
use crate::chunking::ChunkDescriptor;
use crate::error::{MigrateError, Result};
use crate::pg::quote_ident;
use crate::target::{CapturedIndexes, TargetTable};

/// PostgreSQL status ledger.
pub struct DbStatusTracker {
    pool: Pool,
    schema: String,
}

impl DbStatusTracker {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), name)
    }
}

fn state_err(context: &str, e: tokio_postgres::Error) -> MigrateError {
    MigrateError::State(format!("{}: {}", context, e))
}

fn run_from_row(row: &Row) -> Result<RunRecord> {
    let status: String = row.get("status");
    Ok(RunRecord {
        run_id: row.get("run_id"),
        execution_hash: row.get("execution_hash"),
        source_names: row.get("source_names"),
        status: RunStatus::parse(&status)?,
        total_tables: row.get("total_tables"),
        completed_tables: row.get("completed_tables"),
        failed_tables: row.get("failed_tables"),
        total_rows: row.get("total_rows"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
    })
}

fn table_from_row(row: &Row) -> Result<TableStatusRecord> {
    let status: String = row.get("status");
    let ddl: Option<serde_json::Value> = row.get("disabled_index_ddl");
    Ok(TableStatusRecord {
        source_name: row.get("source_name"),
        source_schema: row.get("source_schema"),
        source_table: row.get("source_table"),
        target_schema: row.get("target_schema"),
        target_table: row.get("target_table"),
        status: TaskStatus::parse(&status)?,
        total_chunks: row.get("total_chunks"),
        completed_chunks: row.get("completed_chunks"),
        failed_chunks: row.get("failed_chunks"),
        total_rows_copied: row.get("total_rows_copied"),
        indexes_disabled: row.get("indexes_disabled"),
        disabled_indexes: ddl.map(serde_json::from_value::<CapturedIndexes>).transpose()?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
    })
}

const RUN_COLUMNS: &str = "run_id, execution_hash, source_names, status, total_tables, \
    completed_tables, failed_tables, total_rows, started_at, completed_at, error_message";

const TABLE_COLUMNS: &str = "source_name, source_schema, source_table, target_schema, \
    target_table, status, total_chunks, completed_chunks, failed_chunks, total_rows_copied, \
    indexes_disabled, disabled_index_ddl, started_at, completed_at, error_message";

#[async_trait]
impl StatusTracker for DbStatusTracker {
    async fn init_schema(&self) -> Result<()> {
        let client = self.client("getting connection for ledger schema").await?;
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};

            CREATE TABLE IF NOT EXISTS {runs} (
                run_id TEXT PRIMARY KEY,
                execution_hash TEXT NOT NULL,
                source_names TEXT[] NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'partial', 'failed')),
                total_tables INTEGER NOT NULL DEFAULT 0,
                completed_tables INTEGER NOT NULL DEFAULT 0,
                failed_tables INTEGER NOT NULL DEFAULT 0,
                total_rows BIGINT NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_migration_runs_resume
                ON {runs} (execution_hash, started_at DESC);

            CREATE TABLE IF NOT EXISTS {tables} (
                run_id TEXT NOT NULL REFERENCES {runs}(run_id) ON DELETE CASCADE,
                source_name TEXT NOT NULL,
                source_schema TEXT NOT NULL,
                source_table TEXT NOT NULL,
                target_schema TEXT NOT NULL,
                target_table TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
                total_chunks INTEGER NOT NULL DEFAULT 0,
                completed_chunks INTEGER NOT NULL DEFAULT 0,
                failed_chunks INTEGER NOT NULL DEFAULT 0,
                total_rows_copied BIGINT NOT NULL DEFAULT 0,
                indexes_disabled BOOLEAN NOT NULL DEFAULT FALSE,
                disabled_index_ddl JSONB,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                error_message TEXT,
                UNIQUE (run_id, source_name, source_schema, source_table)
            );

            CREATE TABLE IF NOT EXISTS {chunks} (
                run_id TEXT NOT NULL REFERENCES {runs}(run_id) ON DELETE CASCADE,
                source_name TEXT NOT NULL,
                source_table TEXT NOT NULL,
                chunk_id INTEGER NOT NULL,
                chunk_filter TEXT NOT NULL,
                chunk_metadata JSONB NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
                rows_copied BIGINT NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                error_message TEXT,
                UNIQUE (run_id, source_name, source_table, chunk_id)
            );",
            schema = quote_ident(&self.schema),
            runs = self.table("migration_runs"),
            tables = self.table("migration_table_status"),
            chunks = self.table("migration_chunk_status"),
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| state_err("creating ledger schema", e))?;
        debug!("Status ledger ready in schema {}", self.schema);
        Ok(())
    }

    async fn create_run(
        &self,
        execution_hash: &str,
        source_names: &[String],
        total_tables: i32,
    ) -> Result<String> {
        let client = self.client("getting connection for create_run").await?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let names = source_names.to_vec();
        client
            .execute(
                &format!(
                    "INSERT INTO {} (run_id, execution_hash, source_names, status, total_tables)
                     VALUES ($1, $2, $3, 'running', $4)",
                    self.table("migration_runs")
                ),
                &[&run_id, &execution_hash, &names, &total_tables],
            )
            .await
            .map_err(|e| state_err("creating run", e))?;
        info!("Created migration run {}", run_id);
        Ok(run_id)
    }

    async fn update_run_status(&self, run_id: &str, update: RunUpdate) -> Result<()> {
        let client = self.client("getting connection for update_run_status").await?;
        let error = update.error_message.as_deref().map(truncate_error);
        client
            .execute(
                &format!(
                    "UPDATE {} SET
                        status = $1,
                        completed_tables = COALESCE($2::int4, completed_tables),
                        failed_tables = COALESCE($3::int4, failed_tables),
                        total_rows = COALESCE($4::int8, total_rows),
                        error_message = COALESCE($5::text, error_message),
                        completed_at = CASE WHEN $1 = 'running' THEN NULL ELSE NOW() END
                     WHERE run_id = $6",
                    self.table("migration_runs")
                ),
                &[
                    &update.status.as_str(),
                    &update.completed_tables,
                    &update.failed_tables,
                    &update.total_rows,
                    &error,
                    &run_id,
                ],
            )
            .await
            .map_err(|e| state_err("updating run", e))?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let client = self.client("getting connection for get_run").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE run_id = $1",
                    RUN_COLUMNS,
                    self.table("migration_runs")
                ),
                &[&run_id],
            )
            .await
            .map_err(|e| state_err("loading run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn find_resumable_run(
        &self,
        execution_hash: &str,
        max_age: chrono::Duration,
    ) -> Result<Option<RunRecord>> {
        let client = self.client("getting connection for find_resumable_run").await?;
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {}
                     WHERE execution_hash = $1
                       AND status IN ('running', 'partial', 'failed')
                       AND started_at > $2
                     ORDER BY started_at DESC
                     LIMIT 1",
                    RUN_COLUMNS,
                    self.table("migration_runs")
                ),
                &[&execution_hash, &cutoff],
            )
            .await
            .map_err(|e| state_err("searching resumable runs", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn create_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        target: &TargetTable,
    ) -> Result<()> {
        let client = self.client("getting connection for create_table_status").await?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (run_id, source_name, source_schema, source_table,
                                     target_schema, target_table, status)
                     VALUES ($1, $2, $3, $4, $5, $6, 'pending')
                     ON CONFLICT (run_id, source_name, source_schema, source_table) DO NOTHING",
                    self.table("migration_table_status")
                ),
                &[
                    &run_id,
                    &key.source_name,
                    &key.source_schema,
                    &key.source_table,
                    &target.schema,
                    &target.name,
                ],
            )
            .await
            .map_err(|e| state_err("creating table status", e))?;
        Ok(())
    }

    async fn update_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
        update: TableUpdate,
    ) -> Result<()> {
        let client = self.client("getting connection for update_table_status").await?;
        let error = update.error_message.as_deref().map(truncate_error);
        client
            .execute(
                &format!(
                    "UPDATE {} SET
                        status = $1,
                        total_chunks = COALESCE($2::int4, total_chunks),
                        completed_chunks = COALESCE($3::int4, completed_chunks),
                        failed_chunks = COALESCE($4::int4, failed_chunks),
                        total_rows_copied = COALESCE($5::int8, total_rows_copied),
                        error_message = COALESCE($6::text, error_message),
                        started_at = CASE WHEN $1 = 'in_progress'
                                          THEN COALESCE(started_at, NOW()) ELSE started_at END,
                        completed_at = CASE WHEN $1 IN ('completed', 'failed')
                                            THEN NOW() ELSE completed_at END
                     WHERE run_id = $7 AND source_name = $8
                       AND source_schema = $9 AND source_table = $10",
                    self.table("migration_table_status")
                ),
                &[
                    &update.status.as_str(),
                    &update.total_chunks,
                    &update.completed_chunks,
                    &update.failed_chunks,
                    &update.rows_copied,
                    &error,
                    &run_id,
                    &key.source_name,
                    &key.source_schema,
                    &key.source_table,
                ],
            )
            .await
            .map_err(|e| state_err("updating table status", e))?;
        Ok(())
    }

    async fn get_table_status(
        &self,
        run_id: &str,
        key: &TableKey,
    ) -> Result<Option<TableStatusRecord>> {
        let client = self.client("getting connection for get_table_status").await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM {}
                     WHERE run_id = $1 AND source_name = $2
                       AND source_schema = $3 AND source_table = $4",
                    TABLE_COLUMNS,
                    self.table("migration_table_status")
                ),
                &[&run_id, &key.source_name, &key.source_schema, &key.source_table],
            )
            .await
            .map_err(|e| state_err("loading table status", e))?;
        row.as_ref().map(table_from_row).transpose()
    }

    async fn list_table_statuses(&self, run_id: &str) -> Result<Vec<TableStatusRecord>> {
        let client = self.client("getting connection for list_table_statuses").await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE run_id = $1
                     ORDER BY source_name, source_schema, source_table",
                    TABLE_COLUMNS,
                    self.table("migration_table_status")
                ),
                &[&run_id],
            )
            .await
            .map_err(|e| state_err("listing table statuses", e))?;
        rows.iter().map(table_from_row).collect()
    }

    async fn get_table_progress(&self, run_id: &str, key: &TableKey) -> Result<TableProgress> {
        let client = self.client("getting connection for get_table_progress").await?;
        let rows = client
            .query(
                &format!(
                    "SELECT status, COUNT(*)::int8, COALESCE(SUM(rows_copied), 0)::int8
                     FROM {}
                     WHERE run_id = $1 AND source_name = $2 AND source_table = $3
                     GROUP BY status",
                    self.table("migration_chunk_status")
                ),
                &[&run_id, &key.source_name, &key.source_table],
            )
            .await
            .map_err(|e| state_err("loading table progress", e))?;

        let mut progress = TableProgress::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            let rows_copied: i64 = row.get(2);
            match TaskStatus::parse(&status)? {
                TaskStatus::Pending => progress.pending = count,
                TaskStatus::InProgress => progress.in_progress = count,
                TaskStatus::Completed => progress.completed = count,
                TaskStatus::Failed => progress.failed = count,
            }
            progress.rows_copied += rows_copied;
        }
        Ok(progress)
    }

    async fn create_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk: &ChunkDescriptor,
    ) -> Result<()> {
        let client = self.client("getting connection for create_chunk_status").await?;
        let metadata = chunk.to_json()?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (run_id, source_name, source_table, chunk_id,
                                     chunk_filter, chunk_metadata, status)
                     VALUES ($1, $2, $3, $4, $5, $6, 'pending')
                     ON CONFLICT (run_id, source_name, source_table, chunk_id) DO NOTHING",
                    self.table("migration_chunk_status")
                ),
                &[
                    &run_id,
                    &key.source_name,
                    &key.source_table,
                    &chunk.chunk_id,
                    &chunk.filter,
                    &metadata,
                ],
            )
            .await
            .map_err(|e| state_err("creating chunk status", e))?;
        Ok(())
    }

    async fn update_chunk_status(
        &self,
        run_id: &str,
        key: &TableKey,
        chunk_id: i32,
        update: ChunkUpdate,
    ) -> Result<()> {
        let client = self.client("getting connection for update_chunk_status").await?;
        let error = update.error_message.as_deref().map(truncate_error);
        client
            .execute(
                &format!(
                    "UPDATE {} SET
                        status = $1,
                        rows_copied = COALESCE($2::int8, rows_copied),
                        error_message = CASE WHEN $1 = 'completed' THEN NULL
                                             ELSE COALESCE($3::text, error_message) END,
                        retry_count = retry_count + CASE WHEN $4 THEN 1 ELSE 0 END,
                        started_at = CASE WHEN $1 = 'in_progress'
                                          THEN COALESCE(started_at, NOW()) ELSE started_at END,
                        completed_at = CASE WHEN $1 IN ('completed', 'failed') THEN NOW()
                                            WHEN $1 = 'in_progress' THEN NULL
                                            ELSE completed_at END
                     WHERE run_id = $5 AND source_name = $6 AND source_table = $7 AND chunk_id = $8",
                    self.table("migration_chunk_status")
                ),
                &[
                    &update.status.as_str(),
                    &update.rows_copied,
                    &error,
                    &update.increment_retry,
                    &run_id,
                    &key.source_name,
                    &key.source_table,
                    &chunk_id,
                ],
            )
            .await
            .map_err(|e| state_err("updating chunk status", e))?;
        Ok(())
    }

    async fn get_pending_chunks(&self, run_id: &str, key: &TableKey) -> Result<Vec<PendingChunk>> {
        let client = self.client("getting connection for get_pending_chunks").await?;
        let rows = client
            .query(
                &format!(
                    "SELECT chunk_metadata, status, retry_count, error_message FROM {}
                     WHERE run_id = $1 AND source_name = $2 AND source_table = $3
                       AND status IN ('pending', 'in_progress', 'failed')
                     ORDER BY chunk_id",
                    self.table("migration_chunk_status")
                ),
                &[&run_id, &key.source_name, &key.source_table],
            )
            .await
            .map_err(|e| state_err("loading pending chunks", e))?;

        rows.iter()
            .map(|row| {
                let status: String = row.get(1);
                Ok(PendingChunk {
                    descriptor: ChunkDescriptor::from_json(row.get(0))?,
                    status: TaskStatus::parse(&status)?,
                    retry_count: row.get(2),
                    error_message: row.get(3),
                })
            })
            .collect()
    }

    async fn discard_chunks(&self, run_id: &str, key: &TableKey) -> Result<u64> {
        let client = self.client("getting connection for discard_chunks").await?;
        let removed = client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE run_id = $1 AND source_name = $2 AND source_table = $3",
                    self.table("migration_chunk_status")
                ),
                &[&run_id, &key.source_name, &key.source_table],
            )
            .await
            .map_err(|e| state_err("discarding chunk plan", e))?;
        debug!("{}: discarded {} chunk records", key, removed);
        Ok(removed)
    }

    async fn mark_indexes_disabled(
        &self,
        run_id: &str,
        key: &TableKey,
        captured: &CapturedIndexes,
    ) -> Result<()> {
        let client = self.client("getting connection for mark_indexes_disabled").await?;
        let ddl = serde_json::to_value(captured)?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET indexes_disabled = TRUE, disabled_index_ddl = $1
                     WHERE run_id = $2 AND source_name = $3
                       AND source_schema = $4 AND source_table = $5",
                    self.table("migration_table_status")
                ),
                &[
                    &ddl,
                    &run_id,
                    &key.source_name,
                    &key.source_schema,
                    &key.source_table,
                ],
            )
            .await
            .map_err(|e| state_err("marking indexes disabled", e))?;
        Ok(())
    }

    async fn mark_indexes_restored(&self, run_id: &str, key: &TableKey) -> Result<()> {
        let client = self.client("getting connection for mark_indexes_restored").await?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET indexes_disabled = FALSE, disabled_index_ddl = NULL
                     WHERE run_id = $1 AND source_name = $2
                       AND source_schema = $3 AND source_table = $4",
                    self.table("migration_table_status")
                ),
                &[&run_id, &key.source_name, &key.source_schema, &key.source_table],
            )
            .await
            .map_err(|e| state_err("marking indexes restored", e))?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
