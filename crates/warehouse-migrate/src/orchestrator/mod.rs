//! Migration orchestrator - main workflow coordinator.
//!
//! A run goes through resume detection, then for each selected table:
//! truncate decision, chunk planning (or reconstruction from the ledger),
//! dispatch to a bounded worker pool and aggregation, and finally run
//! finalization. Every transition is written to the [`StatusTracker`] as it
//! happens so an interrupted run can be picked up where it stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::{
    apply_copy_mode, build_strategy, select_strategy, ChunkDescriptor, ChunkRequest, PlanOptions,
    StrategyKind,
};
use crate::config::{Config, SourceGroup, TableConfig};
use crate::error::{MigrateError, Result};
use crate::notify::{ChunkFailure, RunSummary, SummarySink, TableAction, TableState};
use crate::pg::{quote_ident, quote_literal};
use crate::source::{SourceReader, SourceTable, WarehouseReader};
use crate::state::{
    ChunkUpdate, DbStatusTracker, RunRecord, RunStatus, RunUpdate, StatusTracker, TableKey,
    TableStatusRecord, TableUpdate, TaskStatus,
};
use crate::target::{PgTargetWriter, TargetTable, TargetWriter};
use crate::worker::{map_columns, ColumnMapping, MigrationWorker, RetryPolicy, WorkerContext};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    tracker: Arc<dyn StatusTracker>,
    sinks: Vec<Arc<dyn SummarySink>>,
}

/// Per-invocation choices that are not part of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Source groups to migrate. Empty selects every enabled group.
    pub sources: Vec<String>,
    /// Resume this run instead of searching for one.
    pub resume_run_id: Option<String>,
    /// Always start a new run.
    pub no_resume: bool,
    /// Overrides `migration.resume_max_age_hours`.
    pub resume_max_age_hours: Option<i64>,
    /// Overrides `migration.parallel_threads` for tables without their own setting.
    pub workers: Option<usize>,
}

/// Connectivity report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// What a run would do for one table.
#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    pub source_name: String,
    pub source_table: String,
    pub target_table: String,
    pub strategy: StrategyKind,
    pub partition_column: Option<String>,
    pub batch_size: usize,
    pub parallel_threads: usize,
    pub truncate_onstart: bool,
    pub incremental: bool,
    pub insert_only: bool,
    pub disable_index: bool,
}

/// Ledger contents of one run, for the status command.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RunRecord,
    pub tables: Vec<TableStatusRecord>,
}

/// What to do with `truncate_onstart` given the ledger and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateDecision {
    /// Fresh start on an empty table, or recorded but never started.
    Truncate,
    /// The table already made progress in this run.
    Resume,
    /// Unrecognised ledger state; leave the data alone.
    Keep,
    /// No ledger record yet the target holds rows: a resume mismatch.
    Refuse,
}

/// Decide whether truncating a table at start is safe.
pub fn decide_truncate(existing: Option<TaskStatus>, target_rows: i64) -> TruncateDecision {
    match existing {
        None if target_rows == 0 => TruncateDecision::Truncate,
        None => TruncateDecision::Refuse,
        Some(TaskStatus::Pending) => TruncateDecision::Truncate,
        Some(TaskStatus::InProgress) | Some(TaskStatus::Completed) => TruncateDecision::Resume,
        Some(_) => TruncateDecision::Keep,
    }
}

/// Whether a table is loading into an empty target for the first time.
///
/// Only keyed tables qualify, and never under truncate-on-start, which
/// already makes every chunk bulk-copy.
pub fn is_initial_full_load(table: &TableConfig, target_rows: i64, target_watermark: Option<&str>) -> bool {
    if table.truncate_onstart || table.uniqueness_columns.is_empty() {
        return false;
    }
    target_rows == 0 && target_watermark.is_none()
}

/// Final run status from the tables that were processed.
pub fn run_status(tables: &[TableAction], total_tables: usize, stopped: bool) -> RunStatus {
    let done = tables.iter().filter(|t| t.status.is_done()).count();
    let failed = tables
        .iter()
        .filter(|t| t.status == TableState::Failed)
        .count();
    if done == total_tables {
        RunStatus::Completed
    } else if stopped {
        RunStatus::Partial
    } else if failed > 0 && failed == tables.len() {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

/// Resolve the tables a run would migrate without touching any database.
pub fn plan(config: &Config, options: &RunOptions) -> Result<Vec<TablePlan>> {
    let migration = &config.migration;
    let groups = config.select_sources(&options.sources)?;
    Ok(groups
        .iter()
        .flat_map(|group| {
            group.enabled_tables().map(move |table| {
                let (strategy, partition_column) = select_strategy(table);
                TablePlan {
                    source_name: group.name.clone(),
                    source_table: format!("{}.{}", group.source_schema, table.source),
                    target_table: format!("{}.{}", group.target_schema, table.target),
                    strategy,
                    partition_column,
                    batch_size: table.get_batch_size(migration),
                    parallel_threads: table
                        .parallel_threads
                        .or(options.workers)
                        .unwrap_or_else(|| migration.get_parallel_threads()),
                    truncate_onstart: table.truncate_onstart,
                    incremental: table.is_incremental(),
                    insert_only: table.insert_only_mode,
                    disable_index: table.disable_index,
                }
            })
        })
        .collect())
}

/// Cancellation token plus an optional deadline.
#[derive(Clone)]
struct StopSignal {
    token: CancellationToken,
    deadline: Option<tokio::time::Instant>,
}

impl StopSignal {
    fn reason(&self) -> Option<&'static str> {
        if self.token.is_cancelled() {
            Some("cancelled")
        } else if self
            .deadline
            .map(|d| tokio::time::Instant::now() >= d)
            .unwrap_or(false)
        {
            Some("deadline reached")
        } else {
            None
        }
    }

    fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }
}

/// One table being migrated within a run.
struct TableRun<'a> {
    run_id: &'a str,
    table: &'a TableConfig,
    key: TableKey,
    source_table: SourceTable,
    target_table: TargetTable,
    threads: usize,
    stop: &'a StopSignal,
}

enum ChunkRun {
    Completed { rows: u64 },
    Failed { error: String, systemic: bool },
}

#[derive(Debug, Default)]
struct DispatchReport {
    completed: usize,
    failed: usize,
    not_started: usize,
    rows: u64,
    /// First systemic error, which aborted the table.
    systemic: Option<String>,
}

impl Orchestrator {
    /// Connect to the warehouse and the target. The ledger lives in the target.
    pub async fn connect(config: Config, workers: Option<usize>) -> Result<Self> {
        let workers = workers.unwrap_or_else(|| config.migration.get_parallel_threads());
        let source =
            WarehouseReader::connect(&config.source, config.source.pool_size(workers)).await?;
        // Ledger writes share the target pool, so leave room beyond the workers.
        let target =
            PgTargetWriter::connect(&config.target, config.target.pool_size(workers) + 2).await?;
        let tracker =
            DbStatusTracker::new(target.pool().clone(), config.migration.get_status_schema());

        Ok(Self::with_backends(
            config,
            Arc::new(source),
            Arc::new(target),
            Arc::new(tracker),
        ))
    }

    /// Build an orchestrator over existing backends.
    pub fn with_backends(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        tracker: Arc<dyn StatusTracker>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            tracker,
            sinks: Vec::new(),
        }
    }

    /// Deliver the run summary to `sink` when a run finishes.
    pub fn with_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the migration.
    ///
    /// Table failures do not make this return an error; they are reported in
    /// the summary. Errors are returned only when the run itself cannot
    /// proceed: bad source selection, an unusable ledger, or a run id that
    /// cannot be resumed.
    pub async fn run(&self, options: &RunOptions, cancel: CancellationToken) -> Result<RunSummary> {
        let started_at = Utc::now();
        let stop = StopSignal {
            token: cancel,
            deadline: self
                .config
                .migration
                .max_run_seconds
                .map(|s| tokio::time::Instant::now() + Duration::from_secs(s)),
        };

        let groups = self.config.select_sources(&options.sources)?;
        let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
        let fingerprint = self.config.fingerprint(&names);
        let total_tables: usize = groups.iter().map(|g| g.enabled_tables().count()).sum();

        self.tracker.init_schema().await?;
        let (run_id, resumed) = self
            .resolve_run(&fingerprint, &names, total_tables as i32, options)
            .await?;
        info!(
            "Starting migration run {} ({} tables from {}, ledger: {})",
            run_id,
            total_tables,
            names.join(", "),
            self.tracker.backend_type()
        );

        let mut tables = Vec::with_capacity(total_tables);
        let mut stopped = None;
        'sources: for group in &groups {
            for table in group.enabled_tables() {
                if let Some(reason) = stop.reason() {
                    info!("{}: not starting further tables", reason);
                    stopped = Some(reason.to_string());
                    break 'sources;
                }
                let action = self.process_table(&run_id, group, table, options, &stop).await;
                tables.push(action);
            }
        }
        if stopped.is_none() {
            stopped = stop.reason().map(str::to_string);
        }

        let status = run_status(&tables, total_tables, stopped.is_some());
        let completed_at = Utc::now();
        let summary = RunSummary {
            run_id: run_id.clone(),
            status,
            resumed,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            stopped,
            tables,
        };

        let failed = summary.failed_tables();
        let error_message = (!failed.is_empty()).then(|| {
            let names: Vec<_> = failed.iter().map(|(t, _)| t.as_str()).collect();
            format!("{} table(s) not finished: {}", names.len(), names.join(", "))
        });
        self.tracker
            .update_run_status(
                &run_id,
                RunUpdate {
                    status,
                    completed_tables: Some(summary.tables_completed() as i32),
                    failed_tables: Some(summary.tables_failed() as i32),
                    total_rows: Some(summary.rows_copied()),
                    error_message,
                },
            )
            .await?;

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&summary).await {
                warn!("Summary sink '{}' failed: {}", sink.name(), e);
            }
        }

        Ok(summary)
    }

    /// Pick the run to work on: an explicit id, a matching unfinished run, or a new one.
    async fn resolve_run(
        &self,
        fingerprint: &str,
        names: &[String],
        total_tables: i32,
        options: &RunOptions,
    ) -> Result<(String, bool)> {
        if let Some(id) = &options.resume_run_id {
            let run = self
                .tracker
                .get_run(id)
                .await?
                .ok_or_else(|| MigrateError::RunNotResumable(format!("run {} not found", id)))?;
            if !run.status.is_resumable() {
                return Err(MigrateError::RunNotResumable(format!(
                    "run {} already completed",
                    id
                )));
            }
            if run.execution_hash != fingerprint {
                warn!(
                    "Run {} was started with a different configuration or source selection",
                    id
                );
            }
            self.tracker
                .update_run_status(id, RunUpdate::status(RunStatus::Running))
                .await?;
            info!("Resuming run {} ({})", id, run.status);
            return Ok((id.clone(), true));
        }

        if !options.no_resume {
            let hours = options
                .resume_max_age_hours
                .unwrap_or_else(|| self.config.migration.get_resume_max_age_hours());
            let found = self
                .tracker
                .find_resumable_run(fingerprint, chrono::Duration::hours(hours))
                .await?;
            if let Some(run) = found {
                info!(
                    "Resuming run {} ({}, started {})",
                    run.run_id, run.status, run.started_at
                );
                self.tracker
                    .update_run_status(&run.run_id, RunUpdate::status(RunStatus::Running))
                    .await?;
                return Ok((run.run_id, true));
            }
            debug!("No resumable run younger than {}h", hours);
        }

        let run_id = self
            .tracker
            .create_run(fingerprint, names, total_tables)
            .await?;
        Ok((run_id, false))
    }

    async fn process_table(
        &self,
        run_id: &str,
        group: &SourceGroup,
        table: &TableConfig,
        options: &RunOptions,
        stop: &StopSignal,
    ) -> TableAction {
        let started = Instant::now();
        let run = TableRun {
            run_id,
            table,
            key: TableKey::new(&group.name, &group.source_schema, &table.source),
            source_table: SourceTable::new(&group.source_schema, &table.source),
            target_table: TargetTable::new(&group.target_schema, &table.target),
            threads: table
                .parallel_threads
                .or(options.workers)
                .unwrap_or_else(|| self.config.migration.get_parallel_threads())
                .max(1),
            stop,
        };

        let mut action = TableAction {
            source_name: group.name.clone(),
            source_table: table.source.clone(),
            target_table: run.target_table.full_name(),
            status: TableState::Failed,
            rows_copied: 0,
            target_rows_before: None,
            target_rows_after: None,
            chunks_completed: 0,
            chunks_failed: 0,
            duration_seconds: 0.0,
            error: None,
            notes: Vec::new(),
            failed_chunks: Vec::new(),
        };

        if let Err(e) = self.migrate_table(&run, &mut action).await {
            error!("{}: failed: {}", run.key, e);
            action.status = TableState::Failed;
            action.error = Some(e.to_string());
            let update = TableUpdate {
                error_message: Some(e.to_string()),
                ..TableUpdate::status(TaskStatus::Failed)
            };
            if let Err(le) = self
                .tracker
                .update_table_status(run_id, &run.key, update)
                .await
            {
                warn!("{}: could not record failure: {}", run.key, le);
            }
        }

        action.duration_seconds = started.elapsed().as_secs_f64();
        action
    }

    async fn migrate_table(&self, run: &TableRun<'_>, action: &mut TableAction) -> Result<()> {
        let key = &run.key;
        let table = run.table;
        let target_table = &run.target_table;

        let existing = self.tracker.get_table_status(run.run_id, key).await?;
        if let Some(record) = existing.as_ref().filter(|r| r.status == TaskStatus::Completed) {
            info!("{}: already completed in this run, skipping", key);
            action.status = TableState::Skipped;
            action.rows_copied = record.total_rows_copied;
            action.chunks_completed = record.completed_chunks as i64;
            action.chunks_failed = record.failed_chunks as i64;
            return Ok(());
        }

        let rows_before = self.target.row_count(target_table).await?;
        action.target_rows_before = Some(rows_before);

        let mut truncated = false;
        if table.truncate_onstart {
            match decide_truncate(existing.as_ref().map(|r| r.status), rows_before) {
                TruncateDecision::Truncate => {
                    info!("{}: truncating {}", key, target_table.full_name());
                    self.target.truncate(target_table).await?;
                    truncated = true;
                }
                TruncateDecision::Resume => {
                    info!("{}: already started in this run, keeping existing rows", key);
                }
                TruncateDecision::Keep => {
                    warn!(
                        "{}: ledger status {:?} is not a safe truncate state, keeping existing rows",
                        key,
                        existing.as_ref().map(|r| r.status)
                    );
                }
                TruncateDecision::Refuse => {
                    let refusal = MigrateError::TruncateRefused {
                        table: target_table.full_name(),
                        reason: format!(
                            "no ledger record in run {} but the table holds {} rows; resume detection may have missed an earlier run",
                            run.run_id, rows_before
                        ),
                    };
                    error!("{}: {}", key, refusal);
                    action.notes.push(refusal.to_string());
                }
            }
        }

        self.tracker
            .create_table_status(run.run_id, key, target_table)
            .await?;
        self.tracker
            .update_table_status(run.run_id, key, TableUpdate::status(TaskStatus::InProgress))
            .await?;

        let columns = self.resolve_columns(run).await?;

        let rows_now = if truncated { 0 } else { rows_before };
        let target_watermark = match table.target_watermark.as_deref() {
            Some(column) if rows_now > 0 => self
                .target
                .max_watermark(target_table, column, None)
                .await
                .unwrap_or_else(|e| {
                    warn!("{}: watermark lookup failed, loading without it: {}", key, e);
                    None
                }),
            _ => None,
        };
        let initial_full_load = is_initial_full_load(table, rows_now, target_watermark.as_deref());
        let batch_size = match (initial_full_load, self.config.migration.batch_size_copy_mode) {
            (true, Some(size)) => size,
            _ => table.get_batch_size(&self.config.migration),
        };
        debug!(
            "{}: initial full load {}, watermark {:?}, batch size {}",
            key, initial_full_load, target_watermark, batch_size
        );

        // Chunks: reconstructed from the ledger when it holds the whole
        // plan, planned from source statistics otherwise. The planned count
        // is recorded before the chunks, so a plan cut short while being
        // written shows up as fewer chunks than recorded.
        let progress = self.tracker.get_table_progress(run.run_id, key).await?;
        let recorded = existing.as_ref().map(|r| r.total_chunks as i64).unwrap_or(0);
        let chunks = if progress.total() > 0 && progress.total() == recorded {
            let pending = self.tracker.get_pending_chunks(run.run_id, key).await?;
            info!(
                "{}: resuming {} of {} chunks",
                key,
                pending.len(),
                progress.total()
            );
            pending.into_iter().map(|p| p.descriptor).collect()
        } else {
            if progress.total() > 0 {
                warn!(
                    "{}: ledger holds {} chunks but {} were planned, replanning",
                    key,
                    progress.total(),
                    recorded
                );
                self.tracker.discard_chunks(run.run_id, key).await?;
            }
            let chunks = self
                .plan_chunks(run, batch_size, truncated, target_watermark.as_deref(), &columns)
                .await?;
            self.tracker
                .update_table_status(
                    run.run_id,
                    key,
                    TableUpdate {
                        total_chunks: Some(chunks.len() as i32),
                        ..TableUpdate::status(TaskStatus::InProgress)
                    },
                )
                .await?;
            for chunk in &chunks {
                self.tracker
                    .create_chunk_status(run.run_id, key, chunk)
                    .await?;
            }
            chunks
        };

        let captured = match existing.as_ref().filter(|r| r.indexes_disabled) {
            Some(record) => record.disabled_indexes.clone(),
            None if table.disable_index && initial_full_load && !chunks.is_empty() => {
                let captured = self.target.disable_indexes(target_table).await?;
                if !captured.is_empty() {
                    self.tracker
                        .mark_indexes_disabled(run.run_id, key, &captured)
                        .await?;
                }
                Some(captured)
            }
            None => None,
        };

        let worker = Arc::new(MigrationWorker::new(WorkerContext {
            source: self.source.clone(),
            target: self.target.clone(),
            source_table: run.source_table.clone(),
            target_table: target_table.clone(),
            table: table.clone(),
            columns,
            initial_full_load,
            target_truncated: truncated,
            global_watermark: target_watermark,
            retry: RetryPolicy::from_config(&self.config.migration),
            sub_batch_sizes: self.config.migration.get_sub_batch_sizes(),
            label: key.to_string(),
        }));

        let report = self.dispatch(run, worker, chunks).await;
        debug!(
            "{}: {} chunks completed, {} failed, {} not started this pass ({} rows)",
            key, report.completed, report.failed, report.not_started, report.rows
        );

        let progress = self.tracker.get_table_progress(run.run_id, key).await?;
        action.rows_copied = progress.rows_copied;
        action.chunks_completed = progress.completed;
        action.chunks_failed = progress.failed;
        if progress.failed > 0 {
            action.failed_chunks = self
                .tracker
                .get_pending_chunks(run.run_id, key)
                .await?
                .into_iter()
                .filter(|c| c.status == TaskStatus::Failed)
                .map(|c| ChunkFailure {
                    chunk_id: c.descriptor.chunk_id,
                    error: c.error_message.unwrap_or_default(),
                })
                .collect();
        }

        let floor = self.config.migration.get_success_rate_floor();
        let (state, status, error) = if let Some(e) = report.systemic {
            (TableState::Failed, TaskStatus::Failed, Some(e))
        } else if report.not_started > 0 || progress.pending + progress.in_progress > 0 {
            (TableState::Interrupted, TaskStatus::InProgress, None)
        } else if progress.failed == 0 {
            (TableState::Completed, TaskStatus::Completed, None)
        } else {
            let rate = progress.completed as f64 / progress.total() as f64;
            if rate < floor {
                let message = format!(
                    "{} of {} chunks failed; success rate {:.0}% is below the {:.0}% floor",
                    progress.failed,
                    progress.total(),
                    rate * 100.0,
                    floor * 100.0
                );
                (TableState::Failed, TaskStatus::Failed, Some(message))
            } else {
                // Left in progress so a resume retries the failed chunks.
                let message = format!("{} of {} chunks failed", progress.failed, progress.total());
                (TableState::Partial, TaskStatus::InProgress, Some(message))
            }
        };

        self.tracker
            .update_table_status(
                run.run_id,
                key,
                TableUpdate {
                    status,
                    total_chunks: Some(progress.total() as i32),
                    completed_chunks: Some(progress.completed as i32),
                    failed_chunks: Some(progress.failed as i32),
                    rows_copied: Some(progress.rows_copied),
                    error_message: error.clone(),
                },
            )
            .await?;

        if let Some(captured) = captured {
            if state == TableState::Interrupted {
                info!(
                    "{}: indexes stay dropped until the table finishes; their definitions are in the ledger",
                    key
                );
            } else {
                match self.target.restore_indexes(target_table, &captured).await {
                    Ok(()) => {
                        self.tracker
                            .mark_indexes_restored(run.run_id, key)
                            .await?;
                    }
                    Err(e) => {
                        warn!("{}: {}", key, e);
                        action.notes.push(e.to_string());
                    }
                }
            }
        }

        if matches!(state, TableState::Completed | TableState::Partial) && progress.rows_copied > 0 {
            if let Err(e) = self.target.analyze(target_table).await {
                warn!("{}: ANALYZE failed: {}", key, e);
            }
        }

        action.target_rows_after = match self.target.row_count(target_table).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("{}: could not count target rows: {}", key, e);
                None
            }
        };
        action.status = state;
        action.error = error;

        match state {
            TableState::Completed => info!("{}: completed ({} rows)", key, action.rows_copied),
            TableState::Partial => warn!(
                "{}: partially completed ({} rows, {} chunks failed)",
                key, action.rows_copied, action.chunks_failed
            ),
            TableState::Interrupted => info!(
                "{}: interrupted ({} rows so far, resumable)",
                key, action.rows_copied
            ),
            TableState::Failed => error!(
                "{}: failed: {}",
                key,
                action.error.as_deref().unwrap_or("unknown error")
            ),
            TableState::Skipped => {}
        }
        Ok(())
    }

    /// Columns present in both source and target, with the key columns checked.
    async fn resolve_columns(&self, run: &TableRun<'_>) -> Result<Vec<ColumnMapping>> {
        let systemic = |message: String| MigrateError::Systemic {
            table: run.target_table.full_name(),
            message,
        };

        let target_columns = self.target.columns(&run.target_table).await?;
        if target_columns.is_empty() {
            return Err(systemic("target table does not exist".into()));
        }
        let source_columns = self.source.columns(&run.source_table).await?;
        let columns = map_columns(&source_columns, &target_columns);
        if columns.is_empty() {
            return Err(systemic(format!(
                "no columns in common with {}",
                run.source_table.full_name()
            )));
        }
        for key in &run.table.uniqueness_columns {
            if !columns.iter().any(|m| &m.target == key) {
                return Err(systemic(format!(
                    "uniqueness column {} is not loaded from the source",
                    key
                )));
            }
        }

        let skipped = target_columns.len() - columns.len();
        if skipped > 0 {
            debug!(
                "{}: {} target columns have no source counterpart",
                run.key, skipped
            );
        }
        Ok(columns)
    }

    async fn plan_chunks(
        &self,
        run: &TableRun<'_>,
        batch_size: usize,
        truncated: bool,
        target_watermark: Option<&str>,
        columns: &[ColumnMapping],
    ) -> Result<Vec<ChunkDescriptor>> {
        let table = run.table;
        let (kind, column) = select_strategy(table);

        // An incremental plan over the watermark column only needs the dates
        // past the target's high-water mark.
        let watermark_filter = match (kind, column.as_deref(), target_watermark) {
            (StrategyKind::DateRange, Some(c), Some(wm))
                if table.is_incremental() && table.source_watermark.as_deref() == Some(c) =>
            {
                Some(format!("{} > {}", quote_ident(c), quote_literal(wm)))
            }
            _ => None,
        };

        let options = PlanOptions {
            sort_column: table.sort_column.clone(),
            uniqueness_columns: table.uniqueness_columns.clone(),
            watermark_filter,
        };
        let request = ChunkRequest::new(run.source_table.clone(), table.resolved_filter(), batch_size);
        let strategy = build_strategy(kind, column.clone(), request, options);
        let mut chunks = strategy
            .create_chunks(self.source.as_ref())
            .await
            .map_err(|e| MigrateError::chunking(run.key.to_string(), e.to_string()))?;

        if truncated {
            apply_copy_mode(&mut chunks, None, true);
        } else if kind == StrategyKind::NumericRange {
            let target_column = column
                .as_deref()
                .and_then(|c| columns.iter().find(|m| m.source == c || m.target == c))
                .map(|m| m.target.clone());
            if let Some(target_column) = target_column {
                match self.target.key_range(&run.target_table, &target_column).await {
                    Ok(range) => apply_copy_mode(&mut chunks, range, false),
                    Err(e) => warn!(
                        "{}: key range lookup failed, workers will choose load mode: {}",
                        run.key, e
                    ),
                }
            }
        }

        info!(
            "{}: {} chunking on {} -> {} chunks",
            run.key,
            kind,
            column.as_deref().unwrap_or("-"),
            chunks.len()
        );
        Ok(chunks)
    }

    /// Run chunks on a bounded pool, collecting outcomes as they finish.
    ///
    /// No chunk starts once the stop signal fires or a chunk has failed
    /// systemically; chunks already running are left to finish.
    async fn dispatch(
        &self,
        run: &TableRun<'_>,
        worker: Arc<MigrationWorker>,
        chunks: Vec<ChunkDescriptor>,
    ) -> DispatchReport {
        let semaphore = Arc::new(Semaphore::new(run.threads));
        let abort = Arc::new(AtomicBool::new(false));
        let mut running = FuturesUnordered::new();
        let mut report = DispatchReport::default();

        info!(
            "{}: dispatching {} chunks on {} workers",
            run.key,
            chunks.len(),
            run.threads
        );

        for chunk in chunks {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    report.not_started += 1;
                    continue;
                }
            };
            if abort.load(Ordering::SeqCst) || run.stop.is_stopped() {
                drop(permit);
                report.not_started += 1;
                continue;
            }

            let tracker = self.tracker.clone();
            let worker = worker.clone();
            let abort = abort.clone();
            let run_id = run.run_id.to_string();
            let key = run.key.clone();
            running.push(tokio::spawn(async move {
                let _permit = permit;
                execute_chunk(tracker.as_ref(), &run_id, &key, &worker, chunk, &abort).await
            }));
        }

        if report.not_started > 0 {
            if let Some(reason) = run.stop.reason() {
                info!(
                    "{}: {}, {} chunks left pending",
                    run.key, reason, report.not_started
                );
            }
        }

        while let Some(joined) = running.next().await {
            match joined {
                Ok(ChunkRun::Completed { rows }) => {
                    report.completed += 1;
                    report.rows += rows;
                }
                Ok(ChunkRun::Failed { error, systemic }) => {
                    report.failed += 1;
                    if systemic && report.systemic.is_none() {
                        report.systemic = Some(error);
                    }
                }
                Err(e) => {
                    error!("{}: chunk task panicked: {}", run.key, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Check connectivity to the warehouse and the target.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.as_ref().err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.as_ref().err().map(|e| e.to_string()),
            healthy: source.is_ok() && target.is_ok(),
        })
    }

    /// Ledger contents of a run.
    pub async fn run_report(&self, run_id: &str) -> Result<RunReport> {
        let run = self
            .tracker
            .get_run(run_id)
            .await?
            .ok_or_else(|| MigrateError::State(format!("run {} not found", run_id)))?;
        let tables = self.tracker.list_table_statuses(run_id).await?;
        Ok(RunReport { run, tables })
    }
}

/// Execute one chunk and record its outcome in the ledger.
async fn execute_chunk(
    tracker: &dyn StatusTracker,
    run_id: &str,
    key: &TableKey,
    worker: &MigrationWorker,
    chunk: ChunkDescriptor,
    abort: &AtomicBool,
) -> ChunkRun {
    let id = chunk.chunk_id;
    if let Err(e) = tracker
        .update_chunk_status(run_id, key, id, ChunkUpdate::in_progress())
        .await
    {
        warn!("{} chunk {}: could not mark in progress: {}", key, id, e);
    }

    match worker.process_chunk(&chunk).await {
        Ok(rows) => match tracker
            .update_chunk_status(run_id, key, id, ChunkUpdate::completed(rows as i64))
            .await
        {
            Ok(()) => ChunkRun::Completed { rows },
            Err(e) => {
                error!(
                    "{} chunk {}: loaded {} rows but could not record it: {}",
                    key, id, rows, e
                );
                ChunkRun::Failed {
                    error: e.to_string(),
                    systemic: false,
                }
            }
        },
        Err(e) => {
            let systemic = e.is_systemic();
            if systemic {
                abort.store(true, Ordering::SeqCst);
                error!("{} chunk {}: systemic failure, aborting table: {}", key, id, e);
            } else {
                error!("{} chunk {}: failed: {}", key, id, e);
            }
            if let Err(le) = tracker
                .update_chunk_status(run_id, key, id, ChunkUpdate::failed(e.to_string()))
                .await
            {
                warn!("{} chunk {}: could not record failure: {}", key, id, le);
            }
            ChunkRun::Failed {
                error: e.to_string(),
                systemic,
            }
        }
    }
}
