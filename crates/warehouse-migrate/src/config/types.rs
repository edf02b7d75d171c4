//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source warehouse connection.
    pub source: SourceConfig,

    /// Target database (PostgreSQL) connection. Also hosts the status ledger.
    pub target: TargetConfig,

    /// Global migration behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Named groups of tables to migrate.
    #[serde(default)]
    pub sources: Vec<SourceGroup>,
}

/// Source warehouse configuration.
///
/// The warehouse is reached over the PostgreSQL wire protocol
/// (Redshift, Greenplum and similar analytical engines speak it).
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Warehouse host.
    pub host: String,

    /// Warehouse port (default: 5439).
    #[serde(default = "default_warehouse_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Maximum pooled connections. Defaults to twice the worker count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Maximum pooled connections. Defaults to twice the worker count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Migration behavior configuration.
/// Fields use Option<T> to distinguish "not set" from "explicitly set";
/// the `get_*` accessors supply the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Global worker pool size (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_threads: Option<usize>,

    /// Target rows per chunk (default: 10000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Rows per chunk used instead of `batch_size` on an initial full load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size_copy_mode: Option<usize>,

    /// Attempts per chunk for transient errors (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,

    /// First backoff wait in seconds (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_min_wait_secs: Option<u64>,

    /// Backoff cap in seconds (default: 60).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_wait_secs: Option<u64>,

    /// Sub-batch ladder used after memory pressure (default: 10000, 5000, 2000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_batch_sizes: Option<Vec<usize>>,

    /// Minimum fraction of successful chunks for a table to count as completed (default: 0.5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate_floor: Option<f64>,

    /// Wall-clock budget for the whole run. No new work is started past it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_seconds: Option<u64>,

    /// Oldest run (in hours) still considered for automatic resume (default: 12).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_max_age_hours: Option<i64>,

    /// Schema holding the status ledger (default: "migration_status").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_schema: Option<String>,
}

impl MigrationConfig {
    pub fn get_parallel_threads(&self) -> usize {
        self.parallel_threads.unwrap_or(4)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(10_000)
    }

    pub fn get_max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts.unwrap_or(3)
    }

    pub fn get_retry_min_wait_secs(&self) -> u64 {
        self.retry_min_wait_secs.unwrap_or(4)
    }

    pub fn get_retry_max_wait_secs(&self) -> u64 {
        self.retry_max_wait_secs.unwrap_or(60)
    }

    pub fn get_sub_batch_sizes(&self) -> Vec<usize> {
        self.sub_batch_sizes
            .clone()
            .unwrap_or_else(|| vec![10_000, 5_000, 2_000])
    }

    pub fn get_success_rate_floor(&self) -> f64 {
        self.success_rate_floor.unwrap_or(0.5)
    }

    pub fn get_resume_max_age_hours(&self) -> i64 {
        self.resume_max_age_hours.unwrap_or(12)
    }

    pub fn get_status_schema(&self) -> String {
        self.status_schema
            .clone()
            .unwrap_or_else(|| "migration_status".to_string())
    }
}

/// A named group of tables sharing source and target schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGroup {
    /// Name used for selection on the command line and in the ledger.
    pub name: String,

    /// Disabled groups are skipped unless selected explicitly.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Schema in the warehouse.
    pub source_schema: String,

    /// Schema in the target database.
    pub target_schema: String,

    /// Tables in this group.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl SourceGroup {
    /// Tables that are enabled for migration.
    pub fn enabled_tables(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter().filter(|t| t.enabled)
    }
}

/// Per-table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Source table name.
    pub source: String,

    /// Target table name.
    pub target: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Source-side filter predicate (opaque SQL fragment, default `1=1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Partition column(s). Only the first one drives chunking.
    #[serde(default)]
    pub chunking_columns: Vec<String>,

    /// Declared types of `chunking_columns`, same length.
    #[serde(default)]
    pub chunking_column_types: Vec<String>,

    /// Ordering column for grouped-values and offset chunking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_column: Option<String>,

    /// Merge key in the target. Empty means append-only loads.
    #[serde(default)]
    pub uniqueness_columns: Vec<String>,

    /// Watermark column in the warehouse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_watermark: Option<String>,

    /// Watermark column in the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_watermark: Option<String>,

    /// Empty the target table before loading (only when provably safe).
    #[serde(default)]
    pub truncate_onstart: bool,

    /// Never update existing rows; conflicting bulk batches are discarded.
    #[serde(default)]
    pub insert_only_mode: bool,

    /// Drop secondary indexes during an initial full load.
    #[serde(default)]
    pub disable_index: bool,

    /// Per-table override of `migration.batch_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Per-table override of `migration.parallel_threads`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_threads: Option<usize>,
}

impl TableConfig {
    /// Effective source filter.
    pub fn resolved_filter(&self) -> String {
        match self.filter.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => "1=1".to_string(),
        }
    }

    /// First chunking column and its declared type.
    pub fn chunking_column(&self) -> Option<(&str, &str)> {
        let column = self.chunking_columns.first()?;
        let data_type = self
            .chunking_column_types
            .first()
            .map(String::as_str)
            .unwrap_or("");
        Some((column.as_str(), data_type))
    }

    /// Incremental load: both watermarks configured and no truncate requested.
    pub fn is_incremental(&self) -> bool {
        self.source_watermark.is_some() && self.target_watermark.is_some() && !self.truncate_onstart
    }

    pub fn get_batch_size(&self, migration: &MigrationConfig) -> usize {
        self.batch_size.unwrap_or_else(|| migration.get_batch_size())
    }

    pub fn get_parallel_threads(&self, migration: &MigrationConfig) -> usize {
        self.parallel_threads
            .unwrap_or_else(|| migration.get_parallel_threads())
    }
}

// Default value functions for serde
fn default_warehouse_port() -> u16 {
    5439
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}
