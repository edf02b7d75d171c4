//! # warehouse-migrate
//!
//! Chunked, resumable migration of warehouse tables into PostgreSQL.
//!
//! Each configured table is split into chunks by a strategy chosen from its
//! partition column, and the chunks are loaded in parallel with:
//!
//! - **Bulk COPY** into empty or truncated targets
//! - **Staged upsert** keyed on uniqueness columns for incremental loads
//! - **Sub-batching** when the source runs out of memory on a chunk
//! - **Resume** from a status ledger kept in the target database
//!
//! ## Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use warehouse_migrate::{Config, Orchestrator, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config, None).await?;
//!     let summary = orchestrator
//!         .run(&RunOptions::default(), CancellationToken::new())
//!         .await?;
//!     println!("Migrated {} rows", summary.rows_copied());
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod pg;
pub mod source;
pub mod state;
pub mod target;
pub mod worker;

// Re-exports for convenient access
pub use chunking::{ChunkDescriptor, ChunkingStrategy, StrategyKind};
pub use config::{Config, MigrationConfig, SourceConfig, SourceGroup, TableConfig, TargetConfig};
pub use error::{ErrorKind, MigrateError, Result};
pub use notify::{
    ChunkFailure, LogSummarySink, RunSummary, SummarySink, TableAction, TableState,
};
pub use orchestrator::{plan, HealthCheckResult, Orchestrator, RunOptions, RunReport, TablePlan};
pub use source::{NumericBounds, SourceReader, WarehouseReader};
pub use state::{DbStatusTracker, MemoryStatusTracker, RunStatus, StatusTracker, TaskStatus};
pub use target::{PgTargetSession, PgTargetWriter, TargetSession, TargetWriter};
pub use worker::{MigrationWorker, RetryPolicy};
