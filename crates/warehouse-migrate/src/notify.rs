//! Run summaries and where they are delivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::state::RunStatus;

/// How a table ended up in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    /// Every chunk loaded.
    Completed,
    /// Some chunks failed, but fewer than the success-rate floor allows.
    Partial,
    /// Aborted on a systemic error or below the success-rate floor.
    Failed,
    /// Stopped by cancellation or the deadline with work left.
    Interrupted,
    /// Already completed earlier in a resumed run.
    Skipped,
}

impl TableState {
    pub fn as_str(self) -> &'static str {
        match self {
            TableState::Completed => "completed",
            TableState::Partial => "partial",
            TableState::Failed => "failed",
            TableState::Interrupted => "interrupted",
            TableState::Skipped => "skipped",
        }
    }

    /// Nothing left to do for this table.
    pub fn is_done(self) -> bool {
        matches!(self, TableState::Completed | TableState::Skipped)
    }
}

/// A chunk left failed, with the last error recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: i32,
    pub error: String,
}

/// Outcome of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAction {
    pub source_name: String,
    pub source_table: String,
    pub target_table: String,
    pub status: TableState,
    /// Rows persisted for this table across the whole run.
    pub rows_copied: i64,
    pub target_rows_before: Option<i64>,
    pub target_rows_after: Option<i64>,
    pub chunks_completed: i64,
    pub chunks_failed: i64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operator-facing warnings, such as a refused truncate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Chunks still failed when the table finished, ordered by id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_chunks: Vec<ChunkFailure>,
}

impl TableAction {
    pub fn label(&self) -> String {
        format!("{}.{}", self.source_name, self.source_table)
    }

    /// One line per failed chunk.
    pub fn chunk_failure_lines(&self) -> Vec<String> {
        self.failed_chunks
            .iter()
            .map(|f| format!("chunk {} failed: {}", f.chunk_id, f.error))
            .collect()
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// Whether an earlier run was picked up.
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Set when the run stopped early on cancellation or deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
    pub tables: Vec<TableAction>,
}

impl RunSummary {
    pub fn tables_completed(&self) -> usize {
        self.tables.iter().filter(|t| t.status.is_done()).count()
    }

    pub fn tables_failed(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| t.status == TableState::Failed)
            .count()
    }

    pub fn rows_copied(&self) -> i64 {
        self.tables.iter().map(|t| t.rows_copied).sum()
    }

    /// Average throughput (rows/second).
    pub fn rows_per_second(&self) -> i64 {
        if self.duration_seconds > 0.0 {
            (self.rows_copied() as f64 / self.duration_seconds) as i64
        } else {
            0
        }
    }

    /// Tables that need attention, with their error.
    pub fn failed_tables(&self) -> Vec<(String, Option<String>)> {
        self.tables
            .iter()
            .filter(|t| !t.status.is_done())
            .map(|t| (t.label(), t.error.clone()))
            .collect()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable report.
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "Run {} {}\n  Duration: {:.2}s\n  Tables: {}/{}\n  Rows: {} ({} rows/sec)\n",
            self.run_id,
            self.status,
            self.duration_seconds,
            self.tables_completed(),
            self.tables.len(),
            self.rows_copied(),
            self.rows_per_second()
        );
        if let Some(reason) = &self.stopped {
            out.push_str(&format!("  Stopped early: {}\n", reason));
        }
        for t in &self.tables {
            out.push_str(&format!(
                "  {:<40} {:<11} {:>12} rows  chunks {}/{}",
                t.label(),
                t.status.as_str(),
                t.rows_copied,
                t.chunks_completed,
                t.chunks_completed + t.chunks_failed
            ));
            if let Some(e) = &t.error {
                out.push_str(&format!("  error: {}", e));
            }
            out.push('\n');
            for note in &t.notes {
                out.push_str(&format!("      note: {}\n", note));
            }
            for line in t.chunk_failure_lines() {
                out.push_str(&format!("      {}\n", line));
            }
        }
        out
    }
}

/// Receives the summary when a run finishes.
#[async_trait]
pub trait SummarySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes the summary to the log.
#[derive(Debug, Default)]
pub struct LogSummarySink;

#[async_trait]
impl SummarySink for LogSummarySink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, summary: &RunSummary) -> Result<()> {
        info!(
            "Run {} {}: {}/{} tables, {} rows in {:.1}s ({} rows/s)",
            summary.run_id,
            summary.status,
            summary.tables_completed(),
            summary.tables.len(),
            summary.rows_copied(),
            summary.duration_seconds,
            summary.rows_per_second()
        );
        for (table, error) in summary.failed_tables() {
            warn!(
                "{}: not finished{}",
                table,
                error.map(|e| format!(" ({})", e)).unwrap_or_default()
            );
        }
        for t in &summary.tables {
            for line in t.chunk_failure_lines() {
                warn!("{}: {}", t.label(), line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(table: &str, status: TableState, rows: i64) -> TableAction {
        TableAction {
            source_name: "analytics".into(),
            source_table: table.into(),
            target_table: table.to_lowercase(),
            status,
            rows_copied: rows,
            target_rows_before: Some(0),
            target_rows_after: Some(rows),
            chunks_completed: 1,
            chunks_failed: 0,
            duration_seconds: 1.0,
            error: (status == TableState::Failed).then(|| "boom".to_string()),
            notes: vec![],
            failed_chunks: vec![],
        }
    }

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: "r1".into(),
            status: RunStatus::Partial,
            resumed: false,
            started_at: now,
            completed_at: now,
            duration_seconds: 2.0,
            stopped: None,
            tables: vec![
                action("EVENTS", TableState::Completed, 100),
                action("USERS", TableState::Skipped, 50),
                action("ORDERS", TableState::Failed, 0),
            ],
        }
    }

    #[test]
    fn test_summary_counts() {
        let s = summary();
        assert_eq!(s.tables_completed(), 2);
        assert_eq!(s.tables_failed(), 1);
        assert_eq!(s.rows_copied(), 150);
        assert_eq!(s.rows_per_second(), 75);
        assert_eq!(
            s.failed_tables(),
            vec![("analytics.ORDERS".to_string(), Some("boom".to_string()))]
        );
    }

    #[test]
    fn test_summary_json_and_text() {
        let s = summary();
        let json: serde_json::Value = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["tables"][2]["status"], "failed");
        assert!(json["tables"][0].get("error").is_none());

        let text = s.render_text();
        assert!(text.contains("Run r1 partial"));
        assert!(text.contains("error: boom"));
    }

    #[test]
    fn test_failed_chunks_are_listed() {
        let mut s = summary();
        s.tables[2].chunks_failed = 2;
        s.tables[2].failed_chunks = vec![
            ChunkFailure {
                chunk_id: 3,
                error: "invalid byte sequence for encoding \"UTF8\"".into(),
            },
            ChunkFailure {
                chunk_id: 7,
                error: "connection reset by peer".into(),
            },
        ];

        assert_eq!(
            s.tables[2].chunk_failure_lines(),
            vec![
                "chunk 3 failed: invalid byte sequence for encoding \"UTF8\"".to_string(),
                "chunk 7 failed: connection reset by peer".to_string(),
            ]
        );
        let text = s.render_text();
        assert!(text.contains("      chunk 3 failed: invalid byte sequence"));
        assert!(text.contains("      chunk 7 failed: connection reset by peer"));

        let json: serde_json::Value = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(json["tables"][2]["failed_chunks"][1]["chunk_id"], 7);
        assert!(json["tables"][0].get("failed_chunks").is_none());
    }

    #[tokio::test]
    async fn test_log_sink_delivers() {
        let sink = LogSummarySink;
        assert_eq!(sink.name(), "log");
        let mut s = summary();
        s.tables[2].failed_chunks = vec![ChunkFailure {
            chunk_id: 1,
            error: "boom".into(),
        }];
        sink.deliver(&s).await.unwrap();
    }
}
