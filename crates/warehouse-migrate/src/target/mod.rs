//! Target store operations.
//!
//! Workers and the orchestrator talk to the target through [`TargetWriter`].
//! Row writes of a chunk go through a [`TargetSession`] opened from it, which
//! keeps every statement of the chunk on one connection. The production
//! implementation is [`PgTargetWriter`]; tests substitute an in-memory fake.

mod postgres;

pub use postgres::{PgTargetSession, PgTargetWriter};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pg::{escape_copy_text, qualify_table};
use crate::source::RowBatch;

/// A table in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetTable {
    pub schema: String,
    pub name: String,
}

impl TargetTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn qualified(&self) -> String {
        qualify_table(&self.schema, &self.name)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// How a staged batch is merged into the target.
#[derive(Debug, Clone, Copy)]
pub struct MergeSpec<'a> {
    /// Conflict key.
    pub key_columns: &'a [String],
    /// Existing rows are only overwritten by strictly newer values of this column.
    pub watermark: Option<&'a str>,
    /// Never update existing rows.
    pub insert_only: bool,
}

/// Secondary index and constraint DDL captured before dropping them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedIndexes {
    /// `(constraint name, definition)` pairs.
    pub constraints: Vec<(String, String)>,
    /// Full `CREATE INDEX` statements.
    pub indexes: Vec<String>,
}

impl CapturedIndexes {
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty() && self.indexes.is_empty()
    }
}

/// Write access to the target store.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Column names in ordinal order. Empty if the table does not exist.
    async fn columns(&self, table: &TargetTable) -> Result<Vec<String>>;

    async fn row_count(&self, table: &TargetTable) -> Result<i64>;

    /// `TRUNCATE ... CASCADE`.
    async fn truncate(&self, table: &TargetTable) -> Result<()>;

    /// Open a session pinned to one connection for the writes of a chunk.
    async fn session(&self) -> Result<Box<dyn TargetSession + '_>>;

    /// `MAX(column)` rendered as text, optionally restricted by `scope`.
    async fn max_watermark(
        &self,
        table: &TargetTable,
        column: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>>;

    /// Existing integer key range, `None` when the table is empty.
    async fn key_range(&self, table: &TargetTable, column: &str) -> Result<Option<(i64, i64)>>;

    /// Drop non-unique secondary indexes plus foreign-key and check
    /// constraints, returning what is needed to recreate them.
    async fn disable_indexes(&self, table: &TargetTable) -> Result<CapturedIndexes>;

    async fn restore_indexes(&self, table: &TargetTable, captured: &CapturedIndexes)
        -> Result<()>;

    async fn analyze(&self, table: &TargetTable) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Row writes for one chunk, all on the same connection.
///
/// Staging tables live in the connection's session, so the staging COPY and
/// the merge that reads it must not be split across pool connections.
#[async_trait]
pub trait TargetSession: Send + Sync {
    /// Bulk-append a batch with COPY. All or nothing: a conflict rejects the
    /// whole batch. Returns rows written.
    async fn copy_rows(&self, table: &TargetTable, batch: &RowBatch) -> Result<u64>;

    /// Stage a batch and merge it on `spec.key_columns`. Returns rows inserted
    /// or updated; skipped conflicts are not counted.
    async fn upsert_rows(
        &self,
        table: &TargetTable,
        batch: &RowBatch,
        spec: MergeSpec<'_>,
    ) -> Result<u64>;

    /// Advance serial/identity sequences behind `key_columns` to the column
    /// maximum. Returns whether any sequence was found.
    async fn reset_sequence(&self, table: &TargetTable, key_columns: &[String]) -> Result<bool>;
}

/// Encode rows for `COPY ... FROM STDIN` in text format.
pub fn encode_copy_text(batch: &RowBatch) -> BytesMut {
    let mut buf = BytesMut::with_capacity(batch.rows.len() * 128);
    for row in &batch.rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                buf.put_u8(b'\t');
            }
            match value {
                Some(v) => buf.put_slice(escape_copy_text(v).as_bytes()),
                None => buf.put_slice(b"\\N"),
            }
        }
        buf.put_u8(b'\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_copy_text() {
        let batch = RowBatch {
            columns: vec!["id".into(), "note".into()],
            rows: vec![
                vec![Some("1".into()), Some("a\tb".into())],
                vec![Some("2".into()), None],
            ],
        };
        let buf = encode_copy_text(&batch);
        assert_eq!(&buf[..], b"1\ta\\tb\n2\t\\N\n");
    }

    #[test]
    fn test_target_table_names() {
        let t = TargetTable::new("analytics", "events");
        assert_eq!(t.full_name(), "analytics.events");
        assert_eq!(t.qualified(), "\"analytics\".\"events\"");
    }
}
