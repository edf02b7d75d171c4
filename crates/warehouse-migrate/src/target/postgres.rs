//! PostgreSQL target writer.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use futures::SinkExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    encode_copy_text, CapturedIndexes, MergeSpec, TargetSession, TargetTable, TargetWriter,
};
use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::pg::{connect_pool, quote_ident, quote_literal, Endpoint};
use crate::source::RowBatch;

/// Staging table name; one per session and dropped at commit.
const STAGING_TABLE: &str = "_wm_staging";

/// Pooled PostgreSQL writer.
pub struct PgTargetWriter {
    pool: Pool,
}

impl PgTargetWriter {
    /// Connect to the target described by `config`.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let endpoint = Endpoint {
            host: &config.host,
            port: config.port,
            database: &config.database,
            user: &config.user,
            password: &config.password,
            ssl_mode: &config.ssl_mode,
        };
        let pool = connect_pool(endpoint, max_conns, "target").await?;
        Ok(Self { pool })
    }

    /// Shared pool, also used by the status ledger.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }
}

/// Build the `INSERT ... SELECT ... ON CONFLICT` statement that merges the
/// staging table into the target.
pub(crate) fn merge_sql(
    target: &TargetTable,
    staging: &str,
    columns: &[String],
    spec: MergeSpec<'_>,
) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key_list = spec
        .key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !spec.key_columns.contains(c))
        .map(|c| format!("{q} = EXCLUDED.{q}", q = quote_ident(c)))
        .collect();

    let head = format!(
        "INSERT INTO {} AS tgt ({cols}) SELECT {cols} FROM {} ON CONFLICT ({})",
        target.qualified(),
        quote_ident(staging),
        key_list,
        cols = col_list
    );

    if spec.insert_only || updates.is_empty() {
        return format!("{} DO NOTHING", head);
    }

    let mut sql = format!("{} DO UPDATE SET {}", head, updates.join(", "));
    if let Some(wm) = spec.watermark.filter(|wm| columns.iter().any(|c| c == wm)) {
        let wm = quote_ident(wm);
        sql.push_str(&format!(
            " WHERE tgt.{wm} < EXCLUDED.{wm} OR tgt.{wm} IS NULL",
            wm = wm
        ));
    }
    sql
}

fn column_list(batch: &RowBatch) -> String {
    batch
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl TargetWriter for PgTargetWriter {
    async fn columns(&self, table: &TargetTable) -> Result<Vec<String>> {
        let client = self.client("getting connection for columns").await?;
        let rows = client
            .query(
                "SELECT column_name FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&table.schema, &table.name],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn row_count(&self, table: &TargetTable) -> Result<i64> {
        let client = self.client("getting connection for row_count").await?;
        let sql = format!("SELECT COUNT(*)::int8 FROM {}", table.qualified());
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn truncate(&self, table: &TargetTable) -> Result<()> {
        let client = self.client("getting connection for truncate").await?;
        let sql = format!("TRUNCATE TABLE {} CASCADE", table.qualified());
        client.execute(&sql, &[]).await?;
        info!("Truncated {}", table.full_name());
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn TargetSession + '_>> {
        let client = self.client("getting connection for chunk session").await?;
        Ok(Box::new(PgTargetSession {
            client: Mutex::new(client),
        }))
    }

    async fn max_watermark(
        &self,
        table: &TargetTable,
        column: &str,
        scope: Option<&str>,
    ) -> Result<Option<String>> {
        let client = self.client("getting connection for max_watermark").await?;
        let sql = match scope {
            Some(scope) => format!(
                "SELECT MAX({})::text FROM {} WHERE {}",
                quote_ident(column),
                table.qualified(),
                scope
            ),
            None => format!(
                "SELECT MAX({})::text FROM {}",
                quote_ident(column),
                table.qualified()
            ),
        };
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn key_range(&self, table: &TargetTable, column: &str) -> Result<Option<(i64, i64)>> {
        let client = self.client("getting connection for key_range").await?;
        let sql = format!(
            "SELECT MIN({c})::int8, MAX({c})::int8 FROM {}",
            table.qualified(),
            c = quote_ident(column)
        );
        let row = client.query_one(&sql, &[]).await?;
        let min: Option<i64> = row.get(0);
        let max: Option<i64> = row.get(1);
        Ok(min.zip(max))
    }

    async fn disable_indexes(&self, table: &TargetTable) -> Result<CapturedIndexes> {
        let client = self.client("getting connection for disable_indexes").await?;

        let constraint_rows = client
            .query(
                "SELECT con.conname, pg_get_constraintdef(con.oid)
                 FROM pg_catalog.pg_constraint con
                 JOIN pg_catalog.pg_class t ON t.oid = con.conrelid
                 JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = $1 AND t.relname = $2 AND con.contype IN ('f', 'c')",
                &[&table.schema, &table.name],
            )
            .await?;

        // Unique and exclusion indexes stay: the merge path depends on them.
        let index_rows = client
            .query(
                "SELECT i.relname, pg_get_indexdef(ix.indexrelid)
                 FROM pg_catalog.pg_index ix
                 JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
                 JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
                 JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = $1 AND t.relname = $2
                   AND NOT ix.indisprimary AND NOT ix.indisunique AND NOT ix.indisexclusion",
                &[&table.schema, &table.name],
            )
            .await?;

        let mut captured = CapturedIndexes::default();
        for row in constraint_rows {
            let name: String = row.get(0);
            let def: String = row.get(1);
            client
                .execute(
                    &format!(
                        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                        table.qualified(),
                        quote_ident(&name)
                    ),
                    &[],
                )
                .await?;
            captured.constraints.push((name, def));
        }
        for row in index_rows {
            let name: String = row.get(0);
            let def: String = row.get(1);
            client
                .execute(
                    &format!(
                        "DROP INDEX IF EXISTS {}.{}",
                        quote_ident(&table.schema),
                        quote_ident(&name)
                    ),
                    &[],
                )
                .await?;
            captured.indexes.push(def);
        }

        info!(
            "Dropped {} indexes and {} constraints on {}",
            captured.indexes.len(),
            captured.constraints.len(),
            table.full_name()
        );
        Ok(captured)
    }

    async fn restore_indexes(
        &self,
        table: &TargetTable,
        captured: &CapturedIndexes,
    ) -> Result<()> {
        let client = self.client("getting connection for restore_indexes").await?;
        let mut failures = 0;

        for def in &captured.indexes {
            if let Err(e) = client.batch_execute(def).await {
                warn!("{}: failed to recreate index: {} ({})", table.full_name(), def, e);
                failures += 1;
            }
        }
        for (name, def) in &captured.constraints {
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table.qualified(),
                quote_ident(name),
                def
            );
            if let Err(e) = client.batch_execute(&sql).await {
                warn!("{}: failed to recreate constraint {}: {}", table.full_name(), name, e);
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(MigrateError::transfer(
                table.full_name(),
                format!("{} indexes or constraints could not be restored", failures),
            ));
        }
        info!(
            "Restored {} indexes and {} constraints on {}",
            captured.indexes.len(),
            captured.constraints.len(),
            table.full_name()
        );
        Ok(())
    }

    async fn analyze(&self, table: &TargetTable) -> Result<()> {
        let client = self.client("getting connection for analyze").await?;
        client
            .batch_execute(&format!("ANALYZE {}", table.qualified()))
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("testing target connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

/// One pooled connection held for the writes of a chunk. Returned to the
/// pool on drop.
pub struct PgTargetSession {
    client: Mutex<Object>,
}

#[async_trait]
impl TargetSession for PgTargetSession {
    async fn copy_rows(&self, table: &TargetTable, batch: &RowBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let client = self.client.lock().await;
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            table.qualified(),
            column_list(batch)
        );

        let sink = client
            .copy_in(&copy_sql)
            .await
            .map_err(|e| MigrateError::load(table.full_name(), &e))?;
        tokio::pin!(sink);
        sink.send(encode_copy_text(batch).freeze())
            .await
            .map_err(|e| MigrateError::load(table.full_name(), &e))?;
        let written = sink
            .finish()
            .await
            .map_err(|e| MigrateError::load(table.full_name(), &e))?;

        debug!("COPY {} rows into {}", written, table.full_name());
        Ok(written)
    }

    async fn upsert_rows(
        &self,
        table: &TargetTable,
        batch: &RowBatch,
        spec: MergeSpec<'_>,
    ) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        if spec.key_columns.is_empty() {
            return Err(MigrateError::transfer(
                table.full_name(),
                "merge requires uniqueness columns",
            ));
        }
        let load_err = |e: tokio_postgres::Error| MigrateError::load(table.full_name(), &e);

        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(load_err)?;

        let cols = column_list(batch);
        tx.batch_execute(&format!(
            "CREATE TEMP TABLE {} ON COMMIT DROP AS SELECT {} FROM {} WITH NO DATA",
            quote_ident(STAGING_TABLE),
            cols,
            table.qualified()
        ))
        .await
        .map_err(load_err)?;

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            quote_ident(STAGING_TABLE),
            cols
        );
        let sink = tx.copy_in(&copy_sql).await.map_err(load_err)?;
        tokio::pin!(sink);
        sink.send(encode_copy_text(batch).freeze())
            .await
            .map_err(load_err)?;
        sink.finish().await.map_err(load_err)?;

        let sql = merge_sql(table, STAGING_TABLE, &batch.columns, spec);
        debug!("merge: {}", sql);
        let affected = tx.execute(&sql, &[]).await.map_err(load_err)?;
        tx.commit().await.map_err(load_err)?;
        Ok(affected)
    }

    async fn reset_sequence(&self, table: &TargetTable, key_columns: &[String]) -> Result<bool> {
        let client = self.client.lock().await;
        let mut found = false;

        for col in key_columns {
            let row = client
                .query_one(
                    "SELECT pg_get_serial_sequence($1, $2)",
                    &[&table.qualified(), col],
                )
                .await?;
            let seq: Option<String> = row.get(0);
            if let Some(seq) = seq {
                let sql = format!(
                    "SELECT setval({}::regclass, COALESCE((SELECT MAX({}) FROM {}), 1), true)",
                    quote_literal(&seq),
                    quote_ident(col),
                    table.qualified()
                );
                client.execute(&sql, &[]).await?;
                info!("Reset sequence {} for {}", seq, table.full_name());
                found = true;
            }
        }
        Ok(found)
    }
}
