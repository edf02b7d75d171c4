//! Source reader for warehouses that speak the PostgreSQL wire protocol.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

use super::{NumericBounds, RowBatch, SourceReader, SourceTable};
use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::pg::{connect_pool, quote_ident, Endpoint};

/// Pooled warehouse reader.
pub struct WarehouseReader {
    pool: Pool,
}

impl WarehouseReader {
    /// Connect to the warehouse described by `config`.
    pub async fn connect(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let endpoint = Endpoint {
            host: &config.host,
            port: config.port,
            database: &config.database,
            user: &config.user,
            password: &config.password,
            ssl_mode: &config.ssl_mode,
        };
        let pool = connect_pool(endpoint, max_conns, "source warehouse").await?;
        Ok(Self { pool })
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }
}

#[async_trait]
impl SourceReader for WarehouseReader {
    async fn count_rows(&self, table: &SourceTable, filter: &str) -> Result<i64> {
        let client = self.client("getting connection for count_rows").await?;
        let sql = format!(
            "SELECT COUNT(*)::int8 FROM {} WHERE {}",
            table.qualified(),
            filter
        );
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(row.get(0))
    }

    async fn numeric_bounds(
        &self,
        table: &SourceTable,
        column_expr: &str,
        filter: &str,
    ) -> Result<NumericBounds> {
        let client = self.client("getting connection for numeric_bounds").await?;
        let sql = format!(
            "SELECT MIN({c})::int8, MAX({c})::int8, COUNT({c})::int8, COUNT(*)::int8 FROM {} WHERE {}",
            table.qualified(),
            filter,
            c = column_expr
        );
        debug!("numeric bounds: {}", sql);
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(MigrateError::from_source_db)?;

        let min: Option<i64> = row.get(0);
        let max: Option<i64> = row.get(1);
        Ok(NumericBounds {
            range: min.zip(max),
            rows: row.get(2),
            total: row.get(3),
        })
    }

    async fn value_counts(
        &self,
        table: &SourceTable,
        column: &str,
        sort_column: &str,
        filter: &str,
    ) -> Result<Vec<(String, i64)>> {
        let client = self.client("getting connection for value_counts").await?;
        let col = quote_ident(column);
        let sql = if sort_column == column {
            format!(
                "SELECT {c}::text, COUNT(*)::int8 FROM {} WHERE ({}) AND {c} IS NOT NULL \
                 GROUP BY {c} ORDER BY {c}",
                table.qualified(),
                filter,
                c = col
            )
        } else {
            // Order each value by the earliest sort key it owns.
            format!(
                "SELECT {c}::text, COUNT(*)::int8 FROM {} WHERE ({}) AND {c} IS NOT NULL \
                 GROUP BY {c} ORDER BY MIN({s}), {c}",
                table.qualified(),
                filter,
                c = col,
                s = quote_ident(sort_column)
            )
        };
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn date_counts(
        &self,
        table: &SourceTable,
        column: &str,
        filter: &str,
    ) -> Result<Vec<(String, i64)>> {
        let client = self.client("getting connection for date_counts").await?;
        let sql = format!(
            "SELECT to_char({c}::date, 'YYYY-MM-DD'), COUNT(*)::int8 FROM {} \
             WHERE ({}) AND {c} IS NOT NULL GROUP BY {c}::date ORDER BY {c}::date",
            table.qualified(),
            filter,
            c = quote_ident(column)
        );
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    async fn column_type(&self, table: &SourceTable, column: &str) -> Result<Option<String>> {
        let client = self.client("getting connection for column_type").await?;
        let row = client
            .query_opt(
                "SELECT lower(data_type) FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
                &[&table.schema, &table.name, &column],
            )
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn columns(&self, table: &SourceTable) -> Result<Vec<String>> {
        let client = self.client("getting connection for columns").await?;
        let rows = client
            .query(
                "SELECT column_name FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn fetch(&self, query: &str) -> Result<RowBatch> {
        let client = self.client("getting connection for fetch").await?;
        let rows = client
            .query(query, &[])
            .await
            .map_err(MigrateError::from_source_db)?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut batch = RowBatch {
            columns,
            rows: Vec::with_capacity(rows.len()),
        };
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value: Option<String> = row
                    .try_get(idx)
                    .map_err(MigrateError::from_source_db)?;
                values.push(value);
            }
            batch.rows.push(values);
        }
        Ok(batch)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("testing source connection").await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(MigrateError::from_source_db)?;
        Ok(())
    }
}
