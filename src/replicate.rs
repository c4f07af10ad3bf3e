//! Static-table replication and orphan scrubbing.
//!
//! Static tables (plan catalogs and the like) are identical on every shard
//! and are refreshed by pulling the source table through dblink inside a
//! deferred-constraints transaction. The comparison path reads entire
//! tables and is hard-capped; it must never be pointed at user data.

use indoc::formatdoc;
use tracing::{error, info};

use crate::config::MigrationConfig;
use crate::reflect::SchemaReflector;
use crate::shard::{ShardName, ShardRegistry};
use crate::sqlgen::{quote_ident, quote_literal, to_single_line};
use crate::{Error, Result};

/// Largest table the full-row comparison will touch.
const MAX_COMPARE_ROWS: i64 = 100_000;

pub struct TableReplicator {
    registry: ShardRegistry,
    reflector: SchemaReflector,
    config: MigrationConfig,
}

impl TableReplicator {
    pub fn new(registry: ShardRegistry, config: MigrationConfig) -> Self {
        let reflector = SchemaReflector::new(registry.clone());
        Self {
            registry,
            reflector,
            config,
        }
    }

    /// True when the table's contents differ between the two shards.
    ///
    /// Compares counts first, then full row text in primary-key order.
    /// Refuses tables above [`MAX_COMPARE_ROWS`] on either side.
    pub async fn table_data_differs(
        &self,
        table: &str,
        first: &ShardName,
        second: &ShardName,
    ) -> Result<bool> {
        let count_sql = format!(r#"SELECT COUNT(*) FROM {}"#, quote_ident(table));
        let count1: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(self.registry.pool(first)?)
            .await?;
        let count2: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(self.registry.pool(second)?)
            .await?;
        if count1 > MAX_COMPARE_ROWS || count2 > MAX_COMPARE_ROWS {
            return Err(Error::Precondition(format!(
                "table `{table}` exceeds {MAX_COMPARE_ROWS} rows, refusing full comparison"
            )));
        }
        if count1 != count2 {
            return Ok(true);
        }

        let order_by = self
            .reflector
            .primary_key_columns(table, first)
            .await?
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let data_sql = format!(
            r#"SELECT "t"::text FROM {table} "t" ORDER BY {order_by} DESC"#,
            table = quote_ident(table),
        );
        let rows1: Vec<String> = sqlx::query_scalar(&data_sql)
            .fetch_all(self.registry.pool(first)?)
            .await?;
        let rows2: Vec<String> = sqlx::query_scalar(&data_sql)
            .fetch_all(self.registry.pool(second)?)
            .await?;
        Ok(rows1 != rows2)
    }

    /// Refresh a static table on `destination` by pulling the rows straight
    /// from `source` through dblink. A no-op when the data already matches.
    pub async fn replicate_table(
        &self,
        table: &str,
        source: &ShardName,
        destination: &ShardName,
    ) -> Result<()> {
        if !self.config.static_tables.contains(table) {
            return Err(Error::Precondition(format!(
                "table `{table}` is not a static table"
            )));
        }
        if !self.table_data_differs(table, source, destination).await? {
            return Ok(());
        }
        info!(table, %source, %destination, "replicating static table");

        let description = self.reflector.describe(table, destination).await?;
        let columns = description
            .iter()
            .map(|col| quote_ident(&col.column))
            .collect::<Vec<_>>()
            .join(", ");
        let record_shape = crate::sqlgen::dblink_record_shape(&description);
        let inner = to_single_line(&format!(
            r#"SELECT {columns} FROM {table}"#,
            table = quote_ident(table),
        ));
        let refill = formatdoc! {r#"
            INSERT INTO {table} ({columns})
            SELECT {columns} FROM dblink(
                {conninfo},
                {inner}
            ) AS {record_shape}"#,
            table = quote_ident(table),
            conninfo = quote_literal(self.registry.conninfo(source)?),
            inner = quote_literal(&inner),
        };

        let mut conn = self.registry.pool(destination)?.acquire().await?;
        let result: Result<()> = async {
            sqlx::query("BEGIN").execute(conn.as_mut()).await?;
            sqlx::query("SET CONSTRAINTS ALL DEFERRED")
                .execute(conn.as_mut())
                .await?;
            // TRUNCATE is DDL and would take an exclusive lock; DELETE keeps
            // this an ordinary transactional rewrite.
            sqlx::query(&format!(r#"DELETE FROM {}"#, quote_ident(table)))
                .execute(conn.as_mut())
                .await?;
            sqlx::query(&refill).execute(conn.as_mut()).await?;
            sqlx::query("COMMIT").execute(conn.as_mut()).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(
                table,
                %source,
                %destination,
                error = %e,
                "static table replication failed, rolling back"
            );
            let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Run the configured orphan-scrubbing statements on one shard.
    pub async fn scrub_tables(&self, shard: &ShardName) -> Result<()> {
        let pool = self.registry.pool(shard)?;
        for statement in &self.config.scrub_statements {
            sqlx::raw_sql(statement).execute(pool).await?;
        }
        Ok(())
    }
}
