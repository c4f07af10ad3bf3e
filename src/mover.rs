//! User-level data movement: dump, cross-shard copy, delete, and the
//! combined move.
//!
//! All three walks share the same traversal: the seed table pairs plus every
//! table carrying a user-id column, with hand-configured additional relations
//! applied first and discovered foreign-key dependencies backfilled after.
//! Per-table work runs inside savepoints driven by a bounded retry queue, so
//! ordering problems resolve themselves without a topological sort.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, TablePair};
use crate::error::{classify, is_lock_contention, ViolationKind};
use crate::hooks::{NoopEventBus, ShardEventBus};
use crate::metrics::{record_table_copied, record_table_deleted};
use crate::reflect::SchemaReflector;
use crate::shard::{ShardName, ShardRegistry};
use crate::sqlgen::{self, in_list, quote_ident, to_single_line};
use crate::worklist::RetryQueue;
use crate::{Error, Result, RowCounts, WithContext};

/// Options for [`UserDataMover::copy_users`].
#[derive(Clone, Debug)]
pub struct CopyOptions {
    pub deactivate_triggers: bool,
    pub manage_transactions: bool,
    /// When `false` the destination transaction is left open and handed back
    /// to the caller for chained commit ordering.
    pub commit_destination: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            deactivate_triggers: true,
            manage_transactions: true,
            commit_destination: true,
        }
    }
}

/// Options for [`UserDataMover::delete_users`].
#[derive(Clone, Debug)]
pub struct DeleteOptions {
    pub manage_transactions: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            manage_transactions: true,
        }
    }
}

/// Ordered dump of a set of users as replayable SQL, sectioned per table
/// with `__pre__` / `__post__` transaction wrappers at the edges.
#[derive(Clone, Debug)]
pub struct MigrationDump {
    sections: Vec<(String, Vec<String>)>,
}

impl MigrationDump {
    pub const PRE_SECTION: &'static str = "__pre__";
    pub const POST_SECTION: &'static str = "__post__";

    fn push(&mut self, section: &str, statement: String) {
        match self.sections.iter_mut().find(|(name, _)| name == section) {
            Some((_, statements)) => statements.push(statement),
            None => self
                .sections
                .push((section.to_string(), vec![statement])),
        }
    }

    pub fn sections(&self) -> &[(String, Vec<String>)] {
        &self.sections
    }

    /// Every statement in replay order.
    pub fn statements(&self) -> Vec<String> {
        self.sections
            .iter()
            .flat_map(|(_, statements)| statements.iter().cloned())
            .collect()
    }

    /// Render as an annotated SQL script.
    pub fn to_sql_string(&self, logical_shard_id: i64, epoch_seconds: i64) -> String {
        let mut out = format!("-- Dump of LogicalShard {logical_shard_id} on {epoch_seconds}\n");
        for (section, statements) in &self.sections {
            out.push_str(&format!("\n\n-- table = {section}\n"));
            for statement in statements {
                out.push_str(statement);
                out.push('\n');
            }
        }
        out
    }

    /// Render the flat statement list as JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.statements())?)
    }
}

/// Moves the complete data graph of a set of users between shards.
pub struct UserDataMover {
    registry: ShardRegistry,
    reflector: SchemaReflector,
    config: MigrationConfig,
    events: Arc<dyn ShardEventBus>,
}

impl UserDataMover {
    pub fn new(
        registry: ShardRegistry,
        reflector: SchemaReflector,
        config: MigrationConfig,
    ) -> Self {
        Self {
            registry,
            reflector,
            config,
            events: Arc::new(NoopEventBus),
        }
    }

    pub fn with_event_bus(mut self, events: Arc<dyn ShardEventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn reflector(&self) -> &SchemaReflector {
        &self.reflector
    }

    /// Seed pairs first, then every reflected user-id table, first
    /// occurrence wins.
    pub async fn table_pairs(&self, shard: &ShardName) -> Result<Vec<TablePair>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for pair in self
            .config
            .seed_table_pairs
            .iter()
            .cloned()
            .chain(self.reflector.tables_with_user_id_column(shard).await?)
        {
            if seen.insert(pair.table.clone()) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    async fn verify_users_exist(&self, user_ids: &[i64], shard: &ShardName) -> Result<()> {
        if user_ids.is_empty() {
            return Err(Error::Precondition("empty user id list".to_string()));
        }
        let found: i64 =
            sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "id" = ANY($1)"#)
                .bind(user_ids)
                .fetch_one(self.registry.pool(shard)?)
                .await?;
        if found != user_ids.len() as i64 {
            return Err(Error::Precondition(format!(
                "only {found} of {} users {user_ids:?} exist on {shard}",
                user_ids.len(),
            )));
        }
        Ok(())
    }

    fn row_counts_sql(&self, pairs: &[TablePair], user_ids: &[i64]) -> String {
        let ids = in_list(user_ids);
        pairs
            .iter()
            .filter(|pair| !self.config.table_ignored(&pair.table))
            .map(|pair| {
                format!(
                    r#"SELECT '{table}' "table", COUNT(*) "count" FROM {quoted} WHERE {column} IN ({ids})"#,
                    table = pair.table,
                    quoted = quote_ident(&pair.table),
                    column = quote_ident(&pair.user_id_column),
                )
            })
            .collect::<Vec<_>>()
            // UNION would drop a table whose count collides with another's.
            .join(" UNION ALL ")
    }

    /// Matching row count per table, from a single statement.
    pub async fn table_row_counts(
        &self,
        pairs: &[TablePair],
        user_ids: &[i64],
        shard: &ShardName,
    ) -> Result<RowCounts> {
        let sql = self.row_counts_sql(pairs, user_ids);
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .fetch_all(self.registry.pool(shard)?)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn table_row_counts_on(
        &self,
        pairs: &[TablePair],
        user_ids: &[i64],
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<RowCounts> {
        let sql = self.row_counts_sql(pairs, user_ids);
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql).fetch_all(conn.as_mut()).await?;
        Ok(rows.into_iter().collect())
    }

    /// Dump every record belonging to `user_ids` as a sectioned list of
    /// multi-row INSERT statements, wrapped in transaction pre/post blocks.
    pub async fn dump_users(
        &self,
        user_ids: &[i64],
        source: &ShardName,
        deactivate_triggers: bool,
    ) -> Result<MigrationDump> {
        info!(users = ?user_ids, shard = %source, "dumping users");
        self.verify_users_exist(user_ids, source).await?;

        let ids = in_list(user_ids);
        let pairs = self.table_pairs(source).await?;
        let tables: Vec<String> = pairs.iter().map(|p| p.table.clone()).collect();
        let dependencies = self.reflector.discover_dependencies(&tables, source).await?;
        let pool = self.registry.pool(source)?;

        let mut dump = MigrationDump {
            sections: Vec::new(),
        };
        if deactivate_triggers {
            if let Some(toggle) = &self.config.trigger_toggle {
                dump.push(
                    Self::PRE,
                    format!(
                        r#"ALTER TABLE {} DISABLE TRIGGER {};"#,
                        quote_ident(&toggle.table),
                        quote_ident(&toggle.trigger),
                    ),
                );
            }
        }
        dump.push(Self::PRE, "BEGIN;".to_string());
        dump.push(Self::PRE, "SET CONSTRAINTS ALL DEFERRED;".to_string());

        let mut populated: BTreeSet<String> = BTreeSet::new();

        for pair in &pairs {
            if self.config.table_ignored(&pair.table) || populated.contains(&pair.table) {
                continue;
            }
            if let Some(relations) = self.config.additional_relations.get(&pair.table) {
                for relation in relations {
                    if self.config.table_ignored(&relation.source_table) {
                        continue;
                    }
                    let pk = self
                        .reflector
                        .single_primary_key(&relation.source_table, source)
                        .await?;
                    let where_clause = format!(
                        r#"{pk} IN (SELECT {fk_column} FROM {fk_table} WHERE {user_column} IN ({ids}))"#,
                        pk = quote_ident(&pk),
                        fk_column = quote_ident(&relation.fk_column),
                        fk_table = quote_ident(&relation.fk_table),
                        user_column = quote_ident(&pair.user_id_column),
                    );
                    if let Some(sql) = sqlgen::select_to_multi_insert(
                        pool,
                        &relation.source_table,
                        &self.reflector.describe(&relation.source_table, source).await?,
                        Some(&where_clause),
                    )
                    .await?
                    {
                        dump.push(&relation.source_table, sql);
                    }
                }
            }

            let where_clause = format!(
                "{} IN ({ids})",
                quote_ident(&pair.user_id_column),
            );
            if let Some(sql) = sqlgen::select_to_multi_insert(
                pool,
                &pair.table,
                &self.reflector.describe(&pair.table, source).await?,
                Some(&where_clause),
            )
            .await?
            {
                dump.push(&pair.table, sql);
            }
            populated.insert(pair.table.clone());
        }

        // Backfill pass over discovered dependencies.
        for pair in &pairs {
            if self.config.table_ignored(&pair.table) {
                continue;
            }
            let Some(deps) = dependencies.get(&pair.table) else {
                continue;
            };
            for dep in deps {
                if populated.contains(&dep.fk_table)
                    || self.config.table_ignored(&dep.fk_table)
                {
                    continue;
                }
                let where_clause = format!(
                    r#"{fk_column} IN (SELECT {column} FROM {table} WHERE {user_column} IN ({ids}))"#,
                    fk_column = quote_ident(&dep.fk_column),
                    column = quote_ident(&dep.column),
                    table = quote_ident(&pair.table),
                    user_column = quote_ident(&pair.user_id_column),
                );
                if let Some(sql) = sqlgen::select_to_multi_insert(
                    pool,
                    &dep.fk_table,
                    &self.reflector.describe(&dep.fk_table, source).await?,
                    Some(&where_clause),
                )
                .await?
                {
                    dump.push(&dep.fk_table, sql);
                }
                populated.insert(dep.fk_table.clone());
            }
        }

        dump.push(Self::POST, "SET CONSTRAINTS ALL IMMEDIATE;".to_string());
        dump.push(Self::POST, "COMMIT;".to_string());
        if deactivate_triggers {
            if let Some(toggle) = &self.config.trigger_toggle {
                dump.push(
                    Self::POST,
                    format!(
                        r#"ALTER TABLE {} ENABLE TRIGGER {};"#,
                        quote_ident(&toggle.table),
                        quote_ident(&toggle.trigger),
                    ),
                );
            }
        }

        Ok(dump)
    }

    const PRE: &'static str = MigrationDump::PRE_SECTION;
    const POST: &'static str = MigrationDump::POST_SECTION;

    /// Copy every record belonging to `user_ids` from `source` onto
    /// `destination` through dblink, verifying row counts three ways before
    /// finalizing.
    ///
    /// Returns the destination connection with its transaction still open
    /// when `opts.commit_destination` is false; dropping it rolls the copy
    /// back.
    pub async fn copy_users(
        &self,
        user_ids: &[i64],
        source: &ShardName,
        destination: &ShardName,
        opts: &CopyOptions,
    ) -> Result<Option<PoolConnection<Postgres>>> {
        info!(users = ?user_ids, %source, %destination, "copying users");
        self.verify_users_exist(user_ids, source).await?;

        let pairs = self.table_pairs(source).await?;
        let tables: Vec<String> = pairs.iter().map(|p| p.table.clone()).collect();
        let pre_source = self.table_row_counts(&pairs, user_ids, source).await?;
        let dependencies = self.reflector.discover_dependencies(&tables, source).await?;

        let mut dest = self.registry.pool(destination)?.acquire().await?;

        // Trigger toggling is intentionally outside the transaction.
        self.set_triggers(&mut dest, opts.deactivate_triggers, false)
            .await?;
        if opts.manage_transactions {
            sqlx::query("BEGIN").execute(dest.as_mut()).await?;
            sqlx::query("SET CONSTRAINTS ALL DEFERRED")
                .execute(dest.as_mut())
                .await?;
        }

        let copied = self
            .copy_tables(user_ids, &pairs, &dependencies, source, &mut dest)
            .await;
        if let Err(e) = copied {
            if opts.manage_transactions {
                let _ = sqlx::query("ROLLBACK").execute(dest.as_mut()).await;
            }
            self.set_triggers(&mut dest, opts.deactivate_triggers, true)
                .await?;
            return Err(e);
        }

        let post_destination = self
            .table_row_counts_on(&pairs, user_ids, &mut dest)
            .await?;
        let post_source = self.table_row_counts(&pairs, user_ids, source).await?;

        if post_destination == pre_source && post_destination == post_source {
            if opts.manage_transactions {
                // Applied retroactively, raising any constraint problem
                // before the commit.
                sqlx::query("SET CONSTRAINTS ALL IMMEDIATE")
                    .execute(dest.as_mut())
                    .await?;
            }
            if opts.commit_destination {
                if opts.manage_transactions {
                    sqlx::query("COMMIT").execute(dest.as_mut()).await?;
                }
                self.set_triggers(&mut dest, opts.deactivate_triggers, true)
                    .await?;
                Ok(None)
            } else {
                self.set_triggers(&mut dest, opts.deactivate_triggers, true)
                    .await?;
                Ok(Some(dest))
            }
        } else {
            if opts.manage_transactions {
                let _ = sqlx::query("ROLLBACK").execute(dest.as_mut()).await;
            }
            self.set_triggers(&mut dest, opts.deactivate_triggers, true)
                .await?;
            Err(Error::StaleRead {
                user_ids: user_ids.to_vec(),
                source: source.clone(),
                destination: destination.clone(),
                pre_source,
                post_source,
                post_destination,
            })
        }
    }

    async fn set_triggers(
        &self,
        conn: &mut PoolConnection<Postgres>,
        deactivate_triggers: bool,
        enable: bool,
    ) -> Result<()> {
        if !deactivate_triggers {
            return Ok(());
        }
        let Some(toggle) = &self.config.trigger_toggle else {
            return Ok(());
        };
        let verb = if enable { "ENABLE" } else { "DISABLE" };
        let sql = format!(
            "ALTER TABLE {} {verb} TRIGGER {}",
            quote_ident(&toggle.table),
            quote_ident(&toggle.trigger),
        );
        sqlx::query(&sql).execute(conn.as_mut()).await?;
        Ok(())
    }

    async fn copy_tables(
        &self,
        user_ids: &[i64],
        pairs: &[TablePair],
        dependencies: &std::collections::BTreeMap<
            String,
            BTreeSet<crate::reflect::Dependency>,
        >,
        source: &ShardName,
        dest: &mut PoolConnection<Postgres>,
    ) -> Result<()> {
        let ids = in_list(user_ids);
        let mut populated: BTreeSet<String> = BTreeSet::new();
        let mut savepoint = 0u32;

        let mut queue = RetryQueue::new(pairs.to_vec());
        while let Some(pair) = queue.pop() {
            if self.config.table_ignored(&pair.table) || populated.contains(&pair.table) {
                continue;
            }
            savepoint += 1;
            sqlx::query(&format!("SAVEPOINT save{savepoint}"))
                .execute(dest.as_mut())
                .await?;

            match self
                .copy_one_table(&pair, &ids, source, dest)
                .await
            {
                Ok(()) => {
                    populated.insert(pair.table.clone());
                    sqlx::query(&format!("RELEASE SAVEPOINT save{savepoint}"))
                        .execute(dest.as_mut())
                        .await?;
                    queue.succeeded();
                    record_table_copied();
                }
                Err(e) => {
                    debug!(table = %pair.table, error = %e, "copy failed, requeueing");
                    sqlx::query(&format!("ROLLBACK TO save{savepoint}"))
                        .execute(dest.as_mut())
                        .await?;
                    queue.requeue(pair)?;
                }
            }
        }

        let mut queue = RetryQueue::new(pairs.to_vec());
        while let Some(pair) = queue.pop() {
            if self.config.table_ignored(&pair.table) {
                continue;
            }
            let deps: Vec<_> = dependencies
                .get(&pair.table)
                .map(|set| {
                    set.iter()
                        .filter(|d| !populated.contains(&d.fk_table))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if deps.is_empty() {
                continue;
            }
            savepoint += 1;
            sqlx::query(&format!("SAVEPOINT save{savepoint}"))
                .execute(dest.as_mut())
                .await?;

            let mut filled = Vec::new();
            let mut failed = None;
            for dep in &deps {
                if self.config.table_ignored(&dep.fk_table) {
                    continue;
                }
                let inner = format!(
                    r#"SELECT * FROM {fk_table} WHERE {fk_column} IN (SELECT {column} FROM {table} WHERE {user_column} IN ({ids}))"#,
                    fk_table = quote_ident(&dep.fk_table),
                    fk_column = quote_ident(&dep.fk_column),
                    column = quote_ident(&dep.column),
                    table = quote_ident(&pair.table),
                    user_column = quote_ident(&pair.user_id_column),
                );
                match self.remote_fill(&dep.fk_table, &inner, source, dest).await {
                    Ok(()) => filled.push(dep.fk_table.clone()),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            match failed {
                None => {
                    populated.extend(filled);
                    sqlx::query(&format!("RELEASE SAVEPOINT save{savepoint}"))
                        .execute(dest.as_mut())
                        .await?;
                    queue.succeeded();
                }
                Some(e) => {
                    debug!(table = %pair.table, error = %e, "backfill failed, requeueing");
                    sqlx::query(&format!("ROLLBACK TO save{savepoint}"))
                        .execute(dest.as_mut())
                        .await?;
                    queue.requeue(pair)?;
                }
            }
        }

        Ok(())
    }

    async fn copy_one_table(
        &self,
        pair: &TablePair,
        ids: &str,
        source: &ShardName,
        dest: &mut PoolConnection<Postgres>,
    ) -> Result<()> {
        if let Some(relations) = self.config.additional_relations.get(&pair.table) {
            for relation in relations {
                if self.config.table_ignored(&relation.source_table) {
                    continue;
                }
                let pk = self
                    .reflector
                    .single_primary_key(&relation.source_table, source)
                    .await?;
                let inner = format!(
                    r#"SELECT * FROM {source_table} WHERE {pk} IN (SELECT {fk_column} FROM {fk_table} WHERE {user_column} IN ({ids}))"#,
                    source_table = quote_ident(&relation.source_table),
                    pk = quote_ident(&pk),
                    fk_column = quote_ident(&relation.fk_column),
                    fk_table = quote_ident(&relation.fk_table),
                    user_column = quote_ident(&pair.user_id_column),
                );
                self.remote_fill(&relation.source_table, &inner, source, dest)
                    .await?;
            }
        }

        let inner = format!(
            r#"SELECT * FROM {table} WHERE {user_column} IN ({ids})"#,
            table = quote_ident(&pair.table),
            user_column = quote_ident(&pair.user_id_column),
        );
        self.remote_fill(&pair.table, &inner, source, dest).await
    }

    /// Pull the result of `inner_select` (run on `source`) into the local
    /// `table` on the destination connection. On a unique violation retries
    /// once excluding primary keys already present locally.
    async fn remote_fill(
        &self,
        table: &str,
        inner_select: &str,
        source: &ShardName,
        dest: &mut PoolConnection<Postgres>,
    ) -> Result<()> {
        let conninfo = self.registry.conninfo(source)?;
        let description = self.reflector.describe(table, source).await?;
        let shape = sqlgen::dblink_record_shape(&description);
        let inner = to_single_line(inner_select).replace('\'', "''");

        sqlx::query("SAVEPOINT remote_fill")
            .execute(dest.as_mut())
            .await?;

        let sql = format!(
            "INSERT INTO {table} SELECT * FROM dblink('{conninfo}', '{inner}') AS {shape}",
            table = quote_ident(table),
        );
        let first: Result<_> = sqlx::query(&sql)
            .execute(dest.as_mut())
            .await
            .map_err(Error::from);

        match first {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT remote_fill")
                    .execute(dest.as_mut())
                    .await?;
                Ok(())
            }
            Err(e)
                if classify(&e).map(|v| v.kind) == Some(ViolationKind::Unique) =>
            {
                warn!(table, "remote fill hit a duplicate, retrying with pk exclusion");
                sqlx::query("ROLLBACK TO remote_fill")
                    .execute(dest.as_mut())
                    .await?;
                // Multi-column primary keys are not supported here.
                let pk = self.reflector.single_primary_key(table, source).await?;
                let sql = format!(
                    "INSERT INTO {table} SELECT * FROM dblink('{conninfo}', '{inner}') AS {shape} \
                     WHERE {pk} NOT IN (SELECT {pk} FROM {table})",
                    table = quote_ident(table),
                    pk = quote_ident(&pk),
                );
                sqlx::query(&sql).execute(dest.as_mut()).await?;
                sqlx::query("RELEASE SAVEPOINT remote_fill")
                    .execute(dest.as_mut())
                    .await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK TO remote_fill")
                    .execute(dest.as_mut())
                    .await;
                Err(e)
            }
        }
    }

    /// Delete every record belonging to `user_ids` from `shard`.
    pub async fn delete_users(
        &self,
        user_ids: &[i64],
        shard: &ShardName,
        opts: &DeleteOptions,
    ) -> Result<()> {
        self.delete_users_chained(user_ids, shard, opts, None).await
    }

    /// Delete with an optional chained destination commit: when present, the
    /// held connection's open transaction is committed immediately before
    /// the local COMMIT, bounding the window where the data exists on both
    /// shards to a recoverable duplicate.
    pub(crate) async fn delete_users_chained(
        &self,
        user_ids: &[i64],
        shard: &ShardName,
        opts: &DeleteOptions,
        mut chained: Option<PoolConnection<Postgres>>,
    ) -> Result<()> {
        info!(users = ?user_ids, %shard, "deleting users");
        if user_ids.is_empty() {
            return Err(Error::Precondition("empty user id list".to_string()));
        }

        let ids = in_list(user_ids);
        let pairs = self.reflector.tables_with_user_id_column(shard).await?;
        let tables: Vec<String> = pairs.iter().map(|p| p.table.clone()).collect();
        let dependencies = self.reflector.discover_dependencies(&tables, shard).await?;

        let mut conn = self.registry.pool(shard)?.acquire().await?;
        if opts.manage_transactions {
            sqlx::query("BEGIN").execute(conn.as_mut()).await?;
            sqlx::query("SET CONSTRAINTS ALL DEFERRED")
                .execute(conn.as_mut())
                .await?;
        }

        let walked = self
            .delete_walk(&ids, &pairs, &dependencies, shard, &mut conn)
            .await;
        if let Err(e) = walked {
            if opts.manage_transactions {
                let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
            }
            return Err(e);
        }

        let finalize = async {
            if opts.manage_transactions {
                sqlx::query("SET CONSTRAINTS ALL IMMEDIATE")
                    .execute(conn.as_mut())
                    .await?;
            }
            if let Some(dest) = chained.as_mut() {
                sqlx::query("COMMIT").execute(dest.as_mut()).await?;
            }
            if opts.manage_transactions {
                sqlx::query("COMMIT").execute(conn.as_mut()).await?;
            }
            Ok::<_, Error>(())
        };
        if let Err(e) = finalize.await {
            if opts.manage_transactions {
                let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
            }
            return Err(Error::Migration(format!(
                "finalizing deletion of users {user_ids:?} on {shard} failed: {e}"
            )));
        }
        Ok(())
    }

    async fn delete_walk(
        &self,
        ids: &str,
        pairs: &[TablePair],
        dependencies: &std::collections::BTreeMap<
            String,
            BTreeSet<crate::reflect::Dependency>,
        >,
        shard: &ShardName,
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<()> {
        // Hand-maintained cleanups run first; these are orphan-producing
        // relations the foreign-key walk cannot order.
        for statement in &self.config.cleanup_statements {
            let sql = to_single_line(&statement.replace("{ids}", ids));
            sqlx::query(&sql).execute(conn.as_mut()).await?;
        }

        let mut savepoint = 0u32;
        let mut queue = RetryQueue::new(pairs.to_vec());
        while let Some(pair) = queue.pop() {
            if self.config.table_ignored(&pair.table) {
                continue;
            }
            debug!(shard = %shard, table = %pair.table, "deleting from table");
            savepoint += 1;
            sqlx::query(&format!("SAVEPOINT save{savepoint}"))
                .execute(conn.as_mut())
                .await?;

            match self
                .delete_one_table(&pair, ids, dependencies, shard, conn)
                .await
            {
                Ok(()) => {
                    sqlx::query(&format!("RELEASE SAVEPOINT save{savepoint}"))
                        .execute(conn.as_mut())
                        .await?;
                    queue.succeeded();
                    record_table_deleted();
                }
                Err(e) => {
                    sqlx::query(&format!("ROLLBACK TO save{savepoint}"))
                        .execute(conn.as_mut())
                        .await?;
                    if is_lock_contention(&e) {
                        // A concurrent writer holds a conflicting lock;
                        // retrying would deadlock.
                        return Err(Error::LockContention {
                            table: pair.table.clone(),
                            message: e.to_string(),
                        });
                    }
                    debug!(table = %pair.table, error = %e, "delete failed, requeueing");
                    queue.requeue(pair)?;
                }
            }
        }
        Ok(())
    }

    async fn delete_one_table(
        &self,
        pair: &TablePair,
        ids: &str,
        dependencies: &std::collections::BTreeMap<
            String,
            BTreeSet<crate::reflect::Dependency>,
        >,
        shard: &ShardName,
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<()> {
        if let Some(relations) = self.config.additional_relations.get(&pair.table) {
            for relation in relations {
                if self.config.table_ignored(&relation.fk_table) {
                    continue;
                }
                let pk = self
                    .reflector
                    .single_primary_key(&relation.source_table, shard)
                    .await?;
                let sql = format!(
                    r#"DELETE FROM {source_table} WHERE {pk} IN (SELECT {fk_column} FROM {fk_table} WHERE {user_column} IN ({ids}))"#,
                    source_table = quote_ident(&relation.source_table),
                    pk = quote_ident(&pk),
                    fk_column = quote_ident(&relation.fk_column),
                    fk_table = quote_ident(&relation.fk_table),
                    user_column = quote_ident(&pair.user_id_column),
                );
                sqlx::query(&sql).execute(conn.as_mut()).await?;
            }
        }

        if let Some(deps) = dependencies.get(&pair.table) {
            for dep in deps {
                if self.config.table_ignored(&dep.fk_table) {
                    continue;
                }
                let sql = format!(
                    r#"DELETE FROM {fk_table} WHERE {fk_column} IN (SELECT {column} FROM {table} WHERE {user_column} IN ({ids}))"#,
                    fk_table = quote_ident(&dep.fk_table),
                    fk_column = quote_ident(&dep.fk_column),
                    column = quote_ident(&dep.column),
                    table = quote_ident(&pair.table),
                    user_column = quote_ident(&pair.user_id_column),
                );
                sqlx::query(&sql).execute(conn.as_mut()).await?;
            }
        }

        let sql = format!(
            r#"DELETE FROM {table} WHERE {user_column} IN ({ids})"#,
            table = quote_ident(&pair.table),
            user_column = quote_ident(&pair.user_id_column),
        );
        sqlx::query(&sql).execute(conn.as_mut()).await?;
        Ok(())
    }

    /// Copy then delete, with destination-first commit ordering: the
    /// destination transaction commits immediately before the source delete
    /// commits.
    pub async fn move_users(
        &self,
        user_ids: &[i64],
        source: &ShardName,
        destination: &ShardName,
    ) -> Result<()> {
        let copy_opts = CopyOptions {
            commit_destination: false,
            ..CopyOptions::default()
        };
        let dest_conn = self
            .copy_users(user_ids, source, destination, &copy_opts)
            .await
            .context(format!("copying users {user_ids:?} to {destination}"))?;
        self.delete_users_chained(user_ids, source, &DeleteOptions::default(), dest_conn)
            .await
            .context(format!("deleting users {user_ids:?} from {source}"))?;

        let shard_id = destination.id();
        for user_id in user_ids {
            self.events
                .publish("movedUser", json!({ "user_id": user_id, "shard_id": shard_id }))
                .await;
        }
        Ok(())
    }

    pub async fn dump_user(
        &self,
        user_id: i64,
        source: &ShardName,
        deactivate_triggers: bool,
    ) -> Result<MigrationDump> {
        self.dump_users(&[user_id], source, deactivate_triggers).await
    }

    pub async fn copy_user(
        &self,
        user_id: i64,
        source: &ShardName,
        destination: &ShardName,
        opts: &CopyOptions,
    ) -> Result<Option<PoolConnection<Postgres>>> {
        self.copy_users(&[user_id], source, destination, opts).await
    }

    pub async fn delete_user(
        &self,
        user_id: i64,
        shard: &ShardName,
        opts: &DeleteOptions,
    ) -> Result<()> {
        self.delete_users(&[user_id], shard, opts).await
    }

    pub async fn move_user(
        &self,
        user_id: i64,
        source: &ShardName,
        destination: &ShardName,
    ) -> Result<()> {
        self.move_users(&[user_id], source, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_sections_stay_ordered() {
        let mut dump = MigrationDump {
            sections: Vec::new(),
        };
        dump.push(MigrationDump::PRE_SECTION, "BEGIN;".to_string());
        dump.push("auth_user", "INSERT INTO \"auth_user\" ...;".to_string());
        dump.push("main_contact", "INSERT INTO \"main_contact\" ...;".to_string());
        dump.push("auth_user", "INSERT INTO \"auth_user\" ...more;".to_string());
        dump.push(MigrationDump::POST_SECTION, "COMMIT;".to_string());

        let names: Vec<&str> = dump.sections().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["__pre__", "auth_user", "main_contact", "__post__"]);
        assert_eq!(dump.sections()[1].1.len(), 2);
        assert_eq!(dump.statements().len(), 5);
    }

    #[test]
    fn sql_string_carries_section_headers() {
        let mut dump = MigrationDump {
            sections: Vec::new(),
        };
        dump.push(MigrationDump::PRE_SECTION, "BEGIN;".to_string());
        dump.push("auth_user", "INSERT ...;".to_string());
        let rendered = dump.to_sql_string(42, 1700000000);
        assert!(rendered.starts_with("-- Dump of LogicalShard 42 on 1700000000\n"));
        assert!(rendered.contains("-- table = __pre__\n"));
        assert!(rendered.contains("-- table = auth_user\n"));
    }
}
