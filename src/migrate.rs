//! Logical-shard migration orchestration.
//!
//! A logical shard is the set of users with `id % num_logical_shards =
//! logical_shard_id`. Migrating one moves every user in the set from its
//! current physical shard to a new one, driven by the `LogicalShard` control
//! table on the primary connection:
//!
//! `OK -> RELOCATING -> { OK (new shard) | OK (unchanged, on failure) }`
//!
//! The control row is only repointed after pre-source, post-source and
//! post-destination row counts all agree, so a failed run never leaves a
//! shard partially reassigned. Duplicate recovery runs after every attempt,
//! successful or not.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::config::MigrationConfig;
use crate::error::{classify, is_lock_contention};
use crate::hooks::{BackupStore, CacheFlusher, NoopBackupStore, NoopCacheFlusher};
use crate::metrics::{record_migration_finished, record_migration_started};
use crate::mover::{DeleteOptions, UserDataMover};
use crate::reflect::SchemaReflector;
use crate::resolvers::{RepairContext, find_resolver, run_resolver};
use crate::shard::{LogicalShardRow, LogicalShardStatus, ShardName, ShardRegistry};
use crate::sqlgen::quote_literal;
use crate::{Error, Result, RowCounts, WithContext};

/// Outcome of one logical-shard migration run.
#[derive(Clone, Debug)]
pub struct MigrationReport {
    pub logical_shard_id: i64,
    pub user_ids: Vec<i64>,
    pub source: ShardName,
    pub destination: ShardName,
    pub succeeded: bool,
    pub pre_source: RowCounts,
    pub post_source: RowCounts,
    pub post_destination: RowCounts,
    /// Backup base path of this run's artifacts (`.sql`, `.json`, run note).
    pub backup_base: String,
}

pub struct LogicalShardMigrator {
    registry: ShardRegistry,
    reflector: SchemaReflector,
    mover: UserDataMover,
    config: MigrationConfig,
    backups: Arc<dyn BackupStore>,
    cache: Arc<dyn CacheFlusher>,
}

impl LogicalShardMigrator {
    pub fn new(registry: ShardRegistry, config: MigrationConfig) -> Self {
        let reflector = SchemaReflector::new(registry.clone());
        let mover = UserDataMover::new(registry.clone(), reflector.clone(), config.clone());
        Self {
            registry,
            reflector,
            mover,
            config,
            backups: Arc::new(NoopBackupStore),
            cache: Arc::new(NoopCacheFlusher),
        }
    }

    pub fn with_backup_store(mut self, backups: Arc<dyn BackupStore>) -> Self {
        self.backups = backups;
        self
    }

    pub fn with_cache_flusher(mut self, cache: Arc<dyn CacheFlusher>) -> Self {
        self.cache = cache;
        self
    }

    pub fn mover(&self) -> &UserDataMover {
        &self.mover
    }

    fn control_pool(&self) -> &PgPool {
        self.registry.primary_pool()
    }

    /// Read one `LogicalShard` control row.
    pub async fn logical_shard(&self, logical_shard_id: i64) -> Result<Option<LogicalShardRow>> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            r#"SELECT "id", "physical_shard_id", "status" FROM "LogicalShard" WHERE "id" = $1"#,
        )
        .bind(logical_shard_id)
        .fetch_optional(self.control_pool())
        .await?;
        row.map(|(id, physical_shard_id, status)| {
            Ok(LogicalShardRow {
                id,
                physical_shard_id,
                status: LogicalShardStatus::parse(&status)?,
            })
        })
        .transpose()
    }

    pub async fn physical_shard_id(&self, logical_shard_id: i64) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"SELECT "physical_shard_id" FROM "LogicalShard" WHERE "id" = $1"#,
        )
        .bind(logical_shard_id)
        .fetch_optional(self.control_pool())
        .await?;
        Ok(id)
    }

    pub async fn set_status(&self, logical_shard_id: i64, status: LogicalShardStatus) -> Result<()> {
        sqlx::query(r#"UPDATE "LogicalShard" SET "status" = $1 WHERE "id" = $2"#)
            .bind(status.as_str())
            .bind(logical_shard_id)
            .execute(self.control_pool())
            .await?;
        Ok(())
    }

    pub async fn set_physical_shard_id(
        &self,
        logical_shard_id: i64,
        physical_shard_id: i64,
    ) -> Result<()> {
        sqlx::query(r#"UPDATE "LogicalShard" SET "physical_shard_id" = $1 WHERE "id" = $2"#)
            .bind(physical_shard_id)
            .bind(logical_shard_id)
            .execute(self.control_pool())
            .await?;
        Ok(())
    }

    /// Repoint the control row and set its status in one statement.
    pub async fn set_physical_shard(
        &self,
        logical_shard_id: i64,
        physical_shard_id: i64,
        status: LogicalShardStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE "LogicalShard" SET "physical_shard_id" = $1, "status" = $2 WHERE "id" = $3"#,
        )
        .bind(physical_shard_id)
        .bind(status.as_str())
        .bind(logical_shard_id)
        .execute(self.control_pool())
        .await?;
        Ok(())
    }

    /// Ids of every user on `shard` belonging to the logical shard.
    pub async fn logical_shard_user_ids(
        &self,
        logical_shard_id: i64,
        shard: &ShardName,
    ) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"SELECT "id" FROM "auth_user" WHERE "id" % $1 = $2 ORDER BY "id""#,
        )
        .bind(self.config.num_logical_shards)
        .bind(logical_shard_id)
        .fetch_all(self.registry.pool(shard)?)
        .await?;
        Ok(ids)
    }

    /// Move every record of a logical shard to `destination`.
    ///
    /// Duplicate recovery runs regardless of the outcome; precondition
    /// failures surface as errors without ever leaving partial state behind.
    pub async fn migrate_logical_shard(
        &self,
        logical_shard_id: i64,
        destination: &ShardName,
    ) -> Result<MigrationReport> {
        let physical_shard_id = self
            .physical_shard_id(logical_shard_id)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!("no LogicalShard row with id {logical_shard_id}"))
            })?;
        let source = ShardName::from_id(physical_shard_id);
        if &source == destination {
            return Err(Error::Precondition(format!(
                "logical shard {logical_shard_id} already lives on {destination}"
            )));
        }
        self.registry
            .pool(destination)
            .context(format!("destination shard {destination} is not registered"))?;

        let user_ids = self
            .logical_shard_user_ids(logical_shard_id, &source)
            .await?;
        info!(
            logical_shard_id,
            %source,
            %destination,
            users = user_ids.len(),
            "migrating logical shard"
        );
        self.set_status(logical_shard_id, LogicalShardStatus::Relocating)
            .await?;
        record_migration_started();

        let result = self
            .migrate_body(logical_shard_id, &user_ids, &source, destination)
            .await;

        if let Err(e) = self
            .automatic_duplicate_recovery(logical_shard_id, &source, destination)
            .await
        {
            error!(logical_shard_id, error = %e, "automatic duplicate recovery failed");
        }

        match &result {
            Ok(report) => record_migration_finished(report.succeeded),
            Err(e) => {
                if matches!(e, Error::Precondition(_)) {
                    warn!(logical_shard_id, error = %e, "migration precondition failed");
                }
                record_migration_finished(false);
            }
        }
        result
    }

    async fn migrate_body(
        &self,
        logical_shard_id: i64,
        user_ids: &[i64],
        source: &ShardName,
        destination: &ShardName,
    ) -> Result<MigrationReport> {
        let epoch = Utc::now().timestamp();
        let backup_base = format!(
            "{}/id-{}_{}",
            self.config.backup_path_prefix, logical_shard_id, epoch
        );

        let pairs = self.mover.table_pairs(source).await?;
        let pre_source = self
            .mover
            .table_row_counts(&pairs, user_ids, source)
            .await?;

        self.dump_and_copy(logical_shard_id, user_ids, source, destination, &backup_base, epoch)
            .await?;

        let post_source = self
            .mover
            .table_row_counts(&pairs, user_ids, source)
            .await?;
        let post_destination = self
            .mover
            .table_row_counts(&pairs, user_ids, destination)
            .await?;

        let duration = Utc::now().timestamp() - epoch;
        let succeeded = pre_source == post_source && pre_source == post_destination;
        let note = format!(
            "duration={duration}s\nnumUsers={}\npreSourceCounts={pre_source:?}\n\
             postSourceCounts={post_source:?}\npostDestinationCounts={post_destination:?}",
            user_ids.len(),
        );

        if succeeded {
            let new_physical_shard_id = destination.id().ok_or_else(|| {
                Error::Precondition(format!(
                    "destination shard name `{destination}` carries no numeric id"
                ))
            })?;
            info!(
                logical_shard_id,
                new_physical_shard_id, "row counts all match, repointing control row"
            );
            self.set_physical_shard(logical_shard_id, new_physical_shard_id, LogicalShardStatus::Ok)
                .await?;
            self.cache.flush().await;
            self.mover
                .delete_users(user_ids, source, &DeleteOptions::default())
                .await
                .context(format!("deleting migrated users from {source}"))?;
        } else {
            warn!(
                logical_shard_id,
                ?pre_source,
                ?post_source,
                ?post_destination,
                "row count mismatch, removing speculative destination copies"
            );
            self.mover
                .delete_users(user_ids, destination, &DeleteOptions::default())
                .await
                .context(format!("deleting speculative copies from {destination}"))?;
        }

        let suffix = if succeeded { "succeeded" } else { "failed" };
        self.upload_artifact(&format!("{backup_base}.{suffix}"), note.as_bytes())
            .await;

        Ok(MigrationReport {
            logical_shard_id,
            user_ids: user_ids.to_vec(),
            source: source.clone(),
            destination: destination.clone(),
            succeeded,
            pre_source,
            post_source,
            post_destination,
            backup_base,
        })
    }

    /// Dump-and-copy with automatic repair: on a recognized constraint
    /// violation, run the matching resolver and retry. The same error text
    /// twice in a row means the repair had no effect and the run aborts.
    async fn dump_and_copy(
        &self,
        logical_shard_id: i64,
        user_ids: &[i64],
        source: &ShardName,
        destination: &ShardName,
        backup_base: &str,
        epoch: i64,
    ) -> Result<()> {
        let mut last_error_text: Option<String> = None;
        for attempt in 1..=self.config.max_copy_attempts {
            match self
                .dump_and_copy_once(logical_shard_id, user_ids, source, destination, backup_base, epoch)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let text = e.to_string();
                    if last_error_text.as_deref() == Some(text.as_str()) {
                        error!(attempt, error = %text, "same error twice in a row, aborting");
                        return Err(Error::RepairLoop(text));
                    }
                    if is_lock_contention(&e) {
                        return Err(e);
                    }
                    let Some(violation) = classify(&e) else {
                        return Err(e);
                    };
                    let Some(resolver) = find_resolver(&violation) else {
                        error!(attempt, error = %text, "no automatic resolution found");
                        return Err(e);
                    };
                    info!(attempt, error = %text, "attempting automatic repair");
                    let ctx = RepairContext {
                        source,
                        destination,
                        registry: &self.registry,
                        reflector: &self.reflector,
                    };
                    run_resolver(resolver, &violation, &ctx)
                        .await
                        .context(format!("repairing `{text}`"))?;
                    last_error_text = Some(text);
                }
            }
        }
        Err(Error::Migration(format!(
            "exceeded {} dump/copy attempts for logical shard {logical_shard_id}",
            self.config.max_copy_attempts
        )))
    }

    async fn dump_and_copy_once(
        &self,
        logical_shard_id: i64,
        user_ids: &[i64],
        source: &ShardName,
        destination: &ShardName,
        backup_base: &str,
        epoch: i64,
    ) -> Result<()> {
        let dump = self.mover.dump_users(user_ids, source, true).await?;

        let sql_string = dump.to_sql_string(logical_shard_id, epoch);
        self.upload_artifact(&format!("{backup_base}.sql"), sql_string.as_bytes())
            .await;
        let json_string = dump.to_json_string()?;
        self.upload_artifact(&format!("{backup_base}.json"), json_string.as_bytes())
            .await;

        let statements = dump.statements();
        info!(
            logical_shard_id,
            %destination,
            statements = statements.len(),
            "replaying dump on destination"
        );
        let mut conn = self.registry.pool(destination)?.acquire().await?;
        for statement in &statements {
            if let Err(e) = sqlx::raw_sql(statement).execute(conn.as_mut()).await {
                let _ = sqlx::raw_sql("ROLLBACK").execute(conn.as_mut()).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Upload a backup artifact. Failures are logged, never fatal: a missing
    /// backup must not abort a migration in flight.
    async fn upload_artifact(&self, path: &str, data: &[u8]) {
        match self.backups.put(path, data).await {
            Ok(url) => info!(path, url, "stored migration artifact"),
            Err(e) => error!(path, error = %e, "failed to store migration artifact"),
        }
    }

    /// Detect users present on both shards after a migration attempt, delete
    /// the destination copies, and force the control row back to the source.
    /// Runs after every migration regardless of outcome.
    pub async fn automatic_duplicate_recovery(
        &self,
        logical_shard_id: i64,
        source: &ShardName,
        destination: &ShardName,
    ) -> Result<()> {
        let n = self.config.num_logical_shards;
        let sql = format!(
            r#"SELECT "au1"."id"
               FROM "auth_user" "au1"
                   JOIN (
                       SELECT "id" FROM dblink(
                           {conninfo},
                           'SELECT id FROM auth_user WHERE id % {n} = {logical_shard_id}'
                       ) AS t("id" bigint)
                   ) "au2" ON "au1"."id" = "au2"."id"
               WHERE "au1"."id" % {n} = {logical_shard_id}"#,
            conninfo = quote_literal(self.registry.conninfo(destination)?),
        );
        let duplicates: Vec<i64> = sqlx::query_scalar(&sql)
            .fetch_all(self.registry.pool(source)?)
            .await?;
        if duplicates.is_empty() {
            return Ok(());
        }

        warn!(
            logical_shard_id,
            ?duplicates,
            "duplicate users detected on both shards, removing destination copies"
        );
        let source_physical_id = source.id().ok_or_else(|| {
            Error::Precondition(format!("source shard name `{source}` carries no numeric id"))
        })?;

        self.mover
            .delete_users(&duplicates, destination, &DeleteOptions::default())
            .await
            .context(format!("deleting duplicate users from {destination}"))?;

        info!(%destination, "cleaning up straggler shortlinks");
        sqlx::raw_sql(&self.config.straggler_shortlink_cleanup)
            .execute(self.registry.pool(destination)?)
            .await?;

        self.set_physical_shard_id(logical_shard_id, source_physical_id)
            .await?;
        self.cache.flush().await;
        Ok(())
    }
}
