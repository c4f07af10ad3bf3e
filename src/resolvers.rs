//! Automatic repair of recognized constraint violations.
//!
//! When a copy fails with a constraint violation the orchestrator asks
//! [`find_resolver`] for a repair. Resolvers are consulted in a fixed
//! priority order and the first match wins; an unmatched violation
//! propagates unchanged. Each resolver mutates exactly one side (source or
//! destination) inside its own transaction on a fresh connection.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Violation;
use crate::metrics::record_conflict_resolved;
use crate::reflect::SchemaReflector;
use crate::shard::{ShardName, ShardRegistry};
use crate::sqlgen::{in_list, quote_ident};
use crate::{Error, Result, ViolationKind};

/// Which shard a resolver alters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairSide {
    Source,
    Destination,
}

/// Connection context handed to a running resolver.
pub struct RepairContext<'a> {
    pub source: &'a ShardName,
    pub destination: &'a ShardName,
    pub registry: &'a ShardRegistry,
    pub reflector: &'a SchemaReflector,
}

impl RepairContext<'_> {
    pub fn shard(&self, side: RepairSide) -> &ShardName {
        match side {
            RepairSide::Source => self.source,
            RepairSide::Destination => self.destination,
        }
    }

    pub fn pool(&self, side: RepairSide) -> Result<&PgPool> {
        self.registry.pool(self.shard(side))
    }
}

#[async_trait]
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn side(&self) -> RepairSide;
    fn matches(&self, violation: &Violation) -> bool;
    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()>;
}

/// All resolvers in priority order.
pub fn resolvers() -> &'static [&'static dyn ConflictResolver] {
    static RESOLVERS: &[&dyn ConflictResolver] = &[
        &DuplicateExternalIdResolver,
        &DuplicateUsernameResolver,
        &DuplicateIdResolver,
        &ContactGroupsOverlapResolver,
        &ReceiptOverlapResolver,
        &ThreadOverlapResolver,
        &BlockMismatchResolver,
        &ThreadMismatchResolver,
        &MismatchedContactOrGroupResolver,
        &ReceiptMismatchResolver,
    ];
    RESOLVERS
}

/// First resolver claiming the violation, if any.
pub fn find_resolver(violation: &Violation) -> Option<&'static dyn ConflictResolver> {
    let found = resolvers().iter().copied().find(|r| r.matches(violation));
    if let Some(resolver) = found {
        info!(resolver = resolver.name(), "found matching conflict resolver");
    }
    found
}

/// Run a matched resolver and count the repair.
pub async fn run_resolver(
    resolver: &dyn ConflictResolver,
    violation: &Violation,
    ctx: &RepairContext<'_>,
) -> Result<()> {
    info!(
        resolver = resolver.name(),
        side = ?resolver.side(),
        "running conflict resolver"
    );
    resolver.run(violation, ctx).await?;
    record_conflict_resolved();
    Ok(())
}

fn parse_id(violation: &Violation) -> Result<i64> {
    violation
        .detail_value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            Error::Migration(format!(
                "expected a numeric key value in violation: {}",
                violation.message
            ))
        })
}

fn detail_value(violation: &Violation) -> Result<&str> {
    violation.detail_value.as_deref().ok_or_else(|| {
        Error::Migration(format!(
            "violation carries no key value: {}",
            violation.message
        ))
    })
}

fn is_fk_on(violation: &Violation, table: &str, detail_key: &str) -> bool {
    violation.kind == ViolationKind::ForeignKey
        && violation.table.as_deref() == Some(table)
        && violation.detail_key.as_deref() == Some(detail_key)
}

/// Resolve the owning user of a thread from its members JSON, a two-element
/// array of contact ids and group ids. Errors unless all members agree on a
/// single user.
async fn resolve_thread_owner(members_json: &str, pool: &PgPool) -> Result<i64> {
    let parsed: Value = serde_json::from_str(members_json)?;
    let ids = |idx: usize| -> Vec<i64> {
        parsed
            .get(idx)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    };
    let contact_ids = ids(0);
    let group_ids = ids(1);
    if contact_ids.is_empty() && group_ids.is_empty() {
        return Err(Error::Migration(format!(
            "thread members {members_json} resolve to no users"
        )));
    }

    let mut owners = Vec::new();
    if !contact_ids.is_empty() {
        let found: Vec<i64> = sqlx::query_scalar(
            r#"SELECT DISTINCT "user_id" FROM "main_contact" WHERE "id" = ANY($1)"#,
        )
        .bind(&contact_ids)
        .fetch_all(pool)
        .await?;
        if found.len() != 1 {
            return Err(Error::Migration(format!(
                "expected one owner for contacts {contact_ids:?}, found {}",
                found.len()
            )));
        }
        owners.push(found[0]);
    }
    if !group_ids.is_empty() {
        let found: Vec<i64> = sqlx::query_scalar(
            r#"SELECT DISTINCT "user_id" FROM "main_group" WHERE "id" = ANY($1)"#,
        )
        .bind(&group_ids)
        .fetch_all(pool)
        .await?;
        if found.len() != 1 {
            return Err(Error::Migration(format!(
                "expected one owner for groups {group_ids:?}, found {}",
                found.len()
            )));
        }
        owners.push(found[0]);
    }
    if owners.len() == 2 && owners[0] != owners[1] {
        return Err(Error::Migration(format!(
            "contact and group owners disagree for members {members_json}: {owners:?}"
        )));
    }
    Ok(owners[0])
}

/// Duplicate analytics id on the destination: assign a fresh UUID to the
/// existing row.
struct DuplicateExternalIdResolver;

#[async_trait]
impl ConflictResolver for DuplicateExternalIdResolver {
    fn name(&self) -> &'static str {
        "DuplicateExternalIdResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Destination
    }

    fn matches(&self, violation: &Violation) -> bool {
        violation.kind == ViolationKind::Unique
            && violation.constraint.as_deref() == Some("main_extendeduser_analytics_id_key")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let value = detail_value(violation)?;
        let pool = ctx.pool(self.side())?;

        let rows: i64 = sqlx::query_scalar(
            r#"SELECT count(*) FROM "main_extendeduser" WHERE "analytics_id" = $1"#,
        )
        .bind(value)
        .fetch_one(pool)
        .await?;
        if rows != 1 {
            return Err(Error::Migration(format!(
                "expected 1 main_extendeduser row with analytics_id={value}, found {rows}"
            )));
        }

        let new_value = Uuid::new_v4().to_string();
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;
        sqlx::query(r#"UPDATE "main_extendeduser" SET "analytics_id" = $1 WHERE "analytics_id" = $2"#)
            .bind(&new_value)
            .bind(value)
            .execute(conn.as_mut())
            .await?;
        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(old = value, new = %new_value, "reassigned duplicate analytics id");
        Ok(())
    }
}

/// Duplicate username on the destination: rename by repeating the final
/// character. Bare 10-11 digit usernames are phone-number logins and cannot
/// be renamed safely.
struct DuplicateUsernameResolver;

fn numeric_username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{10,11}$").expect("numeric username regex"))
}

#[async_trait]
impl ConflictResolver for DuplicateUsernameResolver {
    fn name(&self) -> &'static str {
        "DuplicateUsernameResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Destination
    }

    fn matches(&self, violation: &Violation) -> bool {
        violation.kind == ViolationKind::Unique
            && violation.detail_key.as_deref() == Some("username")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let value = detail_value(violation)?;
        if numeric_username_re().is_match(value) {
            return Err(Error::Migration(format!(
                "cannot automatically rename user with username `{value}`"
            )));
        }
        let pool = ctx.pool(self.side())?;
        let rows: i64 =
            sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "username" = $1"#)
                .bind(value)
                .fetch_one(pool)
                .await?;
        if rows != 1 {
            return Err(Error::Migration(format!(
                "expected 1 auth_user row with username={value}, found {rows}"
            )));
        }

        let last = value
            .chars()
            .last()
            .ok_or_else(|| Error::Migration("empty username".to_string()))?;
        let new_value = format!("{value}{last}");
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;
        sqlx::query(r#"UPDATE "auth_user" SET "username" = $1 WHERE "username" = $2"#)
            .bind(&new_value)
            .bind(value)
            .execute(conn.as_mut())
            .await?;
        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(old = value, new = %new_value, "renamed duplicate username");
        Ok(())
    }
}

/// Duplicate primary key on a known table: move the existing destination row
/// to a fresh sequence value, rewriting every reference to the old id.
struct DuplicateIdResolver;

const RENUMBERABLE_TABLES: &[&str] = &[
    "main_usermessage",
    "main_shortlink",
    "main_receipt",
    "main_thread",
    "main_phonenumber",
];

impl DuplicateIdResolver {
    fn target_table(violation: &Violation) -> Option<&str> {
        if let Some(table) = violation.table.as_deref() {
            return RENUMBERABLE_TABLES.contains(&table).then_some(table);
        }
        // Fall back to the constraint name prefix when the driver did not
        // report the table.
        let constraint = violation.constraint.as_deref()?;
        RENUMBERABLE_TABLES
            .iter()
            .copied()
            .find(|t| constraint.starts_with(t))
    }
}

#[async_trait]
impl ConflictResolver for DuplicateIdResolver {
    fn name(&self) -> &'static str {
        "DuplicateIdResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Destination
    }

    fn matches(&self, violation: &Violation) -> bool {
        violation.kind == ViolationKind::Unique
            && violation.detail_key.as_deref() == Some("id")
            && Self::target_table(violation).is_some()
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let table = Self::target_table(violation)
            .ok_or_else(|| Error::Migration("no renumberable table matched".to_string()))?
            .to_string();
        let old_id = parse_id(violation)?;
        let shard = ctx.shard(self.side());
        let pool = ctx.pool(self.side())?;

        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;
        sqlx::query("SET CONSTRAINTS ALL DEFERRED")
            .execute(conn.as_mut())
            .await?;

        let new_id: i64 = sqlx::query_scalar(&format!("SELECT nextval('{table}_id_seq')"))
            .fetch_one(conn.as_mut())
            .await?;
        info!(table = %table, old_id, new_id, "renumbering duplicate primary key");

        sqlx::query(&format!(
            r#"UPDATE {} SET "id" = $1 WHERE "id" = $2"#,
            quote_ident(&table)
        ))
        .bind(new_id)
        .bind(old_id)
        .execute(conn.as_mut())
        .await?;

        for dep in ctx.reflector.referenced_by(&table, shard).await? {
            sqlx::query(&format!(
                "UPDATE {fk_table} SET {fk_column} = $1 WHERE {fk_column} = $2",
                fk_table = quote_ident(&dep.fk_table),
                fk_column = quote_ident(&dep.fk_column),
            ))
            .bind(new_id)
            .bind(old_id)
            .execute(conn.as_mut())
            .await?;
        }

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        Ok(())
    }
}

/// Contact-group membership crossing user boundaries on the source: remove
/// memberships whose contact belongs to a different user than the group.
struct ContactGroupsOverlapResolver;

#[async_trait]
impl ConflictResolver for ContactGroupsOverlapResolver {
    fn name(&self) -> &'static str {
        "ContactGroupsOverlapResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        is_fk_on(violation, "main_contact_groups", "group_id")
            && violation.referenced_table().as_deref() == Some("main_group")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let group_id = parse_id(violation)?;
        let pool = ctx.pool(self.side())?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;

        let owner: i64 = sqlx::query_scalar(r#"SELECT "user_id" FROM "main_group" WHERE "id" = $1"#)
            .bind(group_id)
            .fetch_one(conn.as_mut())
            .await?;
        sqlx::query(
            r#"DELETE FROM "main_contact_groups"
               WHERE "group_id" = $1 AND "contact_id" IN (
                   SELECT "c"."id"
                   FROM "main_contact" "c"
                       JOIN "main_contact_groups" "cg" ON "cg"."contact_id" = "c"."id"
                   WHERE "cg"."group_id" = $1 AND "c"."user_id" != $2
               )"#,
        )
        .bind(group_id)
        .bind(owner)
        .execute(conn.as_mut())
        .await?;

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(group_id, owner, "removed cross-user group memberships");
        Ok(())
    }
}

/// Receipt pointing at a contact or group owned by another user on the
/// source: rewrite thread, message and receipt ownership to the true owner.
struct ReceiptOverlapResolver;

impl ReceiptOverlapResolver {
    fn object_type(violation: &Violation) -> Option<&'static str> {
        match violation.detail_key.as_deref() {
            Some("contact_id") => Some("contact"),
            Some("group_id") => Some("group"),
            _ => None,
        }
    }
}

#[async_trait]
impl ConflictResolver for ReceiptOverlapResolver {
    fn name(&self) -> &'static str {
        "ReceiptOverlapResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        violation.kind == ViolationKind::ForeignKey
            && violation.table.as_deref() == Some("main_receipt")
            && Self::object_type(violation).is_some()
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let object = Self::object_type(violation)
            .ok_or_else(|| Error::Migration("unrecognized receipt reference".to_string()))?;
        let object_id = parse_id(violation)?;
        let object_table = quote_ident(&format!("main_{object}"));
        let fk_column = quote_ident(&format!("{object}_id"));

        let pool = ctx.pool(self.side())?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;

        let owner: i64 =
            sqlx::query_scalar(&format!(r#"SELECT "user_id" FROM {object_table} WHERE "id" = $1"#))
                .bind(object_id)
                .fetch_one(conn.as_mut())
                .await?;

        sqlx::query(&format!(
            r#"UPDATE "main_thread" SET "user_id" = $1
               WHERE "latest_message_id" IN (
                   SELECT "um"."id" FROM "main_usermessage" "um"
                       JOIN "main_receipt" "r" ON "r"."message_id" = "um"."id"
                   WHERE "r".{fk_column} = $2
               )"#,
        ))
        .bind(owner)
        .bind(object_id)
        .execute(conn.as_mut())
        .await?;
        sqlx::query(&format!(
            r#"UPDATE "main_usermessage" SET "user_id" = $1
               WHERE "id" IN (
                   SELECT "um"."id" FROM "main_usermessage" "um"
                       JOIN "main_receipt" "r" ON "r"."message_id" = "um"."id"
                   WHERE "r".{fk_column} = $2
               )"#,
        ))
        .bind(owner)
        .bind(object_id)
        .execute(conn.as_mut())
        .await?;
        sqlx::query(&format!(
            r#"UPDATE "main_receipt" SET "user_id" = $1 WHERE {fk_column} = $2"#,
        ))
        .bind(owner)
        .bind(object_id)
        .execute(conn.as_mut())
        .await?;

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(object, object_id, owner, "rewrote mismatched receipt ownership");
        Ok(())
    }
}

/// Message pointing at a thread whose recorded owner disagrees with its
/// members on the source.
struct ThreadOverlapResolver;

#[async_trait]
impl ConflictResolver for ThreadOverlapResolver {
    fn name(&self) -> &'static str {
        "ThreadOverlapResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        is_fk_on(violation, "main_usermessage", "thread_id")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let thread_id = parse_id(violation)?;
        let pool = ctx.pool(self.side())?;

        let (recorded_owner, members_json): (i64, String) = sqlx::query_as(
            r#"SELECT "user_id", "members_json" FROM "main_thread" WHERE "id" = $1"#,
        )
        .bind(thread_id)
        .fetch_one(pool)
        .await?;
        let owner = resolve_thread_owner(&members_json, pool).await?;

        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;
        if recorded_owner == owner {
            sqlx::query(
                r#"UPDATE "main_thread" SET "latest_message_id" = NULL WHERE "id" = $1"#,
            )
            .bind(thread_id)
            .execute(conn.as_mut())
            .await?;
            info!(thread_id, "nulled stale latest-message pointer");
        } else {
            sqlx::query(
                r#"UPDATE "main_receipt" SET "user_id" = $1
                   WHERE "message_id" IN (SELECT "id" FROM "main_usermessage" WHERE "thread_id" = $2)"#,
            )
            .bind(owner)
            .bind(thread_id)
            .execute(conn.as_mut())
            .await?;
            sqlx::query(
                r#"UPDATE "main_usermessage" SET "user_id" = $1 WHERE "thread_id" = $2"#,
            )
            .bind(owner)
            .bind(thread_id)
            .execute(conn.as_mut())
            .await?;
            sqlx::query(r#"UPDATE "main_thread" SET "user_id" = $1 WHERE "id" = $2"#)
                .bind(owner)
                .bind(thread_id)
                .execute(conn.as_mut())
                .await?;
            info!(thread_id, recorded_owner, owner, "rewrote mismatched thread ownership");
        }
        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        Ok(())
    }
}

/// Block pointing at a message owned by another user on the source.
struct BlockMismatchResolver;

#[async_trait]
impl ConflictResolver for BlockMismatchResolver {
    fn name(&self) -> &'static str {
        "BlockMismatchResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        is_fk_on(violation, "main_block", "message_id")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let message_id = parse_id(violation)?;
        let pool = ctx.pool(self.side())?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;

        // Every block of the same blocked user.
        let blocks: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
            r#"SELECT "id", "blocked_user_id", "contact_id", "message_id"
               FROM "main_block"
               WHERE "blocked_user_id" = (
                   SELECT "blocked_user_id" FROM "main_block" WHERE "message_id" = $1 LIMIT 1
               )"#,
        )
        .bind(message_id)
        .fetch_all(conn.as_mut())
        .await?;

        let mut message_ids = Vec::new();
        let mut owner: Option<i64> = None;
        for (block_id, blocked_user_id, contact_id, block_message_id) in &blocks {
            let contact_owner: i64 =
                sqlx::query_scalar(r#"SELECT "user_id" FROM "main_contact" WHERE "id" = $1"#)
                    .bind(contact_id)
                    .fetch_one(conn.as_mut())
                    .await?;
            if *blocked_user_id != contact_owner {
                let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
                return Err(Error::Migration(format!(
                    "block {block_id} has blocked_user_id={blocked_user_id} but its contact \
                     {contact_id} belongs to {contact_owner}"
                )));
            }
            message_ids.push(*block_message_id);
            owner.get_or_insert(*blocked_user_id);
        }

        let Some(owner) = owner else {
            warn!(message_id, "no blocks found for conflicting message");
            let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
            return Ok(());
        };

        let ids = in_list(&message_ids);
        sqlx::query(&format!(
            r#"UPDATE "main_usermessage" SET "user_id" = $1 WHERE "id" IN ({ids})"#,
        ))
        .bind(owner)
        .execute(conn.as_mut())
        .await?;
        sqlx::query(&format!(
            r#"UPDATE "main_receipt" SET "user_id" = $1 WHERE "message_id" IN ({ids})"#,
        ))
        .bind(owner)
        .execute(conn.as_mut())
        .await?;
        sqlx::query(&format!(
            r#"UPDATE "main_thread" SET "user_id" = $1
               WHERE "id" IN (SELECT "thread_id" FROM "main_usermessage" WHERE "id" IN ({ids}))"#,
        ))
        .bind(owner)
        .execute(conn.as_mut())
        .await?;

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(message_id, owner, "rewrote mismatched block records");
        Ok(())
    }
}

/// Thread whose latest-message pointer refers to a missing message on the
/// source.
struct ThreadMismatchResolver;

#[async_trait]
impl ConflictResolver for ThreadMismatchResolver {
    fn name(&self) -> &'static str {
        "ThreadMismatchResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        is_fk_on(violation, "main_thread", "latest_message_id")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let message_id = parse_id(violation)?;
        let pool = ctx.pool(self.side())?;

        let (recorded_owner, members_json): (i64, String) = sqlx::query_as(
            r#"SELECT "user_id", "members_json" FROM "main_thread" WHERE "latest_message_id" = $1"#,
        )
        .bind(message_id)
        .fetch_one(pool)
        .await?;
        let owner = resolve_thread_owner(&members_json, pool).await?;
        if recorded_owner != owner {
            return Err(Error::Migration(format!(
                "thread with members {members_json} cannot be repaired automatically"
            )));
        }

        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;
        sqlx::query(r#"UPDATE "main_receipt" SET "user_id" = $1 WHERE "message_id" = $2"#)
            .bind(owner)
            .bind(message_id)
            .execute(conn.as_mut())
            .await?;
        sqlx::query(r#"UPDATE "main_usermessage" SET "user_id" = $1 WHERE "id" = $2"#)
            .bind(owner)
            .bind(message_id)
            .execute(conn.as_mut())
            .await?;

        // Receipts whose contact belongs to someone else entirely cannot be
        // attributed; drop them.
        let unintelligible: Vec<i64> = sqlx::query_scalar(
            r#"SELECT "r"."id"
               FROM "main_receipt" "r"
                   JOIN "main_contact" "c" ON "c"."id" = "r"."contact_id"
               WHERE "r"."message_id" = $1 AND "r"."user_id" = $2
                 AND "c"."user_id" != "r"."user_id""#,
        )
        .bind(message_id)
        .bind(owner)
        .fetch_all(conn.as_mut())
        .await?;
        if !unintelligible.is_empty() {
            info!(count = unintelligible.len(), "deleting unintelligible receipts");
            sqlx::query(&format!(
                r#"DELETE FROM "main_receipt" WHERE "message_id" = $1 AND "id" IN ({})"#,
                in_list(&unintelligible),
            ))
            .bind(message_id)
            .execute(conn.as_mut())
            .await?;
        }

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(message_id, owner, "repaired mismatched thread pointer");
        Ok(())
    }
}

/// Message-to-contact/group link whose linked object belongs to another user
/// on the source.
struct MismatchedContactOrGroupResolver;

impl MismatchedContactOrGroupResolver {
    fn object_type(violation: &Violation) -> Option<&'static str> {
        match violation.table.as_deref() {
            Some("main_usermessage_contacts") => Some("contact"),
            Some("main_usermessage_groups") => Some("group"),
            _ => None,
        }
    }
}

#[async_trait]
impl ConflictResolver for MismatchedContactOrGroupResolver {
    fn name(&self) -> &'static str {
        "MismatchedContactOrGroupResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        violation.kind == ViolationKind::ForeignKey
            && Self::object_type(violation).is_some()
            && matches!(
                violation.detail_key.as_deref(),
                Some("contact_id") | Some("group_id")
            )
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let object = Self::object_type(violation)
            .ok_or_else(|| Error::Migration("unrecognized link table".to_string()))?;
        let object_id = parse_id(violation)?;
        let object_table = quote_ident(&format!("main_{object}"));
        let link_table = quote_ident(&format!("main_usermessage_{object}s"));
        let fk_column = quote_ident(&format!("{object}_id"));

        let pool = ctx.pool(self.side())?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;

        let owner: i64 =
            sqlx::query_scalar(&format!(r#"SELECT "user_id" FROM {object_table} WHERE "id" = $1"#))
                .bind(object_id)
                .fetch_one(conn.as_mut())
                .await?;
        let bad_message_ids: Vec<i64> = sqlx::query_scalar(&format!(
            r#"SELECT "um"."id" FROM {link_table} "t"
               JOIN "main_usermessage" "um" ON "um"."id" = "t"."usermessage_id"
               WHERE "t".{fk_column} = $1 AND "um"."user_id" != $2"#,
        ))
        .bind(object_id)
        .bind(owner)
        .fetch_all(conn.as_mut())
        .await?;

        if !bad_message_ids.is_empty() {
            sqlx::query(&format!(
                r#"UPDATE "main_usermessage" SET "user_id" = $1 WHERE "id" IN ({})"#,
                in_list(&bad_message_ids),
            ))
            .bind(owner)
            .execute(conn.as_mut())
            .await?;
        }

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(object, object_id, owner, "rewrote mismatched message links");
        Ok(())
    }
}

/// Receipt pointing at a missing message on the source: rewrite the message
/// to the owner of the receipt's contact or group.
struct ReceiptMismatchResolver;

#[async_trait]
impl ConflictResolver for ReceiptMismatchResolver {
    fn name(&self) -> &'static str {
        "ReceiptMismatchResolver"
    }

    fn side(&self) -> RepairSide {
        RepairSide::Source
    }

    fn matches(&self, violation: &Violation) -> bool {
        is_fk_on(violation, "main_receipt", "message_id")
            && violation.referenced_table().as_deref() == Some("main_usermessage")
    }

    async fn run(&self, violation: &Violation, ctx: &RepairContext<'_>) -> Result<()> {
        let message_id = parse_id(violation)?;
        let pool = ctx.pool(self.side())?;
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN").execute(conn.as_mut()).await?;

        let incorrect_owner: i64 = sqlx::query_scalar(
            r#"SELECT "user_id" FROM "main_receipt" WHERE "message_id" = $1 LIMIT 1"#,
        )
        .bind(message_id)
        .fetch_one(conn.as_mut())
        .await?;
        let correct_owner: i64 = sqlx::query_scalar(
            r#"SELECT "user_id" FROM "main_contact"
               WHERE "id" = (SELECT "contact_id" FROM "main_receipt" WHERE "message_id" = $1)
               UNION
               SELECT "user_id" FROM "main_group"
               WHERE "id" = (SELECT "group_id" FROM "main_receipt" WHERE "message_id" = $1)"#,
        )
        .bind(message_id)
        .fetch_one(conn.as_mut())
        .await?;
        if incorrect_owner == correct_owner {
            let _ = sqlx::query("ROLLBACK").execute(conn.as_mut()).await;
            return Err(Error::Migration(format!(
                "receipt owner already matches ({correct_owner}) for message {message_id}"
            )));
        }

        sqlx::query(r#"UPDATE "main_usermessage" SET "user_id" = $1 WHERE "id" = $2"#)
            .bind(correct_owner)
            .bind(message_id)
            .execute(conn.as_mut())
            .await?;

        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        info!(message_id, correct_owner, incorrect_owner, "rewrote mismatched receipt message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(
        kind: ViolationKind,
        constraint: Option<&str>,
        table: Option<&str>,
        detail_key: Option<&str>,
        detail_value: Option<&str>,
        message: &str,
    ) -> Violation {
        Violation {
            kind,
            sqlstate: None,
            constraint: constraint.map(str::to_string),
            table: table.map(str::to_string),
            detail_key: detail_key.map(str::to_string),
            detail_value: detail_value.map(str::to_string),
            message: message.to_string(),
        }
    }

    #[test]
    fn username_duplicate_routes_to_username_resolver() {
        let v = violation(
            ViolationKind::Unique,
            Some("username"),
            Some("auth_user"),
            Some("username"),
            Some("openiduser12"),
            "duplicate key value violates unique constraint \"username\"",
        );
        assert_eq!(find_resolver(&v).unwrap().name(), "DuplicateUsernameResolver");
    }

    #[test]
    fn analytics_id_wins_over_username() {
        let v = violation(
            ViolationKind::Unique,
            Some("main_extendeduser_analytics_id_key"),
            Some("main_extendeduser"),
            Some("analytics_id"),
            Some("abc"),
            "duplicate key value violates unique constraint",
        );
        assert_eq!(
            find_resolver(&v).unwrap().name(),
            "DuplicateExternalIdResolver"
        );
    }

    #[test]
    fn receipt_fk_routes_by_detail_key() {
        let overlap = violation(
            ViolationKind::ForeignKey,
            Some("main_receipt_contact_id_fk"),
            Some("main_receipt"),
            Some("contact_id"),
            Some("7"),
            "Key (contact_id)=(7) is not present in table \"main_contact\".",
        );
        assert_eq!(find_resolver(&overlap).unwrap().name(), "ReceiptOverlapResolver");

        let mismatch = violation(
            ViolationKind::ForeignKey,
            Some("main_receipt_message_id_fk"),
            Some("main_receipt"),
            Some("message_id"),
            Some("7"),
            "Key (message_id)=(7) is not present in table \"main_usermessage\".",
        );
        assert_eq!(
            find_resolver(&mismatch).unwrap().name(),
            "ReceiptMismatchResolver"
        );
    }

    #[test]
    fn duplicate_id_requires_known_table() {
        let known = violation(
            ViolationKind::Unique,
            Some("main_thread_pkey"),
            Some("main_thread"),
            Some("id"),
            Some("41"),
            "duplicate key value violates unique constraint \"main_thread_pkey\"",
        );
        assert_eq!(find_resolver(&known).unwrap().name(), "DuplicateIdResolver");

        let unknown = violation(
            ViolationKind::Unique,
            Some("main_plan_pkey"),
            Some("main_plan"),
            Some("id"),
            Some("41"),
            "duplicate key value violates unique constraint \"main_plan_pkey\"",
        );
        assert!(find_resolver(&unknown).is_none());
    }

    #[test]
    fn unmatched_violation_propagates() {
        let v = violation(
            ViolationKind::Other,
            None,
            None,
            None,
            None,
            "division by zero",
        );
        assert!(find_resolver(&v).is_none());
    }
}
