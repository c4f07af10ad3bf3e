use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A `(table, user_id_column)` pair — the unit of work for every per-table
/// dump/copy/delete pass.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TablePair {
    pub table: String,
    pub user_id_column: String,
}

impl TablePair {
    pub fn new(table: impl Into<String>, user_id_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            user_id_column: user_id_column.into(),
        }
    }
}

impl fmt::Display for TablePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.user_id_column)
    }
}

/// A pointer-style relation invisible to foreign-key discovery: rows of
/// `source_table` are reachable only through `fk_table.fk_column`.
#[derive(Clone, Debug)]
pub struct AdditionalRelation {
    pub fk_table: String,
    pub fk_column: String,
    pub source_table: String,
}

impl AdditionalRelation {
    pub fn new(
        fk_table: impl Into<String>,
        fk_column: impl Into<String>,
        source_table: impl Into<String>,
    ) -> Self {
        Self {
            fk_table: fk_table.into(),
            fk_column: fk_column.into(),
            source_table: source_table.into(),
        }
    }
}

/// Trigger to toggle off around bulk loads on a high-write-volume table.
#[derive(Clone, Debug)]
pub struct TriggerToggle {
    pub table: String,
    pub trigger: String,
}

/// Static configuration for the migration engine: seed tables, skip lists,
/// hand-maintained relations and cleanup statements the automatic
/// foreign-key walk cannot see or order, and retry limits.
///
/// Cleanup/scrub statements may carry an `{ids}` placeholder which is
/// replaced with the comma-joined user-id list at execution time.
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Pairs processed first, before discovered tables, in this order.
    pub seed_table_pairs: Vec<TablePair>,
    /// Tables replicated across all shards; never part of user operations.
    pub static_tables: BTreeSet<String>,
    /// Tables excluded from user operations for other reasons.
    pub ignore_tables: BTreeSet<String>,
    pub additional_relations: BTreeMap<String, Vec<AdditionalRelation>>,
    pub trigger_toggle: Option<TriggerToggle>,
    /// Run before the generic per-table delete walk; `{ids}` placeholder.
    pub cleanup_statements: Vec<String>,
    /// Orphan scrubbing statements, run standalone; no placeholder.
    pub scrub_statements: Vec<String>,
    /// Deletes shortlinks no message or receipt points at any more.
    pub straggler_shortlink_cleanup: String,
    pub num_logical_shards: i64,
    pub max_copy_attempts: u32,
    pub backup_path_prefix: String,
}

impl MigrationConfig {
    pub fn table_ignored(&self, table: &str) -> bool {
        self.static_tables.contains(table) || self.ignore_tables.contains(table)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            seed_table_pairs: vec![
                TablePair::new("auth_user", "id"),
                TablePair::new("main_extendeduser", "user_id"),
                TablePair::new("main_usermessage", "user_id"),
                TablePair::new("main_thread", "user_id"),
                TablePair::new("main_contact", "user_id"),
                TablePair::new("main_group", "user_id"),
            ],
            static_tables: ["main_plan"].iter().map(|s| s.to_string()).collect(),
            ignore_tables: ["django_migrations", "django_session"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            additional_relations: BTreeMap::from([
                (
                    "main_receipt".to_string(),
                    vec![AdditionalRelation::new(
                        "main_receipt",
                        "shortlink_id",
                        "main_shortlink",
                    )],
                ),
                (
                    "main_usermessage".to_string(),
                    vec![AdditionalRelation::new(
                        "main_usermessage",
                        "shortlink_id",
                        "main_shortlink",
                    )],
                ),
                (
                    "main_extendeduser".to_string(),
                    vec![
                        AdditionalRelation::new(
                            "main_extendeduser",
                            "phone_number_id",
                            "main_phonenumber",
                        ),
                        AdditionalRelation::new(
                            "main_extendeduser",
                            "entitlement_id",
                            "main_entitlement",
                        ),
                    ],
                ),
                (
                    "main_groupshare".to_string(),
                    vec![AdditionalRelation::new(
                        "main_groupshare",
                        "invitation_ptr_id",
                        "main_invitation",
                    )],
                ),
            ]),
            trigger_toggle: Some(TriggerToggle {
                table: "main_contact".to_string(),
                trigger: "main_contact_trigger".to_string(),
            }),
            cleanup_statements: vec![
                r#"DELETE FROM "main_groupshare" WHERE "invitation_ptr_id" IN (SELECT "id" FROM "main_invitation" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_groupshare" WHERE "invitation_ptr_id" IN (SELECT "id" FROM "main_invitation" WHERE "owner_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_invitation" WHERE "owner_id" IN ({ids})"#.to_string(),
                r#"DELETE FROM "main_usermessage_contacts" WHERE "contact_id" IN (SELECT "id" FROM "main_contact" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_contact_groups" WHERE "contact_id" IN (SELECT "id" FROM "main_contact" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_usermessage_groups" WHERE "group_id" IN (SELECT "id" FROM "main_group" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_receipt" WHERE "group_id" IN (SELECT "id" FROM "main_group" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_phonenumber" WHERE "id" IN (SELECT "phone_number_id" FROM "main_extendeduser" WHERE "user_id" IN ({ids}))"#.to_string(),
                r#"DELETE FROM "main_entitlement" WHERE "id" IN (SELECT "entitlement_id" FROM "main_extendeduser" WHERE "user_id" IN ({ids}))"#.to_string(),
            ],
            scrub_statements: vec![
                r#"DELETE FROM "main_phonenumber" WHERE "id" IN (SELECT "pn"."id" FROM "main_phonenumber" "pn" LEFT JOIN "main_extendeduser" "eu" ON "eu"."phone_number_id" = "pn"."id" WHERE "eu"."phone_number_id" IS NULL)"#.to_string(),
            ],
            straggler_shortlink_cleanup: r#"DELETE FROM "main_shortlink" WHERE "id" IN (SELECT "s"."id" FROM "main_shortlink" "s" LEFT JOIN "main_usermessage" "um" ON "um"."shortlink_id" = "s"."id" LEFT JOIN "main_receipt" "r" ON "r"."shortlink_id" = "s"."id" WHERE "s"."used" IS NOT NULL AND "r"."id" IS NULL AND "um"."id" IS NULL)"#.to_string(),
            num_logical_shards: 2048,
            max_copy_attempts: 10,
            backup_path_prefix: "/logicalShardMigrations".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_skips_static_and_ignored() {
        let config = MigrationConfig::default();
        assert!(config.table_ignored("main_plan"));
        assert!(config.table_ignored("django_session"));
        assert!(!config.table_ignored("auth_user"));
    }

    #[test]
    fn seed_pairs_start_with_auth_user() {
        let config = MigrationConfig::default();
        assert_eq!(config.seed_table_pairs[0], TablePair::new("auth_user", "id"));
    }
}
