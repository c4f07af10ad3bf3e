//! Read-only reflection over live Postgres catalog state.
//!
//! Every query here is memoized per shard for the life of the process;
//! `invalidate` drops a shard's snapshot when the schema is known to have
//! changed. Only successful results are cached — catalog query failures
//! propagate unmodified and leave the cache untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::OnceLock;

use indoc::indoc;
use regex::Regex;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::TablePair;
use crate::shard::{ShardName, ShardRegistry};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDescription {
    pub column: String,
    pub data_type: String,
}

/// One foreign-key edge, as seen from the keyed table's side.
///
/// In a `referenced_by` entry for table `T`, `fk_table.fk_column` references
/// `T.column`. In a `references` entry for `T`, `T.column` references
/// `fk_table.fk_column`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dependency {
    pub column: String,
    pub fk_table: String,
    pub fk_column: String,
}

#[derive(Clone, Debug, Default)]
pub struct TableRelations {
    pub references: BTreeMap<String, Vec<Dependency>>,
    pub referenced_by: BTreeMap<String, Vec<Dependency>>,
}

#[derive(Default)]
struct ShardCache {
    describe_public: Option<Arc<BTreeMap<String, Vec<ColumnDescription>>>>,
    primary_keys: Option<Arc<BTreeMap<String, Vec<String>>>>,
    tables: Option<Arc<Vec<String>>>,
    relations: Option<Arc<TableRelations>>,
    user_id_pairs: Option<Arc<Vec<TablePair>>>,
    fn_return_types: HashMap<String, Option<String>>,
    nullable: HashMap<(String, String), bool>,
}

#[derive(Clone)]
pub struct SchemaReflector {
    registry: ShardRegistry,
    cache: Arc<Mutex<HashMap<ShardName, ShardCache>>>,
}

fn user_id_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)user_?id").expect("user id regex"))
}

/// Heuristic match for a user-id-bearing column: contains `user` + optional
/// underscore + `id` (case-insensitive) and does not contain `parent`.
pub fn find_user_id_column(description: &[ColumnDescription]) -> Option<&str> {
    description
        .iter()
        .map(|col| col.column.as_str())
        .find(|name| {
            !name.to_lowercase().contains("parent") && user_id_column_re().is_match(name)
        })
}

impl SchemaReflector {
    pub fn new(registry: ShardRegistry) -> Self {
        Self {
            registry,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub async fn invalidate(&self, shard: &ShardName) {
        self.cache.lock().await.remove(shard);
    }

    pub async fn invalidate_all(&self) {
        self.cache.lock().await.clear();
    }

    /// Describe every table in the public namespace in column order, from a
    /// single catalog scan.
    pub async fn describe_public(
        &self,
        shard: &ShardName,
    ) -> Result<Arc<BTreeMap<String, Vec<ColumnDescription>>>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .describe_public
            .clone()
        {
            return Ok(cached);
        }

        let sql = indoc! {r#"
            SELECT
                "p"."relname" AS "table",
                "a"."attname" AS "column",
                pg_catalog.format_type("a"."atttypid", "a"."atttypmod") AS "type"
            FROM "pg_catalog"."pg_attribute" "a"
                LEFT JOIN "pg_catalog"."pg_class" "p" ON "p"."oid" = "a"."attrelid"
            WHERE
                NOT "a"."attisdropped" AND
                "a"."attnum" > 0 AND
                "a"."attrelid" IN (
                    SELECT "c"."oid"
                    FROM "pg_catalog"."pg_class" "c"
                    LEFT JOIN "pg_catalog"."pg_namespace" "n" ON "n"."oid" = "c"."relnamespace"
                    WHERE
                        "n"."nspname" = 'public' AND
                        "c"."relkind" = 'r' AND
                        pg_catalog.pg_table_is_visible("c"."oid")
                )
            ORDER BY "p"."relname", "a"."attnum" ASC
        "#};

        let rows = sqlx::query(sql)
            .fetch_all(self.registry.pool(shard)?)
            .await?;

        let mut out: BTreeMap<String, Vec<ColumnDescription>> = BTreeMap::new();
        for row in rows {
            let table: String = row.get("table");
            let column: String = row.get("column");
            let data_type: String = row.get("type");
            out.entry(table)
                .or_default()
                .push(ColumnDescription { column, data_type });
        }

        let out = Arc::new(out);
        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .describe_public = Some(out.clone());
        Ok(out)
    }

    pub async fn describe(&self, table: &str, shard: &ShardName) -> Result<Vec<ColumnDescription>> {
        Ok(self
            .describe_public(shard)
            .await?
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn all_primary_keys(&self, shard: &ShardName) -> Result<Arc<BTreeMap<String, Vec<String>>>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .primary_keys
            .clone()
        {
            return Ok(cached);
        }

        let sql = indoc! {r#"
            SELECT "tc"."table_name" AS "table", "c"."column_name" AS "column"
            FROM "information_schema"."table_constraints" "tc"
            JOIN "information_schema"."constraint_column_usage" "ccu"
                USING ("constraint_schema", "constraint_name")
            JOIN "information_schema"."columns" "c"
                ON
                    "c"."table_schema" = "tc"."constraint_schema" AND
                    "tc"."table_name" = "c"."table_name" AND
                    "ccu"."column_name" = "c"."column_name"
            WHERE "constraint_type" = 'PRIMARY KEY'
            ORDER BY "tc"."table_name" ASC
        "#};

        let rows = sqlx::query(sql)
            .fetch_all(self.registry.pool(shard)?)
            .await?;

        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let table: String = row.get("table");
            let column: String = row.get("column");
            out.entry(table).or_default().push(column);
        }

        let out = Arc::new(out);
        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .primary_keys = Some(out.clone());
        Ok(out)
    }

    /// Columns composing the table's primary key. Composite keys are
    /// returned in full, but the copy/delete path only uses index 0.
    pub async fn primary_key_columns(
        &self,
        table: &str,
        shard: &ShardName,
    ) -> Result<Vec<String>> {
        Ok(self
            .all_primary_keys(shard)
            .await?
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    /// First primary-key column, erroring when the table has none.
    pub async fn single_primary_key(&self, table: &str, shard: &ShardName) -> Result<String> {
        self.primary_key_columns(table, shard)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Migration(format!("table `{table}` has no primary key on {shard}"))
            })
    }

    pub async fn list_tables(&self, shard: &ShardName) -> Result<Arc<Vec<String>>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .tables
            .clone()
        {
            return Ok(cached);
        }

        let rows: Vec<String> = sqlx::query_scalar(
            r#"SELECT "table_name" FROM "information_schema"."tables"
               WHERE "table_schema" = 'public' AND "table_type" = 'BASE TABLE'
               ORDER BY "table_name""#,
        )
        .fetch_all(self.registry.pool(shard)?)
        .await?;

        let out = Arc::new(rows);
        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .tables = Some(out.clone());
        Ok(out)
    }

    /// All `(table, user_id_column)` pairs on the shard. `auth_user.id` is
    /// always seeded first regardless of the heuristic.
    pub async fn tables_with_user_id_column(&self, shard: &ShardName) -> Result<Vec<TablePair>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .user_id_pairs
            .clone()
        {
            return Ok(cached.as_ref().clone());
        }

        let mut out = vec![TablePair::new("auth_user", "id")];
        let descriptions = self.describe_public(shard).await?;
        for (table, description) in descriptions.iter() {
            if let Some(column) = find_user_id_column(description) {
                out.push(TablePair::new(table.clone(), column.to_string()));
            }
        }

        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .user_id_pairs = Some(Arc::new(out.clone()));
        Ok(out)
    }

    /// Forward and reverse foreign-key maps from one information_schema scan.
    pub async fn table_relations(&self, shard: &ShardName) -> Result<Arc<TableRelations>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .relations
            .clone()
        {
            return Ok(cached);
        }

        let sql = indoc! {r#"
            SELECT
                "tc"."table_name" AS "foreign_table",
                "kcu"."column_name" AS "foreign_column",
                "ccu"."table_name" AS "table",
                "ccu"."column_name" AS "column"
            FROM "information_schema"."table_constraints" "tc"
                JOIN "information_schema"."constraint_column_usage" "ccu"
                    ON "ccu"."constraint_name" = "tc"."constraint_name"
                JOIN "information_schema"."key_column_usage" "kcu"
                    ON "tc"."constraint_name" = "kcu"."constraint_name"
            WHERE "tc"."constraint_type" = 'FOREIGN KEY'
            ORDER BY "tc"."table_name" ASC
        "#};

        let rows = sqlx::query(sql)
            .fetch_all(self.registry.pool(shard)?)
            .await?;

        let mut relations = TableRelations::default();
        for row in rows {
            let foreign_table: String = row.get("foreign_table");
            let foreign_column: String = row.get("foreign_column");
            let table: String = row.get("table");
            let column: String = row.get("column");

            relations
                .references
                .entry(foreign_table.clone())
                .or_default()
                .push(Dependency {
                    column: foreign_column.clone(),
                    fk_table: table.clone(),
                    fk_column: column.clone(),
                });
            relations
                .referenced_by
                .entry(table)
                .or_default()
                .push(Dependency {
                    column,
                    fk_table: foreign_table,
                    fk_column: foreign_column,
                });
        }

        let relations = Arc::new(relations);
        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .relations = Some(relations.clone());
        Ok(relations)
    }

    /// Tables which use `table` as a foreign key.
    pub async fn referenced_by(&self, table: &str, shard: &ShardName) -> Result<Vec<Dependency>> {
        Ok(self
            .table_relations(shard)
            .await?
            .referenced_by
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    /// Transitive closure of tables that must accompany `tables` in a copy or
    /// delete: iterative fixed point over the referenced-by adjacency map,
    /// expanding through foreign tables outside the seed set until an
    /// iteration adds nothing new.
    pub async fn discover_dependencies(
        &self,
        tables: &[String],
        shard: &ShardName,
    ) -> Result<BTreeMap<String, BTreeSet<Dependency>>> {
        let relations = self.table_relations(shard).await?;
        let seed: BTreeSet<&str> = tables.iter().map(|t| t.as_str()).collect();
        let mut discovered: BTreeMap<String, BTreeSet<Dependency>> = BTreeMap::new();

        loop {
            let mut found_any = false;
            for table in tables {
                let Some(related) = relations.referenced_by.get(table) else {
                    continue;
                };
                let entry = discovered.entry(table.clone()).or_default();
                for dep in related {
                    if seed.contains(dep.fk_table.as_str()) {
                        continue;
                    }
                    if entry.insert(dep.clone()) {
                        found_any = true;
                    }
                }
            }
            if !found_any {
                break;
            }
        }

        debug!(shard = %shard, tables = discovered.len(), "discovered dependencies");
        Ok(discovered)
    }

    pub async fn is_nullable(&self, table: &str, column: &str, shard: &ShardName) -> Result<bool> {
        let key = (table.to_string(), column.to_string());
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .nullable
            .get(&key)
        {
            return Ok(*cached);
        }

        let nullable: Option<String> = sqlx::query_scalar(
            r#"SELECT "is_nullable" FROM "information_schema"."columns"
               WHERE "table_name" = $1 AND "column_name" = $2"#,
        )
        .bind(table)
        .bind(column)
        .fetch_optional(self.registry.pool(shard)?)
        .await?;

        let result = nullable.as_deref() == Some("YES");
        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .nullable
            .insert(key, result);
        Ok(result)
    }

    /// Return type of a user-defined function, used by the query rewriter to
    /// type non-aggregate function projections.
    pub async fn pl_function_return_type(
        &self,
        function: &str,
        shard: &ShardName,
    ) -> Result<Option<String>> {
        if let Some(cached) = self
            .cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .fn_return_types
            .get(function)
        {
            return Ok(cached.clone());
        }

        let return_type: Option<String> = sqlx::query_scalar(
            r#"SELECT pg_catalog.format_type("pg_proc"."prorettype", NULL)
               FROM "pg_catalog"."pg_proc"
               WHERE "pg_proc"."proname" = $1
               LIMIT 1"#,
        )
        .bind(function)
        .fetch_optional(self.registry.pool(shard)?)
        .await?;

        self.cache
            .lock()
            .await
            .entry(shard.clone())
            .or_default()
            .fn_return_types
            .insert(function.to_string(), return_type.clone());
        Ok(return_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(columns: &[&str]) -> Vec<ColumnDescription> {
        columns
            .iter()
            .map(|c| ColumnDescription {
                column: c.to_string(),
                data_type: "bigint".to_string(),
            })
            .collect()
    }

    #[test]
    fn user_id_heuristic() {
        assert_eq!(find_user_id_column(&desc(&["id", "user_id"])), Some("user_id"));
        assert_eq!(find_user_id_column(&desc(&["userId", "someOtherId"])), Some("userId"));
        assert_eq!(find_user_id_column(&desc(&["id", "theUserId"])), Some("theUserId"));
        assert_eq!(find_user_id_column(&desc(&["parentUserId", "id"])), None);
        assert_eq!(find_user_id_column(&desc(&["id", "parent_user_id"])), None);
        assert_eq!(
            find_user_id_column(&desc(&["parentUserId", "someOtherId", "user_id"])),
            Some("user_id")
        );
    }
}
