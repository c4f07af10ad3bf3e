//! Distributed SELECT rewriting.
//!
//! Takes a single-shard SELECT and fans it out across every shard through
//! `dblink`, recombining the per-shard result sets with `UNION` and an outer
//! aggregation layer. Joins and subqueries are out of scope; plain SELECTs
//! with projections, WHERE, GROUP BY, ORDER BY and LIMIT are supported.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, ObjectName, OrderByKind,
    Query, Select, SelectItem, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlx::postgres::PgRow;
use tracing::{debug, info};

use crate::metrics::record_dblink_statement;
use crate::reflect::SchemaReflector;
use crate::shard::{ShardName, ShardRegistry};
use crate::sqlgen::{self, quote_ident, quote_literal, to_single_line};
use crate::{Error, Result};

/// Positional query parameter. Rendered into the dblink arm as a SQL literal;
/// bound normally on the single-shard passthrough path.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryParam {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl QueryParam {
    fn render(&self) -> String {
        match self {
            QueryParam::Int(v) => v.to_string(),
            QueryParam::Bool(true) => "TRUE".to_string(),
            QueryParam::Bool(false) => "FALSE".to_string(),
            QueryParam::Text(v) => quote_literal(v),
        }
    }
}

/// Result of a rewrite. When only one shard was targeted the original query
/// passes through untouched and `params` must still be bound.
#[derive(Clone, Debug)]
pub struct RewrittenQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub fanned_out: bool,
}

/// Aggregate return types; `<T>` means "same as the argument column".
fn aggregate_return_type(function: &str) -> Option<&'static str> {
    match function {
        "avg" => Some("numeric"),
        "bit_and" | "bit_or" | "max" | "min" | "string_agg" => Some("<T>"),
        "bool_and" | "bool_or" | "every" => Some("bool"),
        "count" => Some("bigint"),
        "sum" => Some("numeric"),
        "xmlagg" => Some("xml"),
        _ => None,
    }
}

const DEFAULT_TYPE: &str = "character varying";

/// One projected identifier after analysis: its name inside the record shape
/// (also how the outer query refers to it), its resolved type, and the
/// aggregate wrapped around it, if any.
#[derive(Clone, Debug)]
struct Projection {
    record_name: String,
    data_type: String,
    function: Option<String>,
    /// Normalized source text, for remapping ORDER BY / GROUP BY columns.
    source_key: String,
}

struct ReferencedTable {
    table: String,
    alias: Option<String>,
}

pub struct DistributedQueryRewriter {
    registry: ShardRegistry,
    reflector: SchemaReflector,
    persistent_dblink: bool,
}

impl DistributedQueryRewriter {
    pub fn new(registry: ShardRegistry, reflector: SchemaReflector) -> Self {
        Self {
            registry,
            reflector,
            persistent_dblink: false,
        }
    }

    /// Use named server-side dblink connections instead of an inline conninfo
    /// per arm. Cheaper when many distributed queries run back to back.
    pub fn with_persistent_dblink(mut self, enabled: bool) -> Self {
        self.persistent_dblink = enabled;
        self
    }

    fn resolve_targets(&self, shards: Option<&[ShardName]>) -> Result<Vec<ShardName>> {
        let targets = match shards {
            Some(list) => list.to_vec(),
            None => self.registry.shard_names(),
        };
        for shard in &targets {
            if !self.registry.contains(shard) {
                return Err(Error::UnknownShard(shard.to_string()));
            }
        }
        if targets.is_empty() {
            return Err(Error::UnsupportedQuery("no target shards".to_string()));
        }
        Ok(targets)
    }

    /// Rewrite `sql` into a fan-out query over `shards` (all registry shards
    /// when `None`). With exactly one target the query is returned verbatim.
    pub async fn distributed_select(
        &self,
        sql: &str,
        params: &[QueryParam],
        include_shard_name: bool,
        shards: Option<&[ShardName]>,
    ) -> Result<RewrittenQuery> {
        let targets = self.resolve_targets(shards)?;
        if targets.len() == 1 {
            return Ok(RewrittenQuery {
                sql: sql.to_string(),
                params: params.to_vec(),
                fanned_out: false,
            });
        }

        let dialect = PostgreSqlDialect {};
        let mut statements = Parser::parse_sql(&dialect, sql)?;
        if statements.len() != 1 {
            return Err(Error::UnsupportedQuery(
                "expected exactly one statement".to_string(),
            ));
        }
        let Statement::Query(query) = statements.remove(0) else {
            return Err(Error::UnsupportedQuery(
                "only SELECT statements can be distributed".to_string(),
            ));
        };
        let SetExpr::Select(select) = *query.body.clone() else {
            return Err(Error::UnsupportedQuery(
                "only plain SELECT bodies can be distributed".to_string(),
            ));
        };

        let referenced = referenced_tables(&select)?;
        let main_table = referenced
            .first()
            .map(|r| r.table.clone())
            .ok_or_else(|| Error::UnsupportedQuery("query has no FROM table".to_string()))?;

        // Types come from the first target; schemas are identical shard to
        // shard.
        let type_shard = &targets[0];
        let projections = self
            .analyze_projections(&select, &main_table, &referenced, type_shard)
            .await?;

        let inner_sql = to_single_line(&render_params(sql, params)?).replace('\'', "''");
        let shape: Vec<crate::reflect::ColumnDescription> = projections
            .iter()
            .map(|p| crate::reflect::ColumnDescription {
                column: p.record_name.clone(),
                data_type: p.data_type.clone(),
            })
            .collect();
        let record_shape = sqlgen::dblink_record_shape(&shape);

        let mut arms = Vec::with_capacity(targets.len());
        for shard in &targets {
            let source = if self.persistent_dblink {
                shard.as_str().to_string()
            } else {
                self.registry.conninfo(shard)?.to_string()
            };
            let shard_column = if include_shard_name {
                format!(", '{shard}' AS \"shard\"")
            } else {
                String::new()
            };
            arms.push(format!(
                "SELECT *{shard_column} FROM dblink('{source}', '{inner_sql}') AS {record_shape}"
            ));
            record_dblink_statement();
        }

        let mut outer_idents: Vec<String> = projections.iter().map(remap_outer_ident).collect();
        if include_shard_name {
            outer_idents.push("\"shard\"".to_string());
        }

        let grouping_tail = grouping_tail(&projections, include_shard_name);
        let outer_tail = outer_tail(&query, &select, &projections, grouping_tail.is_some());

        let mut rewritten = format!(
            "SELECT {} FROM (\n{}\n) q0",
            outer_idents.join(", "),
            arms.join("\nUNION\n"),
        );
        if let Some(tail) = grouping_tail {
            rewritten.push(' ');
            rewritten.push_str(&tail);
        }
        if !outer_tail.is_empty() {
            rewritten.push(' ');
            rewritten.push_str(&outer_tail);
        }

        debug!(original = sql, rewritten = %rewritten, "distributed select");
        Ok(RewrittenQuery {
            sql: rewritten,
            params: Vec::new(),
            fanned_out: true,
        })
    }

    /// Rewrite then execute, returning the combined rows.
    pub async fn evaluated_distributed_select(
        &self,
        sql: &str,
        params: &[QueryParam],
        include_shard_name: bool,
        shards: Option<&[ShardName]>,
    ) -> Result<Vec<PgRow>> {
        let targets = self.resolve_targets(shards)?;
        let rewritten = self
            .distributed_select(sql, params, include_shard_name, Some(&targets))
            .await?;

        if !rewritten.fanned_out {
            let pool = self.registry.pool(&targets[0])?;
            let mut q = sqlx::query(&rewritten.sql);
            for param in &rewritten.params {
                q = match param {
                    QueryParam::Int(v) => q.bind(*v),
                    QueryParam::Bool(v) => q.bind(*v),
                    QueryParam::Text(v) => q.bind(v.as_str()),
                };
            }
            return Ok(q.fetch_all(pool).await?);
        }

        let using = self.registry.primary().clone();
        if self.persistent_dblink {
            self.ensure_persistent_links(&using, &targets).await?;
        }
        Ok(sqlx::query(&rewritten.sql)
            .fetch_all(self.registry.pool(&using)?)
            .await?)
    }

    /// Execute a statement on every registered shard.
    pub async fn multi_shard_exec(&self, sql: &str) -> Result<()> {
        for shard in self.registry.shard_names() {
            sqlx::query(sql)
                .execute(self.registry.pool(&shard)?)
                .await?;
            debug!(shard = %shard, "multi-shard exec");
        }
        Ok(())
    }

    /// Make sure a named dblink connection exists on `using` for each target
    /// shard, creating the missing ones.
    async fn ensure_persistent_links(
        &self,
        using: &ShardName,
        shards: &[ShardName],
    ) -> Result<()> {
        let pool = self.registry.pool(using)?;
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT unnest(dblink_get_connections())")
                .fetch_all(pool)
                .await?;
        for shard in shards {
            if existing.iter().any(|h| h == shard.as_str()) {
                continue;
            }
            info!(handle = %shard, using = %using, "connecting persistent dblink");
            sqlx::query("SELECT dblink_connect($1, $2)")
                .bind(shard.as_str())
                .bind(self.registry.conninfo(shard)?)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    async fn analyze_projections(
        &self,
        select: &Select,
        main_table: &str,
        referenced: &[ReferencedTable],
        shard: &ShardName,
    ) -> Result<Vec<Projection>> {
        let mut out = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => {
                    for col in self.reflector.describe(main_table, shard).await? {
                        out.push(Projection {
                            source_key: normalize_key(&col.column),
                            record_name: col.column,
                            data_type: col.data_type,
                            function: None,
                        });
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    out.push(
                        self.analyze_expr(expr, None, main_table, referenced, shard)
                            .await?,
                    );
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    out.push(
                        self.analyze_expr(
                            expr,
                            Some(alias.value.clone()),
                            main_table,
                            referenced,
                            shard,
                        )
                        .await?,
                    );
                }
                other => {
                    return Err(Error::UnsupportedQuery(format!(
                        "unsupported projection `{other}`"
                    )));
                }
            }
        }
        Ok(out)
    }

    async fn analyze_expr(
        &self,
        expr: &Expr,
        alias: Option<String>,
        main_table: &str,
        referenced: &[ReferencedTable],
        shard: &ShardName,
    ) -> Result<Projection> {
        match expr {
            Expr::Identifier(ident) => {
                let data_type = self
                    .column_type(main_table, &ident.value, shard)
                    .await?
                    .unwrap_or_else(|| DEFAULT_TYPE.to_string());
                Ok(Projection {
                    source_key: normalize_key(&ident.value),
                    record_name: alias.unwrap_or_else(|| ident.value.clone()),
                    data_type,
                    function: None,
                })
            }
            Expr::CompoundIdentifier(parts) => {
                let (qualifier, column) = match parts.as_slice() {
                    [q, c] => (q.value.clone(), c.value.clone()),
                    _ => {
                        return Err(Error::UnsupportedQuery(format!(
                            "unsupported identifier `{expr}`"
                        )));
                    }
                };
                let table = resolve_alias(&qualifier, referenced);
                let data_type = self
                    .column_type(&table, &column, shard)
                    .await?
                    .unwrap_or_else(|| DEFAULT_TYPE.to_string());
                Ok(Projection {
                    source_key: normalize_key(&format!("{qualifier}.{column}")),
                    // The record shape assigns names positionally, so the
                    // qualifier is flattened into the name.
                    record_name: alias.unwrap_or_else(|| format!("{qualifier}_{column}")),
                    data_type,
                    function: None,
                })
            }
            Expr::Function(func) => {
                let name = function_name(&func.name).to_lowercase();
                let data_type = match aggregate_return_type(&name) {
                    Some("<T>") => {
                        match first_argument_column(&func.args) {
                            Some((qualifier, column)) => {
                                let table = qualifier
                                    .map(|q| resolve_alias(&q, referenced))
                                    .unwrap_or_else(|| main_table.to_string());
                                self.column_type(&table, &column, shard)
                                    .await?
                                    .unwrap_or_else(|| DEFAULT_TYPE.to_string())
                            }
                            None => DEFAULT_TYPE.to_string(),
                        }
                    }
                    Some(fixed) => fixed.to_string(),
                    None => self
                        .reflector
                        .pl_function_return_type(&name, shard)
                        .await?
                        .unwrap_or_else(|| DEFAULT_TYPE.to_string()),
                };
                Ok(Projection {
                    source_key: normalize_key(&expr.to_string()),
                    record_name: alias.unwrap_or_else(|| name.clone()),
                    data_type,
                    function: Some(name),
                })
            }
            other => match alias {
                Some(alias) => Ok(Projection {
                    source_key: normalize_key(&other.to_string()),
                    record_name: alias,
                    data_type: DEFAULT_TYPE.to_string(),
                    function: None,
                }),
                None => Err(Error::UnsupportedQuery(format!(
                    "cannot infer a column name for `{other}`, add an alias"
                ))),
            },
        }
    }

    async fn column_type(
        &self,
        table: &str,
        column: &str,
        shard: &ShardName,
    ) -> Result<Option<String>> {
        Ok(self
            .reflector
            .describe(table, shard)
            .await?
            .into_iter()
            .find(|c| c.column.eq_ignore_ascii_case(column))
            .map(|c| c.data_type))
    }
}

/// Outer-layer identifier for one projection: aggregates are re-applied on
/// top of the union (`count` becomes `SUM`, functions uppercased), plain
/// columns pass through quoted.
fn remap_outer_ident(projection: &Projection) -> String {
    let quoted = quote_ident(&projection.record_name);
    match projection.function.as_deref() {
        Some("count") => {
            // SUM over the per-shard bigint counts widens to numeric; cast
            // back so the recombined column keeps count's type.
            format!("SUM({quoted})::bigint")
        }
        Some(function) if aggregate_return_type(function).is_some() => {
            format!("{}({quoted})", function.to_uppercase())
        }
        _ => quoted,
    }
}

/// Synthesized GROUP BY for the outer query. A lone `count` with shard
/// tagging groups by shard; aggregates mixed with plain columns group by the
/// plain columns.
fn grouping_tail(projections: &[Projection], include_shard_name: bool) -> Option<String> {
    let is_aggregate =
        |p: &Projection| matches!(p.function.as_deref(), Some(f) if aggregate_return_type(f).is_some());

    if projections.len() == 1 {
        if include_shard_name && projections[0].function.as_deref() == Some("count") {
            return Some("GROUP BY \"shard\"".to_string());
        }
        return None;
    }

    if !projections.iter().any(is_aggregate) {
        return None;
    }
    let plain: Vec<String> = projections
        .iter()
        .filter(|p| !is_aggregate(p))
        .map(|p| quote_ident(&p.record_name))
        .collect();
    if plain.is_empty() {
        return None;
    }
    Some(format!("GROUP BY {}", plain.join(", ")))
}

/// Original GROUP BY / ORDER BY re-expressed against the outer layer's
/// column names. LIMIT and OFFSET are dropped; each arm already applied them
/// remotely.
fn outer_tail(
    query: &Query,
    select: &Select,
    projections: &[Projection],
    grouping_synthesized: bool,
) -> String {
    let aliases: HashMap<String, String> = projections
        .iter()
        .map(|p| (p.source_key.clone(), quote_ident(&p.record_name)))
        .collect();
    let remap = |text: &str| -> String {
        aliases
            .get(&normalize_key(text))
            .cloned()
            .unwrap_or_else(|| text.to_string())
    };

    let mut parts = Vec::new();
    if !grouping_synthesized {
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            if !exprs.is_empty() {
                let columns: Vec<String> =
                    exprs.iter().map(|e| remap(&e.to_string())).collect();
                parts.push(format!("GROUP BY {}", columns.join(", ")));
            }
        }
    }
    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            let columns: Vec<String> = exprs
                .iter()
                .map(|oe| {
                    let full = oe.to_string();
                    let head = oe.expr.to_string();
                    let suffix = full.strip_prefix(&head).unwrap_or("");
                    format!("{}{}", remap(&head), suffix)
                })
                .collect();
            if !columns.is_empty() {
                parts.push(format!("ORDER BY {}", columns.join(", ")));
            }
        }
    }
    parts.join(" ")
}

fn referenced_tables(select: &Select) -> Result<Vec<ReferencedTable>> {
    let mut out = Vec::new();
    for from in &select.from {
        collect_table(&from.relation, &mut out)?;
        for join in &from.joins {
            collect_table(&join.relation, &mut out)?;
        }
    }
    Ok(out)
}

fn collect_table(factor: &TableFactor, out: &mut Vec<ReferencedTable>) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            out.push(ReferencedTable {
                table: object_name(name),
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            });
            Ok(())
        }
        other => Err(Error::UnsupportedQuery(format!(
            "unsupported table factor `{other}`"
        ))),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .and_then(|p| p.as_ident())
        .map(|i| i.value.clone())
        .unwrap_or_else(|| name.to_string())
}

fn function_name(name: &ObjectName) -> String {
    object_name(name)
}

fn resolve_alias(qualifier: &str, referenced: &[ReferencedTable]) -> String {
    referenced
        .iter()
        .find(|r| r.alias.as_deref() == Some(qualifier))
        .map(|r| r.table.clone())
        .unwrap_or_else(|| qualifier.to_string())
}

/// First plain-column argument of an aggregate call, as
/// `(optional qualifier, column)`.
fn first_argument_column(args: &FunctionArguments) -> Option<(Option<String>, String)> {
    let FunctionArguments::List(list) = args else {
        return None;
    };
    for arg in &list.args {
        if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
            match expr {
                Expr::Identifier(ident) => return Some((None, ident.value.clone())),
                Expr::CompoundIdentifier(parts) => {
                    if let [q, c] = parts.as_slice() {
                        return Some((Some(q.value.clone()), c.value.clone()));
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn normalize_key(text: &str) -> String {
    text.replace('"', "").to_lowercase()
}

/// Substitute `$N` placeholders with rendered literals, for embedding in a
/// dblink arm where binding is impossible.
fn render_params(sql: &str, params: &[QueryParam]) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\$(\d+)").expect("param regex"));

    let mut missing: Option<usize> = None;
    let rendered = re.replace_all(sql, |caps: &regex::Captures<'_>| {
        let index: usize = caps[1].parse().unwrap_or(0);
        match index.checked_sub(1).and_then(|i| params.get(i)) {
            Some(param) => param.render(),
            None => {
                missing = Some(index);
                String::new()
            }
        }
    });
    if let Some(index) = missing {
        return Err(Error::UnsupportedQuery(format!(
            "no value supplied for parameter ${index}"
        )));
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_render_as_literals() {
        let sql = render_params(
            "SELECT * FROM t WHERE a = $1 AND b = $2 AND c = $3",
            &[
                QueryParam::Int(7),
                QueryParam::Text("it's".to_string()),
                QueryParam::Bool(true),
            ],
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = 7 AND b = 'it''s' AND c = TRUE");
    }

    #[test]
    fn missing_param_is_an_error() {
        assert!(render_params("SELECT $1, $2", &[QueryParam::Int(1)]).is_err());
    }

    #[test]
    fn aggregate_types() {
        assert_eq!(aggregate_return_type("count"), Some("bigint"));
        assert_eq!(aggregate_return_type("avg"), Some("numeric"));
        assert_eq!(aggregate_return_type("max"), Some("<T>"));
        assert_eq!(aggregate_return_type("lower"), None);
    }

    #[test]
    fn count_remaps_to_sum() {
        let projection = Projection {
            record_name: "count".to_string(),
            data_type: "bigint".to_string(),
            function: Some("count".to_string()),
            source_key: "count(*)".to_string(),
        };
        assert_eq!(remap_outer_ident(&projection), "SUM(\"count\")::bigint");
    }

    #[test]
    fn lone_count_groups_by_shard_when_tagged() {
        let projections = vec![Projection {
            record_name: "count".to_string(),
            data_type: "bigint".to_string(),
            function: Some("count".to_string()),
            source_key: "count(*)".to_string(),
        }];
        assert_eq!(
            grouping_tail(&projections, true).as_deref(),
            Some("GROUP BY \"shard\"")
        );
        assert_eq!(grouping_tail(&projections, false), None);
    }

    #[test]
    fn mixed_aggregates_group_by_plain_columns() {
        let projections = vec![
            Projection {
                record_name: "user_id".to_string(),
                data_type: "bigint".to_string(),
                function: None,
                source_key: "user_id".to_string(),
            },
            Projection {
                record_name: "count".to_string(),
                data_type: "bigint".to_string(),
                function: Some("count".to_string()),
                source_key: "count(*)".to_string(),
            },
        ];
        assert_eq!(
            grouping_tail(&projections, false).as_deref(),
            Some("GROUP BY \"user_id\"")
        );
    }
}
