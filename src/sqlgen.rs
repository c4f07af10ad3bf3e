//! Shared SQL text builders: quoting, single-lining, dblink record shapes,
//! and the SELECT-to-INSERT generators used by the dump path.
//!
//! Identifier arguments to these builders must come from the schema
//! reflector's own catalog output (or static configuration), never from
//! external input.

use std::sync::OnceLock;

use regex::Regex;
use sqlx::PgPool;

use crate::Result;
use crate::reflect::ColumnDescription;

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Render a value as a single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

/// Collapse whitespace runs to single spaces. Used before embedding a query
/// inside a dblink literal; not guaranteed safe for arbitrary SQL carrying
/// significant whitespace inside string literals.
pub fn to_single_line(sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    re.replace_all(sql, " ").trim().to_string()
}

/// Comma-join an id set for an `IN (...)` clause.
pub fn in_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the `t("col" type, ...)` record shape a dblink call must be aliased
/// with so the remote result set gets concrete local column types.
pub fn dblink_record_shape(description: &[ColumnDescription]) -> String {
    let columns = description
        .iter()
        .map(|col| format!("{} {}", quote_ident(&col.column), col.data_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("t({columns})")
}

/// Generate a SELECT which, when executed, yields one INSERT statement per
/// matching row. `quote_nullable` makes the emitted literals safe to replay.
pub fn select_to_insert(
    table: &str,
    description: &[ColumnDescription],
    where_clause: Option<&str>,
) -> String {
    let columns = description
        .iter()
        .map(|col| quote_ident(&col.column))
        .collect::<Vec<_>>()
        .join(",");
    let values = description
        .iter()
        .map(|col| format!("quote_nullable({})", quote_ident(&col.column)))
        .collect::<Vec<_>>()
        .join(" || ',' || ");
    let where_sql = render_where(where_clause);
    format!(
        "SELECT 'INSERT INTO {table_quoted_escaped} ({columns}) VALUES (' || {values} || ');' FROM {table_quoted}{where_sql};",
        table_quoted_escaped = quote_ident(table).replace('\'', "''"),
        table_quoted = quote_ident(table),
    )
}

/// Evaluate the row-tuple generator on `pool` and combine the results into a
/// single multi-row INSERT, or `None` when no rows match.
pub async fn select_to_multi_insert(
    pool: &PgPool,
    table: &str,
    description: &[ColumnDescription],
    where_clause: Option<&str>,
) -> Result<Option<String>> {
    let values = description
        .iter()
        .map(|col| format!("quote_nullable({})", quote_ident(&col.column)))
        .collect::<Vec<_>>()
        .join(" || ',' || ");
    let where_sql = render_where(where_clause);
    let intermediate = format!(
        "SELECT '(' || {values} || ')' FROM {table}{where_sql}",
        table = quote_ident(table),
    );

    let tuples: Vec<String> = sqlx::query_scalar(&intermediate).fetch_all(pool).await?;
    if tuples.is_empty() {
        return Ok(None);
    }

    let columns = description
        .iter()
        .map(|col| quote_ident(&col.column))
        .collect::<Vec<_>>()
        .join(",");
    Ok(Some(format!(
        "INSERT INTO {table} ({columns}) VALUES {rows};",
        table = quote_ident(table),
        rows = tuples.join(","),
    )))
}

fn render_where(where_clause: Option<&str>) -> String {
    match where_clause {
        Some(clause) if clause.trim_start().to_lowercase().starts_with("where ") => {
            format!(" {}", clause.trim())
        }
        Some(clause) => format!(" WHERE {}", clause.trim()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(pairs: &[(&str, &str)]) -> Vec<ColumnDescription> {
        pairs
            .iter()
            .map(|(c, t)| ColumnDescription {
                column: c.to_string(),
                data_type: t.to_string(),
            })
            .collect()
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn single_line_collapses() {
        assert_eq!(
            to_single_line("SELECT *\n  FROM \"t\"\n  WHERE x = 1  "),
            "SELECT * FROM \"t\" WHERE x = 1"
        );
    }

    #[test]
    fn record_shape() {
        let shape = dblink_record_shape(&desc(&[
            ("id", "integer"),
            ("name", "character varying(128)"),
        ]));
        assert_eq!(shape, "t(\"id\" integer, \"name\" character varying(128))");
    }

    #[test]
    fn select_to_insert_shape() {
        let sql = select_to_insert(
            "auth_user",
            &desc(&[("id", "bigint"), ("username", "character varying(85)")]),
            Some("\"id\" IN (42,99)"),
        );
        assert_eq!(
            sql,
            "SELECT 'INSERT INTO \"auth_user\" (\"id\",\"username\") VALUES (' || \
             quote_nullable(\"id\") || ',' || quote_nullable(\"username\") || ');' \
             FROM \"auth_user\" WHERE \"id\" IN (42,99);"
        );
    }

    #[test]
    fn where_clause_prefix_is_optional() {
        assert_eq!(render_where(Some("WHERE x = 1")), " WHERE x = 1");
        assert_eq!(render_where(Some("x = 1")), " WHERE x = 1");
        assert_eq!(render_where(None), "");
    }
}
