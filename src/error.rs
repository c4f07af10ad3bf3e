use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::shard::ShardName;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sql parse error: {0}")]
    SqlParse(#[from] sqlparser::parser::ParserError),
    #[error("invalid shard name `{0}`")]
    InvalidShardName(String),
    #[error("unknown shard `{0}`")]
    UnknownShard(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("dependency cycle detected after {failures} consecutive failures, remaining: {remaining:?}")]
    DependencyCycle {
        failures: u32,
        remaining: Vec<String>,
    },
    #[error("lock contention while deleting from `{table}`: {message}")]
    LockContention { table: String, message: String },
    #[error(
        "aborted copy of users {user_ids:?} from {source} to {destination} due to changed source data"
    )]
    StaleRead {
        user_ids: Vec<i64>,
        source: ShardName,
        destination: ShardName,
        pre_source: BTreeMap<String, i64>,
        post_source: BTreeMap<String, i64>,
        post_destination: BTreeMap<String, i64>,
    },
    #[error("repair for `{0}` had no effect, aborting")]
    RepairLoop(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("distributed query unsupported: {0}")]
    UnsupportedQuery(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

/// What kind of constraint a driver error violated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    Unique,
    ForeignKey,
    Other,
}

/// Structured view of a Postgres constraint-violation error.
///
/// Built from the driver's structured fields (SQLSTATE, constraint, table,
/// DETAIL) when available, with a regex pass over the flattened message as a
/// fallback. Conflict resolvers match on this rather than raw error text.
#[derive(Clone, Debug)]
pub struct Violation {
    pub kind: ViolationKind,
    pub sqlstate: Option<String>,
    pub constraint: Option<String>,
    pub table: Option<String>,
    pub detail_key: Option<String>,
    pub detail_value: Option<String>,
    pub message: String,
}

fn detail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Key \(([^)]+)\)=\((.+?)\) (?:already exists|is not present in table "([^"]+)")"#)
            .expect("detail regex")
    })
}

fn message_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(duplicate key value violates unique constraint "([^"]+)")|(insert or update on table "([^"]+)" violates foreign key constraint "([^"]+)")"#,
        )
        .expect("message regex")
    })
}

/// Classify an error as a structured constraint violation, if it is one.
///
/// Walks through `Context` wrappers to the underlying driver error. Returns
/// `None` for anything that is not a database error.
pub fn classify(err: &Error) -> Option<Violation> {
    let mut current = err;
    while let Error::Context { source, .. } = current {
        current = source;
    }

    let Error::Db(sqlx::Error::Database(db)) = current else {
        return None;
    };

    let pg = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>();
    let sqlstate = pg.map(|p| p.code().to_string());
    let mut constraint = pg.and_then(|p| p.constraint()).map(str::to_string);
    let mut table = pg.and_then(|p| p.table()).map(str::to_string);
    let detail = pg.and_then(|p| p.detail()).map(str::to_string);

    // Flatten the full error text so the regex fallback sees one line.
    let mut message = db.message().replace('\n', " ");
    if let Some(ref d) = detail {
        message.push_str(" DETAIL: ");
        message.push_str(&d.replace('\n', " "));
    }

    let mut kind = match sqlstate.as_deref() {
        Some("23505") => ViolationKind::Unique,
        Some("23503") => ViolationKind::ForeignKey,
        Some(_) => ViolationKind::Other,
        None => ViolationKind::Other,
    };

    if kind == ViolationKind::Other {
        if let Some(caps) = message_fallback_re().captures(&message) {
            if caps.get(1).is_some() {
                kind = ViolationKind::Unique;
                constraint = constraint.or_else(|| caps.get(2).map(|m| m.as_str().to_string()));
            } else {
                kind = ViolationKind::ForeignKey;
                table = table.or_else(|| caps.get(4).map(|m| m.as_str().to_string()));
                constraint = constraint.or_else(|| caps.get(5).map(|m| m.as_str().to_string()));
            }
        }
    }

    let (mut detail_key, mut detail_value) = (None, None);
    let detail_text = detail.as_deref().unwrap_or(&message);
    if let Some(caps) = detail_re().captures(detail_text) {
        detail_key = caps.get(1).map(|m| m.as_str().to_string());
        detail_value = caps.get(2).map(|m| m.as_str().to_string());
    }

    Some(Violation {
        kind,
        sqlstate,
        constraint,
        table,
        detail_key,
        detail_value,
        message,
    })
}

impl Violation {
    /// The referenced table named in an FK violation DETAIL line, if any.
    pub fn referenced_table(&self) -> Option<String> {
        detail_re()
            .captures(&self.message)
            .and_then(|caps| caps.get(3).map(|m| m.as_str().to_string()))
    }
}

/// True when the error text indicates a blocked lock acquisition, which must
/// never be retried (a concurrent writer holds a conflicting transaction).
pub fn is_lock_contention(err: &Error) -> bool {
    err.to_string().contains("waits for ShareLock on transaction")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_parse_unique() {
        let caps = detail_re()
            .captures("Key (username)=(openiduser12) already exists.")
            .unwrap();
        assert_eq!(&caps[1], "username");
        assert_eq!(&caps[2], "openiduser12");
    }

    #[test]
    fn detail_parse_foreign_key() {
        let caps = detail_re()
            .captures("Key (group_id)=(41) is not present in table \"main_group\".")
            .unwrap();
        assert_eq!(&caps[1], "group_id");
        assert_eq!(&caps[2], "41");
        assert_eq!(caps.get(3).unwrap().as_str(), "main_group");
    }

    #[test]
    fn message_fallback_unique() {
        let caps = message_fallback_re()
            .captures("duplicate key value violates unique constraint \"username\"")
            .unwrap();
        assert!(caps.get(1).is_some());
        assert_eq!(caps.get(2).unwrap().as_str(), "username");
    }

    #[test]
    fn message_fallback_foreign_key() {
        let caps = message_fallback_re()
            .captures(
                "insert or update on table \"main_receipt\" violates foreign key constraint \"main_receipt__message_id_fk\"",
            )
            .unwrap();
        assert_eq!(caps.get(4).unwrap().as_str(), "main_receipt");
        assert_eq!(caps.get(5).unwrap().as_str(), "main_receipt__message_id_fk");
    }
}
