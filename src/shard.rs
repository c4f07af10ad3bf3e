use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sqlx::PgPool;
use tracing::debug;

use crate::{Error, Result};

/// Logical connection name for one physical database, conventionally
/// `shard_<N>`.
///
/// All-digit names are rejected: integer shard ids are coerced to `shard_<N>`
/// throughout, so a bare numeric name would be indistinguishable from an id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardName(String);

impl ShardName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidShardName(name));
        }
        Ok(Self(name))
    }

    /// Coerce a physical shard id to its conventional connection name.
    pub fn from_id(id: i64) -> Self {
        Self(format!("shard_{id}"))
    }

    /// Extract the trailing numeric id from the name, if it has one.
    pub fn id(&self) -> Option<i64> {
        let digits: String = self
            .0
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ShardName {}

impl AsRef<str> for ShardName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Status of a logical shard in the control table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalShardStatus {
    Ok,
    Relocating,
}

impl LogicalShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalShardStatus::Ok => "OK",
            LogicalShardStatus::Relocating => "RELOCATING",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "OK" => Ok(LogicalShardStatus::Ok),
            "RELOCATING" => Ok(LogicalShardStatus::Relocating),
            other => Err(Error::Migration(format!(
                "unrecognized logical shard status `{other}`"
            ))),
        }
    }
}

/// One row of the `LogicalShard` control table.
#[derive(Clone, Debug)]
pub struct LogicalShardRow {
    pub id: i64,
    pub physical_shard_id: i64,
    pub status: LogicalShardStatus,
}

struct ShardEndpoint {
    pool: PgPool,
    /// libpq-style key=value conninfo as seen from *inside* the database
    /// servers, suitable for embedding in a `dblink()` call.
    conninfo: String,
}

/// Explicit registry of shard connections plus the primary connection that
/// hosts the `LogicalShard` control table. Constructed once and passed into
/// the orchestrator; `refresh` re-checks liveness on demand.
#[derive(Clone)]
pub struct ShardRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    shards: BTreeMap<ShardName, ShardEndpoint>,
    primary: ShardName,
}

pub struct ShardRegistryBuilder {
    shards: BTreeMap<ShardName, ShardEndpoint>,
    primary: Option<ShardName>,
}

impl ShardRegistry {
    pub fn builder() -> ShardRegistryBuilder {
        ShardRegistryBuilder {
            shards: BTreeMap::new(),
            primary: None,
        }
    }

    pub fn pool(&self, shard: &ShardName) -> Result<&PgPool> {
        self.inner
            .shards
            .get(shard)
            .map(|e| &e.pool)
            .ok_or_else(|| Error::UnknownShard(shard.to_string()))
    }

    pub fn conninfo(&self, shard: &ShardName) -> Result<&str> {
        self.inner
            .shards
            .get(shard)
            .map(|e| e.conninfo.as_str())
            .ok_or_else(|| Error::UnknownShard(shard.to_string()))
    }

    pub fn primary(&self) -> &ShardName {
        &self.inner.primary
    }

    pub fn primary_pool(&self) -> &PgPool {
        &self.inner.shards[&self.inner.primary].pool
    }

    pub fn contains(&self, shard: &ShardName) -> bool {
        self.inner.shards.contains_key(shard)
    }

    pub fn shard_names(&self) -> Vec<ShardName> {
        self.inner.shards.keys().cloned().collect()
    }

    /// Liveness check across every registered shard.
    pub async fn refresh(&self) -> Result<()> {
        for (name, endpoint) in &self.inner.shards {
            let one: i32 = sqlx::query_scalar("select 1")
                .fetch_one(&endpoint.pool)
                .await?;
            debug!(shard = %name, ok = one == 1, "shard liveness");
        }
        Ok(())
    }
}

impl ShardRegistryBuilder {
    /// Register a shard with its client pool and server-visible dblink
    /// conninfo.
    pub fn shard(
        mut self,
        name: ShardName,
        pool: PgPool,
        conninfo: impl Into<String>,
    ) -> Self {
        self.shards.insert(
            name,
            ShardEndpoint {
                pool,
                conninfo: conninfo.into(),
            },
        );
        self
    }

    /// Name the connection hosting the `LogicalShard` control table. Defaults
    /// to the first registered shard.
    pub fn primary(mut self, name: ShardName) -> Self {
        self.primary = Some(name);
        self
    }

    pub fn build(self) -> Result<ShardRegistry> {
        let primary = match self.primary {
            Some(p) => p,
            None => self
                .shards
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| Error::Migration("shard registry has no shards".into()))?,
        };
        if !self.shards.contains_key(&primary) {
            return Err(Error::UnknownShard(primary.to_string()));
        }
        Ok(ShardRegistry {
            inner: Arc::new(RegistryInner {
                shards: self.shards,
                primary,
            }),
        })
    }
}
