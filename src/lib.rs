//! Shardmover — sharded-Postgres user migration engine.
//!
//! Moves the complete data graph of a set of users between physical shards:
//! schema-driven discovery of every table referencing a user, dblink-based
//! cross-shard copy with savepoint-per-table retry, automatic repair of
//! recognized constraint violations, and row-count verification before any
//! shard reassignment is committed. A distributed SELECT rewriter fans a
//! single logical query out across all shards and recombines the results.

pub mod config;
pub mod distributed;
mod error;
pub mod hooks;
pub mod metrics;
pub mod migrate;
pub mod mover;
pub mod reflect;
pub mod replicate;
pub mod resolvers;
pub mod shard;
pub mod sqlgen;
pub mod testing;
pub mod worklist;

/// Per-table matching row counts, as produced by
/// [`UserDataMover::table_row_counts`].
pub type RowCounts = std::collections::BTreeMap<String, i64>;

pub use config::{AdditionalRelation, MigrationConfig, TablePair};
pub use distributed::{DistributedQueryRewriter, QueryParam, RewrittenQuery};
pub use error::{Error, Result, Violation, ViolationKind, WithContext, classify};
pub use migrate::{LogicalShardMigrator, MigrationReport};
pub use mover::{CopyOptions, DeleteOptions, MigrationDump, UserDataMover};
pub use replicate::TableReplicator;
pub use resolvers::{ConflictResolver, RepairContext, RepairSide, find_resolver};
pub use shard::{LogicalShardRow, LogicalShardStatus, ShardName, ShardRegistry};

pub mod prelude {
    pub use crate::{
        Error, LogicalShardMigrator, MigrationConfig, Result, ShardName, ShardRegistry,
        UserDataMover,
    };
}
