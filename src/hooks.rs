//! Narrow contracts for the external collaborators the engine calls out to.
//!
//! All three are fire-and-forget from the engine's point of view: backup
//! failures are logged and never retried, cache flushes and event publishes
//! never propagate errors into a migration.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::Result;

/// Durable write of a migration artifact; returns an address for the log.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn put(&self, path: &str, data: &[u8]) -> Result<String>;
}

/// Best-effort invalidation of the shard-location cache layer.
#[async_trait]
pub trait CacheFlusher: Send + Sync {
    async fn flush(&self);
}

/// Fire-and-forget notification bus (e.g. `movedUser`) so other subsystems
/// can refresh their own shard-location state.
#[async_trait]
pub trait ShardEventBus: Send + Sync {
    async fn publish(&self, event: &str, payload: Value);
}

/// Directory-backed backup store, mostly for tests and local tooling.
pub struct LocalBackupStore {
    root: PathBuf,
}

impl LocalBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<String> {
        let target = self.root.join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        Ok(format!("file://{}", target.display()))
    }
}

pub struct NoopBackupStore;

#[async_trait]
impl BackupStore for NoopBackupStore {
    async fn put(&self, path: &str, _data: &[u8]) -> Result<String> {
        warn!(path, "backup store not configured, dropping artifact");
        Ok(format!("discarded:{path}"))
    }
}

pub struct NoopCacheFlusher;

#[async_trait]
impl CacheFlusher for NoopCacheFlusher {
    async fn flush(&self) {}
}

pub struct NoopEventBus;

#[async_trait]
impl ShardEventBus for NoopEventBus {
    async fn publish(&self, _event: &str, _payload: Value) {}
}
