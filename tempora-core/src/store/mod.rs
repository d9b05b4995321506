//! Backing key/value store
//!
//! Everything Tempora persists goes through the [`Store`] trait: pipelined
//! batches of sorted-set and blob commands plus a handful of reads. The
//! in-process [`MemoryStore`] and its sharded [`ClusterStore`] variant keep
//! the keyspace in memory with absolute expiry, and can be snapshotted to
//! disk between restarts.

mod cluster;
mod memory;
mod snapshot;

pub use cluster::ClusterStore;
pub use memory::{MemoryStore, SortedSet, StoredValue};
pub use snapshot::{
    load_snapshot, restore_snapshot, write_snapshot, SnapshotEntry, SnapshotFrame,
};

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single write applied as part of a pipelined batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Add `delta` to the score of `member`, creating it at zero
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    /// Set the score of `member`
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove `member`
    ZRem { key: String, member: String },
    /// Append bytes to a blob, creating it empty
    Append { key: String, value: Vec<u8> },
    /// Expire `key` at an absolute unix time in seconds; no-op for missing keys
    ExpireAt { key: String, at: i64 },
}

impl Command {
    /// Key the command operates on
    pub fn key(&self) -> &str {
        match self {
            Command::ZIncrBy { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::Append { key, .. }
            | Command::ExpireAt { key, .. } => key,
        }
    }
}

/// Backing store operations
pub trait Store: Send + Sync {
    /// Apply a batch of commands in order
    ///
    /// Every command is attempted; the first failure is reported after the
    /// whole batch has been applied.
    fn execute(&self, batch: Vec<Command>) -> Result<()>;

    /// All members of a sorted set ordered by ascending score
    fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Up to `limit` members with score `<= max`, ascending
    fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<(String, f64)>>;

    /// Contents of a blob
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Live keyspace, for snapshots
    fn export(&self) -> Vec<SnapshotEntry>;

    /// Load previously exported entries, replacing existing keys
    fn import(&self, entries: Vec<SnapshotEntry>);

    /// Drop expired keys; returns how many were removed
    fn purge_expired(&self) -> usize;
}

/// Source of the current unix time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Store topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// One keyspace
    Standalone,
    /// Keyspace split across shards by hash tag
    Cluster,
}

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefix of every key written
    pub prefix: String,
    pub mode: StoreMode,
    /// Shard count in cluster mode
    pub shards: usize,
    /// Where snapshots are written; snapshots are disabled when unset
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: crate::defaults::KEY_PREFIX.to_string(),
            mode: StoreMode::Standalone,
            shards: 1,
            snapshot_path: None,
            snapshot_interval: crate::defaults::SNAPSHOT_INTERVAL,
        }
    }
}

/// Build the store described by `config`
pub fn open_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Arc<dyn Store> {
    match config.mode {
        StoreMode::Standalone => Arc::new(MemoryStore::new(clock)),
        StoreMode::Cluster => Arc::new(ClusterStore::new(config.shards, clock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn test_open_store_modes() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        for mode in [StoreMode::Standalone, StoreMode::Cluster] {
            let config = StoreConfig {
                mode,
                shards: 3,
                ..Default::default()
            };
            let store = open_store(&config, clock.clone());
            store
                .execute(vec![Command::ZIncrBy {
                    key: "a-{metric-x}-1-2".into(),
                    member: "10".into(),
                    delta: 1.5,
                }])
                .unwrap();
            assert_eq!(
                store.zrange_with_scores("a-{metric-x}-1-2").unwrap(),
                vec![("10".to_string(), 1.5)]
            );
        }
    }
}
