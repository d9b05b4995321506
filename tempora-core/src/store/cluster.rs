//! Sharded keyspace routed by hash tag

use super::{Clock, Command, MemoryStore, SnapshotEntry, Store};
use crate::{Result, TemporaError};
use std::sync::Arc;

/// Keyspace split across independent shards
///
/// A key is routed by the CRC32 of its `{...}` hash tag, or of the whole key
/// when it carries none, so every key of one metric lands on one shard.
pub struct ClusterStore {
    shards: Vec<MemoryStore>,
}

impl ClusterStore {
    pub fn new(shards: usize, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| MemoryStore::new(clock.clone()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`
    pub fn shard_for(&self, key: &str) -> usize {
        crc32fast::hash(hash_tag(key).as_bytes()) as usize % self.shards.len()
    }

    fn shard(&self, key: &str) -> &MemoryStore {
        &self.shards[self.shard_for(key)]
    }
}

/// The routed part of a key: the first non-empty `{...}` section
fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

impl Store for ClusterStore {
    fn execute(&self, batch: Vec<Command>) -> Result<()> {
        let mut per_shard: Vec<Vec<Command>> = vec![Vec::new(); self.shards.len()];
        for command in batch {
            per_shard[self.shard_for(command.key())].push(command);
        }

        let mut first_error: Option<TemporaError> = None;
        for (shard, commands) in self.shards.iter().zip(per_shard) {
            if commands.is_empty() {
                continue;
            }
            if let Err(e) = shard.execute(commands) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.shard(key).zrange_with_scores(key)
    }

    fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<(String, f64)>> {
        self.shard(key).zrange_by_score(key, max, limit)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shard(key).get(key)
    }

    fn export(&self) -> Vec<SnapshotEntry> {
        self.shards.iter().flat_map(|s| s.export()).collect()
    }

    fn import(&self, entries: Vec<SnapshotEntry>) {
        let mut per_shard: Vec<Vec<SnapshotEntry>> = vec![Vec::new(); self.shards.len()];
        for entry in entries {
            per_shard[self.shard_for(&entry.key)].push(entry);
        }
        for (shard, entries) in self.shards.iter().zip(per_shard) {
            shard.import(entries);
        }
    }

    fn purge_expired(&self) -> usize {
        self.shards.iter().map(|s| s.purge_expired()).sum()
    }
}
