//! In-process keyspace

use super::{Clock, Command, SnapshotEntry, Store};
use crate::{Result, TemporaError};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Score wrapper giving f64 a total order
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Members with scores, iterable by ascending (score, member)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(String, f64)>", into = "Vec<(String, f64)>")]
pub struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    /// Add `delta` to a member's score and return the new score
    pub fn incr(&mut self, member: String, delta: f64) -> f64 {
        let score = match self.scores.get(&member) {
            Some(&old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                old + delta
            }
            None => delta,
        };
        self.ordered.insert((Score(score), member.clone()));
        self.scores.insert(member, score);
        score
    }

    /// Set a member's score
    pub fn add(&mut self, member: String, score: f64) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(Score(old), member.clone()));
        }
        self.ordered.insert((Score(score), member));
    }

    /// Remove a member; returns whether it was present
    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members by ascending score
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.ordered.iter().map(|(s, m)| (m.as_str(), s.0))
    }
}

impl From<Vec<(String, f64)>> for SortedSet {
    fn from(members: Vec<(String, f64)>) -> Self {
        let mut set = SortedSet::default();
        for (member, score) in members {
            set.add(member, score);
        }
        set
    }
}

impl From<SortedSet> for Vec<(String, f64)> {
    fn from(set: SortedSet) -> Self {
        set.ordered.into_iter().map(|(s, m)| (m, s.0)).collect()
    }
}

/// Value held under one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    SortedSet(SortedSet),
    Blob(Vec<u8>),
}

impl StoredValue {
    fn is_empty(&self) -> bool {
        match self {
            StoredValue::SortedSet(set) => set.is_empty(),
            StoredValue::Blob(bytes) => bytes.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: StoredValue,
    expire_at: Option<i64>,
}

impl Slot {
    fn new(value: StoredValue) -> Self {
        Self {
            value,
            expire_at: None,
        }
    }

    /// Expired keys and emptied collections behave as missing
    fn is_dead(&self, now: i64) -> bool {
        self.expire_at.map_or(false, |at| at <= now) || self.value.is_empty()
    }
}

/// Single-keyspace in-memory store
pub struct MemoryStore {
    keys: SkipMap<String, Mutex<Slot>>,
    /// Held shared by writers, exclusively by purges that unlink keys
    purge_lock: RwLock<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: SkipMap::new(),
            purge_lock: RwLock::new(()),
            clock,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.keys
            .iter()
            .filter(|entry| !entry.value().lock().is_dead(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, command: Command, now: i64) -> Result<()> {
        match command {
            Command::ZIncrBy { key, member, delta } => self.with_set(key, now, |set| {
                set.incr(member, delta);
            }),
            Command::ZAdd { key, member, score } => self.with_set(key, now, |set| {
                set.add(member, score);
            }),
            Command::ZRem { key, member } => {
                if let Some(entry) = self.keys.get(key.as_str()) {
                    let mut slot = entry.value().lock();
                    if slot.is_dead(now) {
                        return Ok(());
                    }
                    match &mut slot.value {
                        StoredValue::SortedSet(set) => {
                            set.remove(&member);
                        }
                        StoredValue::Blob(_) => return Err(wrong_type(&key)),
                    }
                }
                Ok(())
            }
            Command::Append { key, value } => self.with_value(key, now, blob, |v| match v {
                StoredValue::Blob(bytes) => {
                    bytes.extend_from_slice(&value);
                    true
                }
                StoredValue::SortedSet(_) => false,
            }),
            Command::ExpireAt { key, at } => {
                if let Some(entry) = self.keys.get(key.as_str()) {
                    let mut slot = entry.value().lock();
                    if !slot.is_dead(now) {
                        slot.expire_at = Some(at);
                    }
                }
                Ok(())
            }
        }
    }

    fn with_set(&self, key: String, now: i64, f: impl FnOnce(&mut SortedSet)) -> Result<()> {
        self.with_value(key, now, sorted_set, |v| match v {
            StoredValue::SortedSet(set) => {
                f(set);
                true
            }
            StoredValue::Blob(_) => false,
        })
    }

    /// Run `f` on the live value under `key`, creating it with `init` if
    /// missing or dead; `f` returns false on a type mismatch
    fn with_value(
        &self,
        key: String,
        now: i64,
        init: fn() -> StoredValue,
        f: impl FnOnce(&mut StoredValue) -> bool,
    ) -> Result<()> {
        let entry = self.keys.get_or_insert_with(key, || Mutex::new(Slot::new(init())));
        let mut slot = entry.value().lock();
        if slot.is_dead(now) {
            *slot = Slot::new(init());
        }
        if f(&mut slot.value) {
            Ok(())
        } else {
            Err(wrong_type(entry.key()))
        }
    }

    fn read_set<T>(&self, key: &str, f: impl FnOnce(&SortedSet) -> T) -> Result<Option<T>> {
        let now = self.clock.now();
        let Some(entry) = self.keys.get(key) else {
            return Ok(None);
        };
        let slot = entry.value().lock();
        if slot.is_dead(now) {
            return Ok(None);
        }
        match &slot.value {
            StoredValue::SortedSet(set) => Ok(Some(f(set))),
            StoredValue::Blob(_) => Err(wrong_type(key)),
        }
    }
}

fn sorted_set() -> StoredValue {
    StoredValue::SortedSet(SortedSet::default())
}

fn blob() -> StoredValue {
    StoredValue::Blob(Vec::new())
}

fn wrong_type(key: &str) -> TemporaError {
    TemporaError::Store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

impl Store for MemoryStore {
    fn execute(&self, batch: Vec<Command>) -> Result<()> {
        let _guard = self.purge_lock.read();
        let now = self.clock.now();
        let mut first_error = None;
        for command in batch {
            if let Err(e) = self.apply(command, now) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        Ok(self
            .read_set(key, |set| {
                set.iter().map(|(m, s)| (m.to_string(), s)).collect()
            })?
            .unwrap_or_default())
    }

    fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<(String, f64)>> {
        Ok(self
            .read_set(key, |set| {
                set.iter()
                    .take_while(|(_, s)| *s <= max)
                    .take(limit)
                    .map(|(m, s)| (m.to_string(), s))
                    .collect()
            })?
            .unwrap_or_default())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let Some(entry) = self.keys.get(key) else {
            return Ok(None);
        };
        let slot = entry.value().lock();
        if slot.is_dead(now) {
            return Ok(None);
        }
        match &slot.value {
            StoredValue::Blob(bytes) => Ok(Some(bytes.clone())),
            StoredValue::SortedSet(_) => Err(wrong_type(key)),
        }
    }

    fn export(&self) -> Vec<SnapshotEntry> {
        let now = self.clock.now();
        self.keys
            .iter()
            .filter_map(|entry| {
                let slot = entry.value().lock();
                if slot.is_dead(now) {
                    return None;
                }
                Some(SnapshotEntry {
                    key: entry.key().clone(),
                    value: slot.value.clone(),
                    expire_at: slot.expire_at,
                })
            })
            .collect()
    }

    fn import(&self, entries: Vec<SnapshotEntry>) {
        let _guard = self.purge_lock.read();
        for entry in entries {
            let slot = Slot {
                value: entry.value,
                expire_at: entry.expire_at,
            };
            self.keys.insert(entry.key, Mutex::new(slot));
        }
    }

    fn purge_expired(&self) -> usize {
        let _guard = self.purge_lock.write();
        let now = self.clock.now();
        let dead: Vec<String> = self
            .keys
            .iter()
            .filter(|entry| entry.value().lock().is_dead(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &dead {
            self.keys.remove(key);
        }
        dead.len()
    }
}
