//! Rollup of aged buckets into coarser tiers
//!
//! Every write into a bucket upserts a GC marker scored by the bucket's
//! collection deadline. One scheduler thread per distinct granularity picks
//! up markers whose deadline has passed, re-buckets the slots at the next
//! tier's granularity (summing slots that collide), writes the targets and
//! removes the processed markers in a single batch.
//!
//! Rollup is at-least-once. Running more than one scheduler against the
//! same store can process a marker twice and double-count into the next
//! tier, so only one instance per store should have rollup enabled.

use crate::bucket::KeySpace;
use crate::store::{Clock, Command, Store};
use crate::tier::TierSets;
use crate::{Result, TemporaError};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Rollup settings
#[derive(Debug, Clone)]
pub struct RollupConfig {
    /// Whether this instance runs the scheduler
    pub enabled: bool,
    /// Tick of each granularity loop
    pub interval: Duration,
    /// Maximum markers processed per granularity per tick
    pub batch_size: usize,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: crate::defaults::ROLLUP_INTERVAL,
            batch_size: crate::defaults::ROLLUP_BATCH_SIZE,
        }
    }
}

/// Scheduler counters
#[derive(Debug, Default)]
pub struct RollupStats {
    ticks: AtomicU64,
    buckets_rolled: AtomicU64,
    buckets_terminal: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`RollupStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupStatsSnapshot {
    pub ticks: u64,
    pub buckets_rolled: u64,
    pub buckets_terminal: u64,
    pub errors: u64,
}

impl RollupStats {
    pub fn snapshot(&self) -> RollupStatsSnapshot {
        RollupStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            buckets_rolled: self.buckets_rolled.load(Ordering::Relaxed),
            buckets_terminal: self.buckets_terminal.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub granularity: i64,
    /// Due markers read this tick
    pub markers: usize,
    /// Buckets migrated into the next tier
    pub rolled: usize,
    /// Markers removed without migration
    pub terminal: usize,
    /// Buckets left for a later tick
    pub failed: usize,
}

/// What processing one marker amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum BucketRollup {
    /// Writes into the next tier
    Migrate(Vec<Command>),
    /// Last tier of its set, or the metric is no longer routable
    Terminal,
    /// The marker does not name a bucket of this keyspace
    Unparsable,
}

/// Migrates due buckets for any granularity
pub struct Rollup {
    store: Arc<dyn Store>,
    keys: KeySpace,
    tier_sets: Arc<TierSets>,
    batch_size: usize,
    stats: Arc<RollupStats>,
}

impl Rollup {
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        tier_sets: Arc<TierSets>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            keys,
            tier_sets,
            batch_size,
            stats: Arc::new(RollupStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RollupStats> {
        self.stats.clone()
    }

    /// Process up to `batch_size` markers of `granularity` due at `now`
    pub fn rollup_granularity(&self, granularity: i64, now: i64) -> Result<RollupReport> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let gc_key = self.keys.gc_key(granularity);
        let markers = self
            .store
            .zrange_by_score(&gc_key, now as f64, self.batch_size)
            .map_err(|e| self.failed(e))?;

        let mut report = RollupReport {
            granularity,
            markers: markers.len(),
            ..Default::default()
        };
        let mut batch = Vec::new();

        for (bucket_key, _) in markers {
            match self.rollup_bucket(&bucket_key) {
                Ok(BucketRollup::Migrate(commands)) => {
                    batch.extend(commands);
                    report.rolled += 1;
                }
                Ok(BucketRollup::Terminal | BucketRollup::Unparsable) => report.terminal += 1,
                Err(e) => {
                    // marker stays and is retried next tick
                    warn!(bucket = %bucket_key, retryable = e.is_retryable(), error = %e, "Could not read bucket for rollup");
                    report.failed += 1;
                    continue;
                }
            }
            batch.push(Command::ZRem {
                key: gc_key.clone(),
                member: bucket_key,
            });
        }

        if !batch.is_empty() {
            self.store.execute(batch).map_err(|e| self.failed(e))?;
        }

        self.stats
            .buckets_rolled
            .fetch_add(report.rolled as u64, Ordering::Relaxed);
        self.stats
            .buckets_terminal
            .fetch_add(report.terminal as u64, Ordering::Relaxed);
        if report.failed > 0 {
            self.stats
                .errors
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }

        Ok(report)
    }

    /// Commands migrating one bucket into the next tier of its metric
    pub fn rollup_bucket(&self, bucket_key: &str) -> Result<BucketRollup> {
        let parsed = match self.keys.parse_bucket_key(bucket_key) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(bucket = %bucket_key, error = %e, "Dropping unparsable GC marker");
                return Ok(BucketRollup::Unparsable);
            }
        };

        let Some(next) = self.tier_sets.next_tier(&parsed.metric, parsed.granularity) else {
            debug!(bucket = %bucket_key, "Terminal tier reached");
            return Ok(BucketRollup::Terminal);
        };
        let granularity = next.granularity_secs();

        let slots = self.store.zrange_with_scores(bucket_key)?;

        // target bucket -> (bucket start, slot -> summed value)
        let mut targets: BTreeMap<String, (i64, BTreeMap<i64, f64>)> = BTreeMap::new();
        for (member, value) in slots {
            let Ok(time) = member.parse::<i64>() else {
                warn!(bucket = %bucket_key, slot = %member, "Skipping non-numeric slot");
                continue;
            };
            let addr = self.keys.bucket_for(&parsed.metric, granularity, time);
            let (_, target) = targets
                .entry(addr.key)
                .or_insert_with(|| (addr.bucket_start, BTreeMap::new()));
            *target.entry(addr.slot).or_insert(0.0) += value;
        }

        let gc_key = self.keys.gc_key(granularity);
        let mut commands = Vec::new();
        for (key, (start, slots)) in targets {
            for (slot, value) in slots {
                commands.push(Command::ZIncrBy {
                    key: key.clone(),
                    member: slot.to_string(),
                    delta: value,
                });
            }
            commands.push(Command::ZAdd {
                key: gc_key.clone(),
                member: key.clone(),
                score: next.collect_deadline(start) as f64,
            });
            commands.push(Command::ExpireAt {
                key,
                at: next.expire_at(start),
            });
        }

        Ok(BucketRollup::Migrate(commands))
    }

    fn failed(&self, e: TemporaError) -> TemporaError {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        e
    }
}

/// One rollup loop per distinct granularity
pub struct RollupScheduler {
    stats: Arc<RollupStats>,
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl RollupScheduler {
    /// Spawn the loops; with rollup disabled no thread is started
    pub fn start(
        store: Arc<dyn Store>,
        keys: KeySpace,
        tier_sets: Arc<TierSets>,
        clock: Arc<dyn Clock>,
        config: &RollupConfig,
    ) -> Result<Self> {
        let granularities = tier_sets.granularities();
        let rollup = Arc::new(Rollup::new(store, keys, tier_sets, config.batch_size));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut scheduler = Self {
            stats: rollup.stats(),
            shutdown: Some(shutdown_tx),
            handles: Vec::new(),
        };

        if !config.enabled {
            info!("Rollup disabled on this instance");
            return Ok(scheduler);
        }

        for granularity in &granularities {
            let rollup = rollup.clone();
            let clock = clock.clone();
            let shutdown = shutdown_rx.clone();
            let granularity = *granularity;
            let interval = config.interval;
            scheduler.handles.push(
                thread::Builder::new()
                    .name(format!("rollup-{}s", granularity))
                    .spawn(move || run_loop(&rollup, granularity, clock.as_ref(), interval, shutdown))?,
            );
        }

        info!(granularities = ?granularities, "Rollup scheduler started");
        Ok(scheduler)
    }

    pub fn stats(&self) -> Arc<RollupStats> {
        self.stats.clone()
    }

    /// Stop every loop after its current tick
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Rollup thread panicked");
            }
        }
        info!("Rollup scheduler stopped");
    }
}

impl Drop for RollupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    rollup: &Rollup,
    granularity: i64,
    clock: &dyn Clock,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let started = Instant::now();
                match rollup.rollup_granularity(granularity, clock.now()) {
                    Ok(report) if report.markers > 0 => info!(
                        granularity,
                        rolled = report.rolled,
                        terminal = report.terminal,
                        failed = report.failed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Rolled up buckets"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(granularity, error = %e, "Rollup tick failed"),
                }
            },
            recv(shutdown) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::RawConfig;
    use crate::ingest::Persister;
    use crate::store::{ManualClock, MemoryStore, SnapshotEntry};
    use crate::tier::testing::tier_sets;
    use crate::Metric;

    const T0: i64 = 1485004710;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        keys: KeySpace,
        tier_sets: Arc<TierSets>,
    }

    impl Fixture {
        fn new(tiers: &[&str]) -> Self {
            let clock = Arc::new(ManualClock::new(T0));
            Self {
                store: Arc::new(MemoryStore::new(clock.clone())),
                clock,
                keys: KeySpace::new("t"),
                tier_sets: tier_sets(".*", tiers),
            }
        }

        fn persist(&self, metrics: &[Metric]) {
            let raw = RawConfig {
                enabled: false,
                ..Default::default()
            };
            let persister = Persister::new(self.keys.clone(), self.tier_sets.clone(), raw);
            let mut batch = Vec::new();
            for m in metrics {
                persister.persist(m, &mut batch).unwrap();
            }
            self.store.execute(batch).unwrap();
        }

        fn rollup(&self) -> Rollup {
            Rollup::new(self.store.clone(), self.keys.clone(), self.tier_sets.clone(), 4096)
        }

        fn tier_total(&self, granularity: i64) -> f64 {
            self.store
                .export()
                .iter()
                .filter(|e| {
                    self.keys
                        .parse_bucket_key(&e.key)
                        .is_ok_and(|b| b.granularity == granularity)
                })
                .map(|e| {
                    self.store
                        .zrange_with_scores(&e.key)
                        .unwrap()
                        .iter()
                        .map(|(_, v)| v)
                        .sum::<f64>()
                })
                .sum()
        }
    }

    fn samples() -> Vec<Metric> {
        (0..300)
            .map(|i| Metric::from_unix("servers.web01.cpu", (i % 7) as f64 + 0.25, T0 + i))
            .collect()
    }

    #[test]
    fn test_rollup_conserves_mass() {
        let f = Fixture::new(&["2s", "1m"]);
        f.persist(&samples());
        let source_total = f.tier_total(2);
        assert!(source_total > 0.0);

        // nothing is due before the deadlines pass
        let report = f.rollup().rollup_granularity(2, T0).unwrap();
        assert_eq!(report.markers, 0);

        let report = f.rollup().rollup_granularity(2, T0 + 10_000).unwrap();
        assert!(report.rolled > 0);
        assert_eq!(report.rolled, report.markers);
        assert!((f.tier_total(60) - source_total).abs() < 1e-6);

        // processed markers are gone, targets got their own markers
        assert!(f.store.zrange_with_scores("t-1-gc-2").unwrap().is_empty());
        let targets = f.store.zrange_with_scores("t-1-gc-60").unwrap();
        assert!(!targets.is_empty());
        for (key, deadline) in targets {
            let parsed = f.keys.parse_bucket_key(&key).unwrap();
            assert_eq!(parsed.granularity, 60);
            assert_eq!(deadline as i64, parsed.bucket_start + 128 * 60 + 30);
        }
    }

    #[test]
    fn test_rollup_sums_colliding_slots() {
        let f = Fixture::new(&["2s", "1m"]);
        let bucket = f.keys.bucket_for("foo", 2, T0).key;
        f.store
            .execute(vec![
                Command::ZIncrBy {
                    key: bucket.clone(),
                    member: "1485004800".into(),
                    delta: 1.0,
                },
                Command::ZIncrBy {
                    key: bucket.clone(),
                    member: "1485004801".into(),
                    delta: 2.0,
                },
            ])
            .unwrap();

        let BucketRollup::Migrate(commands) = f.rollup().rollup_bucket(&bucket).unwrap() else {
            panic!("expected a migration");
        };
        let increments: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                Command::ZIncrBy { member, delta, .. } => Some((member.clone(), *delta)),
                _ => None,
            })
            .collect();

        let a = f.keys.bucket_for("foo", 60, 1485004800);
        let b = f.keys.bucket_for("foo", 60, 1485004801);
        if a.key == b.key && a.slot == b.slot {
            assert_eq!(increments, vec![(a.slot.to_string(), 3.0)]);
        } else {
            assert_eq!(increments.len(), 2);
        }
        assert_eq!(commands.len(), increments.len() + 2 * if a.key == b.key { 1 } else { 2 });
    }

    #[test]
    fn test_terminal_tier_marker_removed_without_writes() {
        let f = Fixture::new(&["2s", "1m"]);
        let bucket = f.keys.bucket_for("foo", 60, T0);
        f.store
            .execute(vec![
                Command::ZIncrBy {
                    key: bucket.key.clone(),
                    member: bucket.slot.to_string(),
                    delta: 5.0,
                },
                Command::ZAdd {
                    key: "t-1-gc-60".into(),
                    member: bucket.key.clone(),
                    score: T0 as f64,
                },
            ])
            .unwrap();
        let before = f.store.export().len();

        let report = f.rollup().rollup_granularity(60, T0).unwrap();
        assert_eq!(report.terminal, 1);
        assert_eq!(report.rolled, 0);
        assert!(f.store.zrange_with_scores("t-1-gc-60").unwrap().is_empty());
        assert_eq!(f.store.export().len(), before - 1);
    }

    #[test]
    fn test_unparsable_marker_removed() {
        let f = Fixture::new(&["2s", "1m"]);
        f.store
            .execute(vec![Command::ZAdd {
                key: "t-1-gc-2".into(),
                member: "garbage".into(),
                score: 0.0,
            }])
            .unwrap();

        let report = f.rollup().rollup_granularity(2, T0).unwrap();
        assert_eq!(report.markers, 1);
        assert_eq!(report.terminal, 1);
        assert!(f.store.zrange_with_scores("t-1-gc-2").unwrap().is_empty());
    }

    #[test]
    fn test_batch_size_bounds_a_tick() {
        let f = Fixture::new(&["2s", "1m"]);
        let metrics: Vec<_> = (0..20)
            .map(|i| Metric::from_unix(format!("m{}", i), 1.0, T0))
            .collect();
        f.persist(&metrics);

        let rollup = Rollup::new(f.store.clone(), f.keys.clone(), f.tier_sets.clone(), 8);
        let report = rollup.rollup_granularity(2, T0 + 10_000).unwrap();
        assert_eq!(report.markers, 8);
        assert_eq!(f.store.zrange_with_scores("t-1-gc-2").unwrap().len(), 12);
        assert_eq!(rollup.stats().snapshot().buckets_rolled, 8);
    }

    /// Fails every sorted-set read of tier buckets
    struct FailingReads(MemoryStore);

    impl Store for FailingReads {
        fn execute(&self, batch: Vec<Command>) -> Result<()> {
            self.0.execute(batch)
        }
        fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
            if key.contains("{metric-") {
                return Err(TemporaError::Store("connection reset".into()));
            }
            self.0.zrange_with_scores(key)
        }
        fn zrange_by_score(&self, key: &str, max: f64, limit: usize) -> Result<Vec<(String, f64)>> {
            self.0.zrange_by_score(key, max, limit)
        }
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key)
        }
        fn export(&self) -> Vec<SnapshotEntry> {
            self.0.export()
        }
        fn import(&self, entries: Vec<SnapshotEntry>) {
            self.0.import(entries)
        }
        fn purge_expired(&self) -> usize {
            self.0.purge_expired()
        }
    }

    #[test]
    fn test_failed_read_keeps_marker() {
        let f = Fixture::new(&["2s", "1m"]);
        f.persist(&[Metric::from_unix("foo", 1.0, T0)]);
        let store = Arc::new(FailingReads(MemoryStore::new(f.clock.clone())));
        store.import(f.store.export());

        let rollup = Rollup::new(store.clone(), f.keys.clone(), f.tier_sets.clone(), 4096);
        let report = rollup.rollup_granularity(2, T0 + 10_000).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.zrange_by_score("t-1-gc-2", f64::MAX, 10).unwrap().len(), 1);
        assert_eq!(rollup.stats().snapshot().errors, 1);
    }

    #[test]
    fn test_scheduler_rolls_due_buckets() {
        let f = Fixture::new(&["2s", "1m", "1h"]);
        f.persist(&samples());
        let source_total = f.tier_total(2);
        f.clock.advance(10_000);

        let config = RollupConfig {
            enabled: true,
            interval: Duration::from_millis(5),
            batch_size: 4096,
        };
        let scheduler = RollupScheduler::start(
            f.store.clone(),
            f.keys.clone(),
            f.tier_sets.clone(),
            f.clock.clone(),
            &config,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while f.store.zrange_with_scores("t-1-gc-2").unwrap().len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = scheduler.stats();
        scheduler.shutdown();

        assert!(f.store.zrange_with_scores("t-1-gc-2").unwrap().is_empty());
        assert!(stats.snapshot().ticks > 0);
        assert!((f.tier_total(60) - source_total).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_scheduler_spawns_nothing() {
        let f = Fixture::new(&["2s", "1m"]);
        let config = RollupConfig {
            enabled: false,
            ..Default::default()
        };
        let scheduler = RollupScheduler::start(
            f.store.clone(),
            f.keys.clone(),
            f.tier_sets.clone(),
            f.clock.clone(),
            &config,
        )
        .unwrap();
        assert!(scheduler.handles.is_empty());
        scheduler.shutdown();
    }
}
