//! Ingestion pipeline
//!
//! Named metric sources are fanned into one bounded queue, drained by a
//! fixed pool of workers that batch store commands, while a monitor logs
//! queue depths and sheds the oldest backlog when the queue saturates.
//!
//! ```text
//!  source "line" ──┐
//!  source "http" ──┼──► aggregated queue ──► worker × N ──► Store
//!  source ...    ──┘          ▲
//!                             └── monitor (depths, load shedding)
//! ```

mod persist;

pub use persist::Persister;

use crate::store::{Command, Store};
use crate::{Metric, Result, TemporaError};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ingestion settings
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Capacity of the aggregated queue
    pub queue_capacity: usize,
    /// Number of persistence workers
    pub workers: usize,
    /// Maximum age of a worker's pending batch
    pub flush_interval: Duration,
    /// Commands per batch before an early flush
    pub batch_size: usize,
    /// Queue monitor tick
    pub monitor_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            workers: crate::defaults::WORKERS,
            flush_interval: crate::defaults::FLUSH_INTERVAL,
            batch_size: crate::defaults::BATCH_SIZE,
            monitor_interval: crate::defaults::MONITOR_INTERVAL,
        }
    }
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    persisted: AtomicU64,
    unroutable: AtomicU64,
    discarded: AtomicU64,
    store_errors: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub unroutable: u64,
    pub discarded: u64,
    pub store_errors: u64,
    pub flushes: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Depth view of the aggregated queue
#[derive(Debug, Clone)]
pub struct QueueGauge {
    queue: Receiver<Metric>,
}

impl QueueGauge {
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity().unwrap_or(0)
    }
}

/// Discard the oldest queued samples until at least 10% of capacity is free
///
/// Returns the number of samples discarded.
pub fn shed_load<T>(queue: &Receiver<T>) -> u64 {
    let Some(capacity) = queue.capacity() else {
        return 0;
    };

    let mut discarded = 0;
    while capacity.saturating_sub(queue.len()) * 10 < capacity {
        if queue.try_recv().is_err() {
            break;
        }
        discarded += 1;
    }
    discarded
}

/// Collects named sources before the pipeline starts
pub struct IngestBuilder {
    config: IngestConfig,
    store: Arc<dyn Store>,
    persister: Persister,
    sources: Vec<(String, Receiver<Metric>)>,
}

impl IngestBuilder {
    pub fn new(config: IngestConfig, store: Arc<dyn Store>, persister: Persister) -> Self {
        Self {
            config,
            store,
            persister,
            sources: Vec::new(),
        }
    }

    /// Register a named producer; names must be unique
    pub fn add_source(mut self, name: impl Into<String>, source: Receiver<Metric>) -> Result<Self> {
        let name = name.into();
        if self.sources.iter().any(|(existing, _)| *existing == name) {
            return Err(TemporaError::Config(format!(
                "a source with name '{}' already exists",
                name
            )));
        }
        self.sources.push((name, source));
        Ok(self)
    }

    /// Spawn forwarders, workers and the monitor
    pub fn start(self) -> Result<Ingest> {
        let (queue_tx, queue_rx) = bounded(self.config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let stats = Arc::new(IngestStats::default());
        let mut handles = Vec::new();

        if self.sources.is_empty() {
            warn!("Ingest pipeline started without sources");
        }

        for (name, source) in &self.sources {
            let forwarder = Forwarder {
                name: name.clone(),
                source: source.clone(),
                queue: queue_tx.clone(),
                shutdown: shutdown_rx.clone(),
                stats: stats.clone(),
            };
            handles.push(
                thread::Builder::new()
                    .name(format!("ingest-src-{}", name))
                    .spawn(move || forwarder.run())?,
            );
        }
        // forwarders own the only senders; workers stop once every source closes
        drop(queue_tx);

        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                queue: queue_rx.clone(),
                shutdown: shutdown_rx.clone(),
                store: self.store.clone(),
                persister: self.persister.clone(),
                stats: stats.clone(),
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval,
            };
            handles.push(
                thread::Builder::new()
                    .name(format!("ingest-worker-{}", id))
                    .spawn(move || worker.run())?,
            );
        }

        let monitor = Monitor {
            queue: queue_rx.clone(),
            sources: self.sources.clone(),
            interval: self.config.monitor_interval,
            shutdown: shutdown_rx,
            stats: stats.clone(),
        };
        handles.push(
            thread::Builder::new()
                .name("ingest-monitor".into())
                .spawn(move || monitor.run())?,
        );

        info!(
            sources = self.sources.len(),
            workers = self.config.workers,
            capacity = self.config.queue_capacity,
            "Ingest pipeline started"
        );

        Ok(Ingest {
            queue: queue_rx,
            stats,
            shutdown: Some(shutdown_tx),
            handles,
        })
    }
}

/// Handle to a running pipeline; dropping it shuts the pipeline down
pub struct Ingest {
    queue: Receiver<Metric>,
    stats: Arc<IngestStats>,
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl Ingest {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn gauge(&self) -> QueueGauge {
        QueueGauge {
            queue: self.queue.clone(),
        }
    }

    /// Signal every thread, let workers drain and flush, then join
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // closing the shutdown channel wakes every select
        if self.shutdown.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Ingest thread panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(
            persisted = stats.persisted,
            discarded = stats.discarded,
            left_queued = self.queue.len(),
            "Ingest pipeline stopped"
        );
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Forwarder {
    name: String,
    source: Receiver<Metric>,
    queue: Sender<Metric>,
    shutdown: Receiver<()>,
    stats: Arc<IngestStats>,
}

impl Forwarder {
    fn run(self) {
        loop {
            let metric = select! {
                recv(self.source) -> msg => match msg {
                    Ok(metric) => metric,
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            select! {
                send(self.queue, metric) -> res => if res.is_err() { break },
                recv(self.shutdown) -> _ => break,
            }
        }
        debug!(source = %self.name, "Source forwarder stopped");
    }
}

struct Worker {
    id: usize,
    queue: Receiver<Metric>,
    shutdown: Receiver<()>,
    store: Arc<dyn Store>,
    persister: Persister,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
}

/// Commands awaiting a flush and the samples they carry
#[derive(Default)]
struct Pending {
    commands: Vec<Command>,
    samples: u64,
}

impl Worker {
    fn run(self) {
        let mut pending = Pending::default();
        let mut last_flush = Instant::now();

        loop {
            let wait = self.flush_interval.saturating_sub(last_flush.elapsed());
            select! {
                recv(self.queue) -> msg => match msg {
                    Ok(metric) => self.accept(&metric, &mut pending),
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => {
                    self.drain(&mut pending);
                    break;
                },
                default(wait) => {}
            }

            if pending.commands.len() >= self.batch_size
                || last_flush.elapsed() >= self.flush_interval
            {
                self.flush(&mut pending);
                last_flush = Instant::now();
            }
        }

        self.flush(&mut pending);
        debug!(worker = self.id, "Ingest worker stopped");
    }

    fn accept(&self, metric: &Metric, pending: &mut Pending) {
        match self.persister.persist(metric, &mut pending.commands) {
            Ok(()) => pending.samples += 1,
            Err(e) => {
                self.stats.unroutable.fetch_add(1, Ordering::Relaxed);
                info!(metric = %metric.key, "Dropping sample: {}", e);
            }
        }
    }

    /// Best-effort: persist whatever is still queued
    fn drain(&self, pending: &mut Pending) {
        while let Ok(metric) = self.queue.try_recv() {
            self.accept(&metric, pending);
            if pending.commands.len() >= self.batch_size {
                self.flush(pending);
            }
        }
    }

    fn flush(&self, pending: &mut Pending) {
        if pending.commands.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);

        match self.store.execute(batch.commands) {
            Ok(()) => {
                self.stats.persisted.fetch_add(batch.samples, Ordering::Relaxed);
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker = self.id, samples = batch.samples, error = %e, "Dropping batch after store error");
            }
        }
    }
}

struct Monitor {
    queue: Receiver<Metric>,
    sources: Vec<(String, Receiver<Metric>)>,
    interval: Duration,
    shutdown: Receiver<()>,
    stats: Arc<IngestStats>,
}

impl Monitor {
    fn run(self) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => self.check(),
                recv(self.shutdown) -> _ => break,
            }
        }
    }

    fn check(&self) {
        debug!(queue = "aggregate", depth = self.queue.len(), "Queue depth");
        if self.queue.is_full() {
            let discarded = shed_load(&self.queue);
            self.stats.discarded.fetch_add(discarded, Ordering::Relaxed);
            warn!(discarded, "Aggregated queue saturated, discarded oldest samples");
        }
        for (name, source) in &self.sources {
            debug!(queue = %name, depth = source.len(), "Queue depth");
        }
    }
}
