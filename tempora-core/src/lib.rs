//! Tempora Core - Tiered Time-Series Storage Engine
//!
//! A Rust-based metrics store that:
//! - Accepts (key, value, timestamp) samples from many ingestion sources
//! - Persists them into time-bucketed accumulators at multiple retention tiers
//! - Periodically downsamples expired buckets into coarser tiers
//! - Answers range queries with metadata filtering and grouping
//!
//! # Architecture
//!
//! - **Tiers**: retention granularities chained into tier sets, selected by metric name
//! - **Bucket addressing**: hash-skewed mapping from (key, granularity, time) to a bucket
//! - **Store**: pipelined key/value backend with sorted-set accumulators and expiry
//! - **Ingest**: fan-in of named sources into a bounded queue, worker pool, load shedding
//! - **Rollup**: one periodic loop per granularity migrating buckets to the next tier
//! - **Query**: bucket enumeration, metadata filtering and a group-by tree

pub mod bucket;
pub mod config;
pub mod ingest;
pub mod query;
pub mod rollup;
pub mod store;
pub mod tier;

mod error;
mod types;

pub use error::{Result, TemporaError};
pub use types::*;

/// Tempora version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the persisted key layout
pub const SCHEMA_VERSION: u32 = 1;

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Key prefix for everything written to the store
    pub const KEY_PREFIX: &str = "tempora";

    /// Capacity of the aggregated ingestion queue
    pub const QUEUE_CAPACITY: usize = 1_048_560;

    /// Number of persistence workers
    pub const WORKERS: usize = 48;

    /// Maximum delay before a worker flushes its pending batch
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

    /// Commands per worker batch before an early flush
    pub const BATCH_SIZE: usize = 1024;

    /// Queue monitor tick
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

    /// Rollup scheduler tick
    pub const ROLLUP_INTERVAL: Duration = Duration::from_secs(1);

    /// Maximum GC markers processed per granularity per tick
    pub const ROLLUP_BATCH_SIZE: usize = 4096;

    /// Width of a raw point bucket (4 hours)
    pub const RAW_WINDOW: Duration = Duration::from_secs(14_400);

    /// Lifetime of raw point buckets (25 hours)
    pub const RAW_TTL: Duration = Duration::from_secs(25 * 3600);

    /// Capacity of each protocol source channel
    pub const SOURCE_QUEUE: usize = 1024;

    /// Widest time range a single query may cover
    pub const MAX_QUERY_SPAN: Duration = Duration::from_secs(366 * 86_400);

    /// Snapshot cadence when snapshots are enabled
    pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
}
