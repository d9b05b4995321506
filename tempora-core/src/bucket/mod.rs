//! Bucket addressing
//!
//! Maps `(metric key, granularity, unix time)` to the bucket holding that
//! sample. Every bucket spans `SLOTS_PER_BUCKET * granularity` seconds;
//! bucket boundaries are skewed per metric key by the upper 16 bits of the
//! key's MurmurHash3 so that buckets of different metrics do not all roll
//! over (and get collected) at the same wall-clock instant.

mod codec;

pub use codec::{canonical_metadata, metadata_fingerprint, pack_point, unpack_points, POINT_SIZE};

use crate::tier::SLOTS_PER_BUCKET;
use crate::{Result, TemporaError, SCHEMA_VERSION};
use regex::Regex;
use std::io::Cursor;
use std::time::Duration;

/// 32-bit MurmurHash3 (x86, seed 0) of a metric key
pub fn key_hash(metric_key: &str) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(metric_key.as_bytes()), 0)
        .expect("reading from an in-memory cursor cannot fail")
}

/// Per-key offset applied to bucket boundaries
pub fn key_skew(metric_key: &str) -> i64 {
    (key_hash(metric_key) >> 16) as i64
}

/// Start of the skewed window of width `window_secs` containing `unix_time`
pub fn bucket_start(metric_key: &str, window_secs: i64, unix_time: i64) -> i64 {
    unix_time - (unix_time - key_skew(metric_key)).rem_euclid(window_secs)
}

/// Location of one sample inside the tiered keyspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketAddress {
    /// Store key of the bucket
    pub key: String,
    /// Skewed start of the bucket window (unix seconds)
    pub bucket_start: i64,
    /// Offset of the sample inside the unskewed window, rounded down to its slot
    pub slot_offset: i64,
    /// Member the slot accumulator is stored under
    pub slot: i64,
}

/// A parsed tier bucket key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKey {
    pub metric: String,
    pub bucket_start: i64,
    pub granularity: i64,
}

/// Raw point storage settings
#[derive(Debug, Clone)]
pub struct RawConfig {
    /// Whether samples are also kept as raw points for querying
    pub enabled: bool,
    /// Width of a raw bucket
    pub window: Duration,
    /// Lifetime of a raw bucket
    pub ttl: Duration,
}

impl RawConfig {
    pub fn window_secs(&self) -> i64 {
        self.window.as_secs() as i64
    }
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: crate::defaults::RAW_WINDOW,
            ttl: crate::defaults::RAW_TTL,
        }
    }
}

/// Key layout of everything written to the store
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    bucket_key_re: Regex,
}

impl KeySpace {
    /// Create a keyspace under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let pattern = format!(
            r"^{}-(\d+)-\{{metric-(.+)\}}-(-?\d+)-(\d+)$",
            regex::escape(&prefix)
        );
        let bucket_key_re = Regex::new(&pattern).expect("escaped prefix yields a valid pattern");
        Self {
            prefix,
            bucket_key_re,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Address of a sample at `granularity_secs`
    pub fn bucket_for(&self, metric_key: &str, granularity_secs: i64, unix_time: i64) -> BucketAddress {
        let window = SLOTS_PER_BUCKET * granularity_secs;
        let raw_offset = unix_time.rem_euclid(window);
        let slot_offset = raw_offset - raw_offset.rem_euclid(granularity_secs);
        let start = bucket_start(metric_key, window, unix_time);

        BucketAddress {
            key: self.bucket_key(metric_key, start, granularity_secs),
            bucket_start: start,
            slot_offset,
            slot: unix_time + slot_offset,
        }
    }

    /// `<prefix>-<schema>-{metric-<key>}-<start>-<granularity>`
    pub fn bucket_key(&self, metric_key: &str, bucket_start: i64, granularity_secs: i64) -> String {
        format!(
            "{}-{}-{{metric-{}}}-{}-{}",
            self.prefix, SCHEMA_VERSION, metric_key, bucket_start, granularity_secs
        )
    }

    /// Sorted set of metadata variants stored in one raw bucket
    pub fn raw_index_key(&self, metric_key: &str, bucket_start: i64, window_secs: i64) -> String {
        self.bucket_key(metric_key, bucket_start, window_secs)
    }

    /// Packed points of one metadata variant in one raw bucket
    pub fn raw_points_key(
        &self,
        metric_key: &str,
        bucket_start: i64,
        window_secs: i64,
        metadata_hash: u32,
    ) -> String {
        format!(
            "{}-{}",
            self.bucket_key(metric_key, bucket_start, window_secs),
            metadata_hash
        )
    }

    /// Sorted set of bucket keys scored by collection deadline
    pub fn gc_key(&self, granularity_secs: i64) -> String {
        format!("{}-{}-gc-{}", self.prefix, SCHEMA_VERSION, granularity_secs)
    }

    /// Sorted set of known metric keys scored by last write
    pub fn metrics_key(&self) -> String {
        format!("{}-{}-metrics", self.prefix, SCHEMA_VERSION)
    }

    /// Recover metric, start and granularity from a tier bucket key
    pub fn parse_bucket_key(&self, key: &str) -> Result<BucketKey> {
        let caps = self
            .bucket_key_re
            .captures(key)
            .ok_or_else(|| TemporaError::Corruption(format!("not a bucket key: {}", key)))?;

        let schema: u32 = caps[1]
            .parse()
            .map_err(|_| TemporaError::Corruption(format!("bad schema version in {}", key)))?;
        if schema != SCHEMA_VERSION {
            return Err(TemporaError::Corruption(format!(
                "unsupported schema version {} in {}",
                schema, key
            )));
        }

        let number = |idx: usize| -> Result<i64> {
            caps[idx]
                .parse()
                .map_err(|_| TemporaError::Corruption(format!("bad bucket key {}", key)))
        };

        Ok(BucketKey {
            metric: caps[2].to_string(),
            bucket_start: number(3)?,
            granularity: number(4)?,
        })
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::defaults::KEY_PREFIX)
    }
}
