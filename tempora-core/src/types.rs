//! Core types for Tempora

use crate::{Result, TemporaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Nanoseconds per second
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Metadata attached to a sample; sorted so iteration is canonical
pub type Metadata = BTreeMap<String, String>;

/// A single metric sample as produced by a protocol adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric key (e.g. "servers.web01.cpu")
    pub key: String,
    /// Sample value
    pub value: f64,
    /// Sample time in nanoseconds
    pub timestamp: Timestamp,
    /// Tags / metadata
    pub metadata: Metadata,
}

impl Metric {
    /// Create a new sample without metadata
    pub fn new(key: impl Into<String>, value: f64, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            metadata: Metadata::new(),
        }
    }

    /// Create a sample from a unix timestamp in seconds
    pub fn from_unix(key: impl Into<String>, value: f64, unix_seconds: i64) -> Self {
        Self::new(key, value, unix_seconds * NANOS_PER_SEC)
    }

    /// Like `from_unix`, rejecting times outside the nanosecond range
    pub fn try_from_unix(key: impl Into<String>, value: f64, unix_seconds: i64) -> Result<Self> {
        let timestamp = unix_seconds
            .checked_mul(NANOS_PER_SEC)
            .ok_or_else(|| TemporaError::Decode(format!("timestamp {} out of range", unix_seconds)))?;
        Ok(Self::new(key, value, timestamp))
    }

    /// Add a metadata entry
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sample time truncated to whole seconds
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp.div_euclid(NANOS_PER_SEC)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.value, self.unix_seconds())
    }
}

/// One accumulator read back out of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Value
    pub value: f64,
}

impl RawPoint {
    /// Create a new raw point
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// The points of one metadata variant within a metric
#[derive(Debug, Clone, PartialEq)]
pub struct DatapointGroup {
    /// Points in storage order
    pub points: Vec<RawPoint>,
    /// Metadata shared by every point of the group
    pub metadata: Metadata,
    /// Fingerprint of the canonicalized metadata
    pub metadata_hash: u32,
}

impl DatapointGroup {
    /// Create an empty group for a metadata variant
    pub fn new(metadata: Metadata, metadata_hash: u32) -> Self {
        Self {
            points: Vec::new(),
            metadata,
            metadata_hash,
        }
    }
}

/// A query result point with the metadata of its group attached
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Value
    pub value: f64,
    /// Metadata of the group the point belongs to
    pub metadata: Metadata,
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Duration in nanoseconds, saturating at the i64 bounds
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
    Stddev,
}

impl AggregateFunction {
    /// Parse from string
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "mean" | "avg" | "average" => Some(AggregateFunction::Mean),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            "first" => Some(AggregateFunction::First),
            "last" => Some(AggregateFunction::Last),
            "stddev" => Some(AggregateFunction::Stddev),
            _ => None,
        }
    }

    /// Lowercase name used in result columns
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Mean => "mean",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Stddev => "stddev",
        }
    }
}
