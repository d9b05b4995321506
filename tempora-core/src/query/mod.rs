//! Query engine over raw point buckets
//!
//! A query names one metric (the shard key), a time range and an exact-match
//! metadata filter. The engine walks the raw buckets covering the range,
//! keeps the metadata variants passing the filter, unpacks their points and
//! merges them per metadata fingerprint. Results can be flattened into a
//! time-ordered [`ResultSet`] or fed to a [`GroupTree`].

mod aggregates;
mod group;

pub use aggregates::{accumulator, aggregate, Accumulator};
pub use group::{render_time, FieldGrouper, GroupTree, GroupedRow, GroupedTable, Grouper, TimeGrouper};

use crate::bucket::{bucket_start, unpack_points, KeySpace, RawConfig};
use crate::store::Store;
use crate::{
    Datapoint, DatapointGroup, Metadata, Result, TemporaError, TimeRange, Timestamp,
    NANOS_PER_SEC,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Points of every matching variant, ordered by timestamp
pub type ResultSet = Vec<Datapoint>;

/// Parameters of a range query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Metric key
    pub shard_key: String,
    /// Inclusive start in nanoseconds
    pub start: Timestamp,
    /// Inclusive end in nanoseconds
    pub end: Timestamp,
    /// Every entry must be present with the same value
    pub filter: Metadata,
}

impl QueryRequest {
    pub fn new(shard_key: impl Into<String>, start: Timestamp, end: Timestamp) -> Self {
        Self {
            shard_key: shard_key.into(),
            start,
            end,
            filter: Metadata::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_key.is_empty() {
            return Err(TemporaError::QueryInput("no shard key specified".into()));
        }
        if self.start > self.end {
            return Err(TemporaError::QueryInput(
                "start time must be smaller than or equal to end time".into(),
            ));
        }
        let max_span = crate::defaults::MAX_QUERY_SPAN.as_secs() as i64 * NANOS_PER_SEC;
        if self.range().duration() > max_span {
            return Err(TemporaError::QueryInput(format!(
                "time range exceeds {} days",
                crate::defaults::MAX_QUERY_SPAN.as_secs() / 86_400
            )));
        }
        Ok(())
    }

    /// Whether `metadata` satisfies every filter entry
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.filter
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|actual| actual == v))
    }
}

/// Reads raw buckets back out of the store
pub struct Engine {
    store: Arc<dyn Store>,
    keys: KeySpace,
    raw: RawConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, raw: RawConfig) -> Self {
        Self { store, keys, raw }
    }

    /// Flattened points of the matching variants, ordered by timestamp
    ///
    /// Ties keep fingerprint order.
    pub fn query(&self, request: &QueryRequest) -> Result<ResultSet> {
        let groups = self.query_groups(request)?;
        let mut out: ResultSet = Vec::with_capacity(groups.iter().map(|g| g.points.len()).sum());
        for group in groups {
            for point in group.points {
                out.push(Datapoint {
                    timestamp: point.timestamp,
                    value: point.value,
                    metadata: group.metadata.clone(),
                });
            }
        }
        out.sort_by_key(|p| p.timestamp);
        Ok(out)
    }

    /// Matching variants merged across buckets, ordered by fingerprint
    ///
    /// A bucket that cannot be read is logged and skipped, so a store
    /// failure yields a partial result rather than an error.
    pub fn query_groups(&self, request: &QueryRequest) -> Result<Vec<DatapointGroup>> {
        request.validate()?;
        let range = request.range();

        let mut merged: BTreeMap<u32, DatapointGroup> = BTreeMap::new();
        for start in self.buckets_in_window(&request.shard_key, request.start, request.end) {
            let groups = match self.query_bucket(request, start) {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(metric = %request.shard_key, bucket = start, error = %e, "Skipping unreadable bucket");
                    continue;
                }
            };
            for group in groups {
                let entry = merged
                    .entry(group.metadata_hash)
                    .or_insert_with(|| DatapointGroup::new(group.metadata.clone(), group.metadata_hash));
                entry
                    .points
                    .extend(group.points.into_iter().filter(|p| range.contains(p.timestamp)));
            }
        }

        Ok(merged.into_values().filter(|g| !g.points.is_empty()).collect())
    }

    /// Start times of the raw buckets covering `[start, end]`
    pub fn buckets_in_window(&self, metric_key: &str, start: Timestamp, end: Timestamp) -> Vec<i64> {
        let window = self.raw.window_secs();
        let end_secs = end.div_euclid(NANOS_PER_SEC);
        let mut bucket = bucket_start(metric_key, window, start.div_euclid(NANOS_PER_SEC));
        let mut out = Vec::new();
        while bucket <= end_secs {
            out.push(bucket);
            bucket += window;
        }
        out
    }

    fn query_bucket(&self, request: &QueryRequest, bucket: i64) -> Result<Vec<DatapointGroup>> {
        let window = self.raw.window_secs();
        let index_key = self.keys.raw_index_key(&request.shard_key, bucket, window);

        let mut out = Vec::new();
        for (member, score) in self.store.zrange_with_scores(&index_key)? {
            let metadata: Metadata = match serde_json::from_str(&member) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(key = %index_key, error = %e, "Skipping undecodable metadata entry");
                    continue;
                }
            };
            if !request.matches(&metadata) {
                continue;
            }

            let fingerprint = score as u32;
            let points_key = self
                .keys
                .raw_points_key(&request.shard_key, bucket, window, fingerprint);
            let Some(raw) = self.store.get(&points_key)? else {
                debug!(key = %points_key, "Indexed variant has no points");
                continue;
            };

            let mut group = DatapointGroup::new(metadata, fingerprint);
            group.points = unpack_points(&raw);
            out.push(group);
        }
        Ok(out)
    }

    /// Every metric key seen by ingestion, sorted
    pub fn metric_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .store
            .zrange_with_scores(&self.keys.metrics_key())?
            .into_iter()
            .map(|(member, _)| member)
            .collect();
        names.sort();
        Ok(names)
    }
}
