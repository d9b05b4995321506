//! Translation of samples into store commands

use crate::bucket::{
    bucket_start, canonical_metadata, metadata_fingerprint, pack_point, KeySpace, RawConfig,
};
use crate::store::Command;
use crate::tier::{Tier, TierSets};
use crate::{Metric, RawPoint, Result, TemporaError};
use bytes::BytesMut;
use std::sync::Arc;

/// Builds the command batch persisting one sample
#[derive(Debug, Clone)]
pub struct Persister {
    keys: KeySpace,
    tier_sets: Arc<TierSets>,
    raw: RawConfig,
}

impl Persister {
    pub fn new(keys: KeySpace, tier_sets: Arc<TierSets>, raw: RawConfig) -> Self {
        Self {
            keys,
            tier_sets,
            raw,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Append the writes for `metric` to `batch`
    ///
    /// Only the first tier of the matching tier set is written; coarser
    /// tiers are filled by rollup. Fails with a routing error, leaving
    /// `batch` untouched, when no tier set matches.
    pub fn persist(&self, metric: &Metric, batch: &mut Vec<Command>) -> Result<()> {
        let set = self.tier_sets.select(&metric.key).ok_or_else(|| {
            TemporaError::Routing(format!("no tier set matches metric '{}'", metric.key))
        })?;

        let unix = metric.unix_seconds();
        self.persist_in_tier(set.first_tier(), &metric.key, metric.value, unix, batch);
        if self.raw.enabled {
            self.persist_raw(metric, batch);
        }
        batch.push(Command::ZAdd {
            key: self.keys.metrics_key(),
            member: metric.key.clone(),
            score: unix as f64,
        });
        Ok(())
    }

    /// Increment the addressed slot, upsert the GC marker and refresh expiry
    pub fn persist_in_tier(
        &self,
        tier: &Tier,
        metric_key: &str,
        value: f64,
        unix_time: i64,
        batch: &mut Vec<Command>,
    ) {
        let addr = self.keys.bucket_for(metric_key, tier.granularity_secs(), unix_time);
        batch.push(Command::ZIncrBy {
            key: addr.key.clone(),
            member: addr.slot.to_string(),
            delta: value,
        });
        batch.push(Command::ZAdd {
            key: self.keys.gc_key(tier.granularity_secs()),
            member: addr.key.clone(),
            score: tier.collect_deadline(addr.bucket_start) as f64,
        });
        batch.push(Command::ExpireAt {
            key: addr.key,
            at: tier.expire_at(addr.bucket_start),
        });
    }

    /// Append the raw point and index its metadata variant
    pub fn persist_raw(&self, metric: &Metric, batch: &mut Vec<Command>) {
        let window = self.raw.window_secs();
        let start = bucket_start(&metric.key, window, metric.unix_seconds());
        let expire_at = start + window + self.raw.ttl.as_secs() as i64;
        let fingerprint = metadata_fingerprint(&metric.metadata);

        let mut point = BytesMut::new();
        pack_point(&mut point, &RawPoint::new(metric.timestamp, metric.value));

        let points_key = self.keys.raw_points_key(&metric.key, start, window, fingerprint);
        let index_key = self.keys.raw_index_key(&metric.key, start, window);

        batch.push(Command::Append {
            key: points_key.clone(),
            value: point.to_vec(),
        });
        batch.push(Command::ExpireAt {
            key: points_key,
            at: expire_at,
        });
        batch.push(Command::ZAdd {
            key: index_key.clone(),
            member: canonical_metadata(&metric.metadata),
            score: fingerprint as f64,
        });
        batch.push(Command::ExpireAt {
            key: index_key,
            at: expire_at,
        });
    }
}
