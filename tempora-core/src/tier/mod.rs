//! Retention tiers
//!
//! A [`Tier`] is one retention granularity: how wide a slot is, how long a
//! bucket lives, and when a bucket becomes eligible for rollup. Tiers are
//! chained into [`TierSet`]s, which are selected per metric by name pattern.

mod duration;
mod set;

pub use duration::parse_duration;
pub use set::{TierSet, TierSets};

use crate::config::TierSpec;
use crate::{Result, TemporaError};
use std::time::Duration;

/// Number of slots held by one bucket
pub const SLOTS_PER_BUCKET: i64 = 128;

/// Safety margin added to a bucket's window before it is collected
pub const COLLECT_MARGIN: Duration = Duration::from_secs(30);

/// Upper bound on window plus collection margin plus ttl, keeping unix-second
/// arithmetic on bucket starts far from overflow
pub const MAX_TIER_SPAN: Duration = Duration::from_secs(1000 * 365 * 86_400);

/// A validated retention tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    name: String,
    granularity: Duration,
    ttl: Duration,
    collect_offset: Duration,
}

impl Tier {
    /// Parse and validate a tier definition
    pub fn validate(name: &str, spec: &TierSpec) -> Result<Self> {
        let granularity = parse_duration(&spec.granularity).map_err(|e| {
            TemporaError::Config(format!(
                "invalid granularity '{}': {}",
                spec.granularity, e
            ))
        })?;

        if granularity.subsec_nanos() != 0 {
            return Err(TemporaError::Config(format!(
                "granularity '{}' must be a whole number of seconds",
                spec.granularity
            )));
        }

        let window = granularity
            .checked_mul(SLOTS_PER_BUCKET as u32)
            .ok_or_else(|| too_wide(&spec.granularity))?;

        let ttl = match &spec.ttl {
            Some(raw) => parse_duration(raw)
                .map_err(|e| TemporaError::Config(format!("invalid ttl '{}': {}", raw, e)))?,
            None => Self::default_ttl(granularity),
        };

        let span = window
            .checked_add(COLLECT_MARGIN)
            .and_then(|d| d.checked_add(ttl));
        if !span.is_some_and(|d| d <= MAX_TIER_SPAN) {
            return Err(too_wide(&spec.granularity));
        }

        Ok(Self::from_parts(name, granularity, ttl))
    }

    /// Build a tier from already-parsed values
    pub fn from_parts(name: impl Into<String>, granularity: Duration, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            granularity,
            ttl,
            collect_offset: Self::window_for(granularity).saturating_add(COLLECT_MARGIN),
        }
    }

    /// Tier name as declared in configuration
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of one slot
    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Width of one slot in whole seconds
    pub fn granularity_secs(&self) -> i64 {
        self.granularity.as_secs() as i64
    }

    /// How long a bucket outlives its collection deadline
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Delay between a bucket's start and its collection deadline
    pub fn collect_offset(&self) -> Duration {
        self.collect_offset
    }

    /// Time covered by one bucket
    pub fn window(&self) -> Duration {
        Self::window_for(self.granularity)
    }

    /// Unix time after which a bucket starting at `bucket_start` is rolled up
    pub fn collect_deadline(&self, bucket_start: i64) -> i64 {
        bucket_start + self.collect_offset.as_secs() as i64
    }

    /// Absolute expiry of a bucket starting at `bucket_start`
    pub fn expire_at(&self, bucket_start: i64) -> i64 {
        self.collect_deadline(bucket_start) + self.ttl.as_secs() as i64
    }

    fn window_for(granularity: Duration) -> Duration {
        granularity
            .checked_mul(SLOTS_PER_BUCKET as u32)
            .unwrap_or(Duration::MAX)
    }

    fn default_ttl(granularity: Duration) -> Duration {
        Self::window_for(granularity).saturating_add(COLLECT_MARGIN * 10)
    }
}

fn too_wide(granularity: &str) -> TemporaError {
    TemporaError::Config(format!(
        "tier '{}' spans more than {} days",
        granularity,
        MAX_TIER_SPAN.as_secs() / 86_400
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{TierSetSpec, TierSpec};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// A single tier set matching `pattern`, one tier per granularity string
    pub(crate) fn tier_sets(pattern: &str, granularities: &[&str]) -> Arc<TierSets> {
        let mut known = HashMap::new();
        for g in granularities {
            let spec = TierSpec {
                granularity: g.to_string(),
                ttl: None,
            };
            known.insert(g.to_string(), Arc::new(Tier::validate(g, &spec).unwrap()));
        }
        let spec = TierSetSpec {
            pattern: pattern.to_string(),
            tiers: granularities.iter().map(|g| g.to_string()).collect(),
            order: 0,
        };
        Arc::new(TierSets::new(vec![
            TierSet::validate("default", &spec, &known).unwrap()
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(granularity: &str, ttl: Option<&str>) -> TierSpec {
        TierSpec {
            granularity: granularity.to_string(),
            ttl: ttl.map(str::to_string),
        }
    }

    #[test]
    fn test_collect_offset() {
        let tier = Tier::validate("fine", &spec("PT2S", None)).unwrap();
        assert_eq!(tier.granularity_secs(), 2);
        assert_eq!(tier.window(), Duration::from_secs(256));
        assert_eq!(tier.collect_offset(), Duration::from_secs(286));
    }

    #[test]
    fn test_deadlines() {
        let tier = Tier::validate("fine", &spec("2s", None)).unwrap();
        assert_eq!(tier.collect_deadline(1485004709), 1485004995);
        assert_eq!(tier.expire_at(1485004709), 1485005551);
    }

    #[test]
    fn test_default_ttl_outlives_window() {
        let tier = Tier::validate("fine", &spec("3s", None)).unwrap();
        assert_eq!(tier.ttl(), Duration::from_secs(384 + 300));
        assert!(tier.ttl() > tier.window());
    }

    #[test]
    fn test_explicit_ttl() {
        let tier = Tier::validate("coarse", &spec("1m", Some("P7D"))).unwrap();
        assert_eq!(tier.ttl(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_invalid_tiers() {
        assert!(matches!(
            Tier::validate("t", &spec("soon", None)),
            Err(TemporaError::Config(_))
        ));
        assert!(Tier::validate("t", &spec("0s", None)).is_err());
        assert!(Tier::validate("t", &spec("1500ms", None)).is_err());
        assert!(Tier::validate("t", &spec("1s", Some("forever"))).is_err());
    }

    #[test]
    fn test_oversized_tiers_rejected() {
        for (granularity, ttl) in [
            ("150000000000000000s", None),
            ("18446744073709551615s", None),
            ("1d", Some("P400000D")),
        ] {
            assert!(
                matches!(Tier::validate("t", &spec(granularity, ttl)), Err(TemporaError::Config(_))),
                "{granularity} accepted"
            );
        }
        assert!(Tier::validate("t", &spec("P365D", None)).is_ok());
    }
}
