//! Tier sets and tier set selection

use super::Tier;
use crate::config::TierSetSpec;
use crate::{Result, TemporaError};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// An ordered chain of tiers applied to metrics matching a pattern
#[derive(Debug, Clone)]
pub struct TierSet {
    name: String,
    pattern: Regex,
    tiers: Vec<Arc<Tier>>,
    order: i64,
}

impl TierSet {
    /// Resolve tier references and check the chain coarsens monotonically
    pub fn validate(
        name: &str,
        spec: &TierSetSpec,
        known: &HashMap<String, Arc<Tier>>,
    ) -> Result<Self> {
        let pattern = Regex::new(&spec.pattern).map_err(|e| {
            TemporaError::Config(format!("could not parse regex '{}': {}", spec.pattern, e))
        })?;

        if spec.tiers.is_empty() {
            return Err(TemporaError::Config("no tiers have been defined".into()));
        }

        let mut tiers = Vec::with_capacity(spec.tiers.len());
        let mut previous: Option<&Arc<Tier>> = None;
        for tier_name in &spec.tiers {
            let tier = known.get(tier_name).ok_or_else(|| {
                TemporaError::Config(format!("unknown tier referenced: {}", tier_name))
            })?;

            if let Some(prev) = previous {
                if tier.granularity() <= prev.granularity() {
                    return Err(TemporaError::Config(format!(
                        "granularity of tier '{}' is lower than or equal to that of '{}'",
                        tier_name,
                        prev.name()
                    )));
                }
            }

            tiers.push(tier.clone());
            previous = Some(tier);
        }

        Ok(Self {
            name: name.to_string(),
            pattern,
            tiers,
            order: spec.order,
        })
    }

    /// Tier set name as declared in configuration
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared order; lower is consulted first
    pub fn order(&self) -> i64 {
        self.order
    }

    /// Match pattern
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Check whether a metric key belongs to this set
    pub fn matches(&self, metric_key: &str) -> bool {
        self.pattern.is_match(metric_key)
    }

    /// Tiers from finest to coarsest
    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }

    /// The tier new samples are written to
    pub fn first_tier(&self) -> &Arc<Tier> {
        // validate() guarantees a non-empty chain
        &self.tiers[0]
    }

    /// The tier following the one with the given granularity
    pub fn next_after(&self, granularity_secs: i64) -> Option<&Arc<Tier>> {
        let idx = self
            .tiers
            .iter()
            .position(|t| t.granularity_secs() == granularity_secs)?;
        self.tiers.get(idx + 1)
    }
}

/// All configured tier sets in declared order
#[derive(Debug, Clone, Default)]
pub struct TierSets {
    sets: Vec<TierSet>,
}

impl TierSets {
    /// Order tier sets by declared order, ties broken by name
    pub fn new(mut sets: Vec<TierSet>) -> Self {
        sets.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        Self { sets }
    }

    /// The first tier set whose pattern matches the metric key
    pub fn select(&self, metric_key: &str) -> Option<&TierSet> {
        self.sets.iter().find(|set| set.matches(metric_key))
    }

    /// The tier a bucket at `granularity_secs` rolls up into, if any
    pub fn next_tier(&self, metric_key: &str, granularity_secs: i64) -> Option<&Arc<Tier>> {
        self.select(metric_key)?.next_after(granularity_secs)
    }

    /// Distinct granularities across all sets, ascending
    pub fn granularities(&self) -> Vec<i64> {
        self.sets
            .iter()
            .flat_map(|set| set.tiers.iter().map(|t| t.granularity_secs()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Iterate tier sets in order
    pub fn iter(&self) -> impl Iterator<Item = &TierSet> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn known() -> HashMap<String, Arc<Tier>> {
        let mut tiers = HashMap::new();
        for (name, secs) in [("2s", 2), ("1m", 60), ("1h", 3600)] {
            let g = Duration::from_secs(secs);
            tiers.insert(name.to_string(), Arc::new(Tier::from_parts(name, g, g * 1000)));
        }
        tiers
    }

    fn spec(pattern: &str, tiers: &[&str], order: i64) -> TierSetSpec {
        TierSetSpec {
            pattern: pattern.to_string(),
            tiers: tiers.iter().map(|s| s.to_string()).collect(),
            order,
        }
    }

    #[test]
    fn test_validate_chain() {
        let set = TierSet::validate("all", &spec(".*", &["2s", "1m", "1h"], 0), &known()).unwrap();
        assert_eq!(set.tiers().len(), 3);
        assert_eq!(set.first_tier().granularity_secs(), 2);
        assert_eq!(set.next_after(2).unwrap().granularity_secs(), 60);
        assert_eq!(set.next_after(60).unwrap().granularity_secs(), 3600);
        assert!(set.next_after(3600).is_none());
        assert!(set.next_after(5).is_none());
    }

    #[test]
    fn test_non_monotonic_chain_rejected() {
        let known = known();
        let err = TierSet::validate("bad", &spec(".*", &["1m", "2s"], 0), &known).unwrap_err();
        assert!(matches!(err, TemporaError::Config(_)));

        let err = TierSet::validate("dup", &spec(".*", &["1m", "1m"], 0), &known).unwrap_err();
        assert!(matches!(err, TemporaError::Config(_)));
    }

    #[test]
    fn test_unknown_and_empty_rejected() {
        let known = known();
        assert!(TierSet::validate("x", &spec(".*", &["5m"], 0), &known).is_err());
        assert!(TierSet::validate("x", &spec(".*", &[], 0), &known).is_err());
        assert!(TierSet::validate("x", &spec("(", &["2s"], 0), &known).is_err());
    }

    #[test]
    fn test_first_match_is_authoritative() {
        let known = known();
        let sets = TierSets::new(vec![
            TierSet::validate("fallback", &spec(".*", &["1m", "1h"], 10), &known).unwrap(),
            TierSet::validate("servers", &spec("^servers\\.", &["2s", "1m"], 1), &known).unwrap(),
        ]);

        assert_eq!(sets.select("servers.web01.cpu").unwrap().name(), "servers");
        assert_eq!(sets.select("apps.queue.depth").unwrap().name(), "fallback");

        // "servers" ends at 1m even though "fallback" continues past it
        assert!(sets.next_tier("servers.web01.cpu", 60).is_none());
        assert_eq!(
            sets.next_tier("apps.queue.depth", 60).unwrap().granularity_secs(),
            3600
        );
        assert_eq!(sets.granularities(), vec![2, 60, 3600]);
    }

    #[test]
    fn test_unroutable() {
        let known = known();
        let sets = TierSets::new(vec![
            TierSet::validate("servers", &spec("^servers\\.", &["2s"], 0), &known).unwrap(),
        ]);
        assert!(sets.select("apps.x").is_none());
        assert!(sets.next_tier("apps.x", 2).is_none());
    }
}
