//! Declarative configuration
//!
//! The configuration file is TOML. Raw sections are deserialized as-is and
//! turned into a [`ValidatedConfig`] by [`Config::validate`]; anything that
//! does not validate is a [`TemporaError::Config`] and must stop startup.
//!
//! ```toml
//! [tier.fine]
//! granularity = "PT2S"
//!
//! [tier.coarse]
//! granularity = "1m"
//! ttl = "7d"
//!
//! [tier-set.default]
//! match = ".*"
//! tiers = ["fine", "coarse"]
//! order = 10
//!
//! [store]
//! mode = "standalone"
//! ```

use crate::bucket::RawConfig;
use crate::ingest::IngestConfig;
use crate::rollup::RollupConfig;
use crate::store::{StoreConfig, StoreMode};
use crate::tier::{parse_duration, Tier, TierSet, TierSets, MAX_TIER_SPAN};
use crate::{defaults, Result, TemporaError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Raw `[tier.<name>]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TierSpec {
    pub granularity: String,
    #[serde(default)]
    pub ttl: Option<String>,
}

/// Raw `[tier-set.<name>]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TierSetSpec {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(alias = "tier")]
    pub tiers: Vec<String>,
    #[serde(default)]
    pub order: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub prefix: Option<String>,
    pub mode: Option<String>,
    pub shards: Option<usize>,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub queue_capacity: Option<usize>,
    pub workers: Option<usize>,
    pub flush_interval: Option<String>,
    pub batch_size: Option<usize>,
    pub monitor_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RollupSection {
    pub enabled: Option<bool>,
    pub interval: Option<String>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSection {
    pub enabled: Option<bool>,
    pub window: Option<String>,
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LineSection {
    pub enabled: Option<bool>,
    pub bind: Option<String>,
    pub queue: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: Option<String>,
    pub format: Option<String>,
}

/// Configuration file as written by the operator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default, rename = "tier")]
    pub tiers: BTreeMap<String, TierSpec>,
    #[serde(default, rename = "tier-set")]
    pub tier_sets: BTreeMap<String, TierSetSpec>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub rollup: RollupSection,
    #[serde(default)]
    pub raw: RawSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub line: LineSection,
    #[serde(default)]
    pub log: LogSection,
}

/// HTTP listener settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

/// Plaintext line protocol listener settings
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    pub queue: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Fully validated, read-only configuration
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub tier_sets: Arc<TierSets>,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub rollup: RollupConfig,
    pub raw: RawConfig,
    pub http: HttpConfig,
    pub line: LineConfig,
    pub log: LogConfig,
}

impl Config {
    /// Read and parse a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TemporaError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| TemporaError::Config(e.to_string()))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let raw = self.validate_raw()?;
        let tier_sets = self.validate_tiers(&raw)?;

        Ok(ValidatedConfig {
            tier_sets: Arc::new(tier_sets),
            store: self.validate_store()?,
            ingest: self.validate_ingest()?,
            rollup: self.validate_rollup()?,
            raw,
            http: HttpConfig {
                bind: parse_addr(self.http.bind.as_deref().unwrap_or("0.0.0.0:8080"))?,
            },
            line: LineConfig {
                enabled: self.line.enabled.unwrap_or(true),
                bind: parse_addr(self.line.bind.as_deref().unwrap_or("0.0.0.0:2003"))?,
                queue: positive("line.queue", self.line.queue.unwrap_or(defaults::SOURCE_QUEUE))?,
            },
            log: self.validate_log()?,
        })
    }

    fn validate_tiers(&self, raw: &RawConfig) -> Result<TierSets> {
        let mut tiers = HashMap::with_capacity(self.tiers.len());
        for (name, spec) in &self.tiers {
            let tier = Tier::validate(name, spec).map_err(|e| {
                TemporaError::Config(format!("error parsing tier '{}': {}", name, e))
            })?;

            if tier.granularity_secs() == raw.window_secs() {
                return Err(TemporaError::Config(format!(
                    "granularity of tier '{}' equals the raw window",
                    name
                )));
            }

            tiers.insert(name.clone(), Arc::new(tier));
        }

        if self.tier_sets.is_empty() {
            return Err(TemporaError::Config("no tier sets have been defined".into()));
        }

        let mut sets = Vec::with_capacity(self.tier_sets.len());
        for (name, spec) in &self.tier_sets {
            let set = TierSet::validate(name, spec, &tiers).map_err(|e| {
                TemporaError::Config(format!("error parsing tier set '{}': {}", name, e))
            })?;
            sets.push(set);
        }

        Ok(TierSets::new(sets))
    }

    fn validate_store(&self) -> Result<StoreConfig> {
        let mode = match self.store.mode.as_deref().unwrap_or("standalone") {
            "standalone" => StoreMode::Standalone,
            "cluster" => StoreMode::Cluster,
            other => {
                return Err(TemporaError::Config(format!(
                    "unknown store mode '{}'",
                    other
                )))
            }
        };

        let prefix = self
            .store
            .prefix
            .clone()
            .unwrap_or_else(|| defaults::KEY_PREFIX.to_string());
        if prefix.is_empty() || prefix.contains(['{', '}']) {
            return Err(TemporaError::Config(format!("invalid key prefix '{}'", prefix)));
        }

        Ok(StoreConfig {
            prefix,
            mode,
            shards: positive("store.shards", self.store.shards.unwrap_or(1))?,
            snapshot_path: self.store.snapshot_path.clone(),
            snapshot_interval: duration_or(
                "store.snapshot_interval",
                &self.store.snapshot_interval,
                defaults::SNAPSHOT_INTERVAL,
            )?,
        })
    }

    fn validate_ingest(&self) -> Result<IngestConfig> {
        let i = &self.ingest;
        Ok(IngestConfig {
            queue_capacity: positive(
                "ingest.queue_capacity",
                i.queue_capacity.unwrap_or(defaults::QUEUE_CAPACITY),
            )?,
            workers: positive("ingest.workers", i.workers.unwrap_or(defaults::WORKERS))?,
            flush_interval: duration_or(
                "ingest.flush_interval",
                &i.flush_interval,
                defaults::FLUSH_INTERVAL,
            )?,
            batch_size: positive("ingest.batch_size", i.batch_size.unwrap_or(defaults::BATCH_SIZE))?,
            monitor_interval: duration_or(
                "ingest.monitor_interval",
                &i.monitor_interval,
                defaults::MONITOR_INTERVAL,
            )?,
        })
    }

    fn validate_rollup(&self) -> Result<RollupConfig> {
        Ok(RollupConfig {
            enabled: self.rollup.enabled.unwrap_or(true),
            interval: duration_or("rollup.interval", &self.rollup.interval, defaults::ROLLUP_INTERVAL)?,
            batch_size: positive(
                "rollup.batch_size",
                self.rollup.batch_size.unwrap_or(defaults::ROLLUP_BATCH_SIZE),
            )?,
        })
    }

    fn validate_raw(&self) -> Result<RawConfig> {
        let window = duration_or("raw.window", &self.raw.window, defaults::RAW_WINDOW)?;
        if window.subsec_nanos() != 0 {
            return Err(TemporaError::Config(
                "raw.window must be a whole number of seconds".into(),
            ));
        }

        let ttl = duration_or("raw.ttl", &self.raw.ttl, defaults::RAW_TTL)?;
        if !window.checked_add(ttl).is_some_and(|d| d <= MAX_TIER_SPAN) {
            return Err(TemporaError::Config(format!(
                "raw.window plus raw.ttl spans more than {} days",
                MAX_TIER_SPAN.as_secs() / 86_400
            )));
        }

        Ok(RawConfig {
            enabled: self.raw.enabled.unwrap_or(true),
            window,
            ttl,
        })
    }

    fn validate_log(&self) -> Result<LogConfig> {
        let format = match self.log.format.as_deref().unwrap_or("pretty") {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(TemporaError::Config(format!("unknown log format '{}'", other)))
            }
        };

        Ok(LogConfig {
            level: self.log.level.clone().unwrap_or_else(|| "info".to_string()),
            format,
        })
    }
}

fn duration_or(field: &str, raw: &Option<String>, default: Duration) -> Result<Duration> {
    match raw {
        Some(raw) => parse_duration(raw)
            .map_err(|e| TemporaError::Config(format!("invalid {}: {}", field, e))),
        None => Ok(default),
    }
}

fn positive(field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(TemporaError::Config(format!("{} must be positive", field)));
    }
    Ok(value)
}

fn parse_addr(raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| TemporaError::Config(format!("invalid listen address '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [tier.fine]
        granularity = "PT2S"

        [tier.medium]
        granularity = "1m"

        [tier.coarse]
        granularity = "1h"
        ttl = "30d"

        [tier-set.servers]
        match = "^servers\\."
        tiers = ["fine", "medium", "coarse"]
        order = 1

        [tier-set.default]
        match = ".*"
        tiers = ["medium", "coarse"]
        order = 10

        [store]
        prefix = "tsdb"
        mode = "cluster"
        shards = 4

        [ingest]
        workers = 8
        queue_capacity = 1000

        [log]
        format = "json"
    "#;

    #[test]
    fn test_parse_and_validate() {
        let config = Config::from_toml_str(SAMPLE).unwrap().validate().unwrap();

        assert_eq!(config.tier_sets.len(), 2);
        assert_eq!(config.tier_sets.select("servers.web01.load").unwrap().name(), "servers");
        assert_eq!(config.tier_sets.select("apps.queue").unwrap().name(), "default");
        assert_eq!(config.tier_sets.granularities(), vec![2, 60, 3600]);

        assert_eq!(config.store.prefix, "tsdb");
        assert_eq!(config.store.mode, StoreMode::Cluster);
        assert_eq!(config.store.shards, 4);
        assert_eq!(config.ingest.workers, 8);
        assert_eq!(config.ingest.queue_capacity, 1000);
        assert_eq!(config.ingest.batch_size, defaults::BATCH_SIZE);
        assert!(config.rollup.enabled);
        assert_eq!(config.raw.window_secs(), 14_400);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.http.bind.port(), 8080);
    }

    #[test]
    fn test_unknown_store_mode() {
        let raw = format!("{}\n[store]\nmode = \"sentinel\"\n", minimal());
        let err = Config::from_toml_str(&raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown store mode"));
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let raw = r#"
            [tier.fine]
            granularity = "two seconds"
            [tier-set.all]
            match = ".*"
            tiers = ["fine"]
        "#;
        let err = Config::from_toml_str(raw).unwrap().validate().unwrap_err();
        assert!(matches!(err, TemporaError::Config(_)));
    }

    #[test]
    fn test_oversized_raw_window_rejected() {
        for section in [
            "[raw]\nwindow = \"18446744073709551615s\"\n",
            "[raw]\nttl = \"P400000D\"\n",
        ] {
            let raw = format!("{}\n{}", minimal(), section);
            let err = Config::from_toml_str(&raw).unwrap().validate().unwrap_err();
            assert!(matches!(err, TemporaError::Config(_)), "{section}");
        }
    }

    #[test]
    fn test_non_monotonic_tier_set() {
        let raw = r#"
            [tier.fine]
            granularity = "2s"
            [tier.coarse]
            granularity = "1m"
            [tier-set.all]
            match = ".*"
            tiers = ["coarse", "fine"]
        "#;
        let err = Config::from_toml_str(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("tier set 'all'"));
    }

    #[test]
    fn test_requires_tier_sets() {
        let raw = "[tier.fine]\ngranularity = \"2s\"\n";
        assert!(Config::from_toml_str(raw).unwrap().validate().is_err());
    }

    #[test]
    fn test_raw_window_collision() {
        let raw = r#"
            [tier.fourhours]
            granularity = "4h"
            [tier-set.all]
            match = ".*"
            tiers = ["fourhours"]
        "#;
        let err = Config::from_toml_str(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("raw window"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let raw = format!("{}\n[ingest]\nworkers = 0\n", minimal());
        assert!(Config::from_toml_str(&raw).unwrap().validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Config::from_toml_str("[tier.fine"),
            Err(TemporaError::Config(_))
        ));
    }

    fn minimal() -> &'static str {
        r#"
            [tier.fine]
            granularity = "2s"
            [tier-set.all]
            match = ".*"
            tiers = ["fine"]
        "#
    }
}
