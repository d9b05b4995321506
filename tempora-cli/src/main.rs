//! Tempora command-line tools

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tempora_core::bucket::KeySpace;
use tempora_core::config::{Config, TierSpec};
use tempora_core::tier::Tier;

#[derive(Debug, Parser)]
#[command(name = "tempora-cli", version, about = "Offline tools for Tempora")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a configuration file and print the resolved tiers
    Check {
        /// Configuration file
        config: PathBuf,
    },
    /// Print the bucket address of a sample
    Bucket {
        /// Metric key
        metric: String,
        /// Tier granularity (e.g. 2s, PT1M)
        granularity: String,
        /// Sample time in unix seconds
        unix: i64,
        /// Key prefix
        #[arg(long, default_value = tempora_core::defaults::KEY_PREFIX)]
        prefix: String,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Check { config } => check(&config),
        Command::Bucket {
            metric,
            granularity,
            unix,
            prefix,
        } => bucket(&metric, &granularity, unix, &prefix),
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(path)
        .and_then(|c| c.validate())
        .with_context(|| format!("{} is invalid", path.display()))?;

    println!("{} is valid", path.display());
    println!();
    for set in config.tier_sets.iter() {
        println!("tier set '{}' (order {}, match {})", set.name(), set.order(), set.pattern());
        for tier in set.tiers() {
            println!(
                "  {:<12} granularity {:>6}s  window {:>8}s  collect after {:>8}s  ttl {:>8}s",
                tier.name(),
                tier.granularity_secs(),
                tier.window().as_secs(),
                tier.collect_offset().as_secs(),
                tier.ttl().as_secs()
            );
        }
    }
    println!();
    println!("rollup granularities: {:?}", config.tier_sets.granularities());
    println!(
        "rollup: {} every {:?}, raw points: {} ({}s window)",
        if config.rollup.enabled { "enabled" } else { "disabled" },
        config.rollup.interval,
        if config.raw.enabled { "enabled" } else { "disabled" },
        config.raw.window_secs()
    );
    Ok(())
}

fn bucket(metric: &str, granularity: &str, unix: i64, prefix: &str) -> anyhow::Result<()> {
    let spec = TierSpec {
        granularity: granularity.to_string(),
        ttl: None,
    };
    let tier = Tier::validate(granularity, &spec)?;

    let keys = KeySpace::new(prefix);
    let addr = keys.bucket_for(metric, tier.granularity_secs(), unix);

    println!("key            {}", addr.key);
    println!("bucket start   {}", addr.bucket_start);
    println!("slot offset    {}", addr.slot_offset);
    println!("slot           {}", addr.slot);
    println!("gc key         {}", keys.gc_key(tier.granularity_secs()));
    println!("collect after  {}", tier.collect_deadline(addr.bucket_start));
    println!("expires at     {}", tier.expire_at(addr.bucket_start));
    Ok(())
}
