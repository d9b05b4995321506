//! Tempora Server - metrics ingestion, rollup and query over HTTP and TCP

mod api;
mod protocol;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempora_core::bucket::KeySpace;
use tempora_core::config::{Config, LogConfig, LogFormat, ValidatedConfig};
use tempora_core::ingest::{IngestBuilder, Persister};
use tempora_core::query::Engine;
use tempora_core::rollup::RollupScheduler;
use tempora_core::store::{open_store, restore_snapshot, write_snapshot, Clock, Store, SystemClock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "tempora", version, about = "Tiered time-series metrics store")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "TEMPORA_CONFIG", default_value = "tempora.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Invalid configuration stops startup before anything listens
    let config = Config::from_file(&args.config)
        .and_then(|c| c.validate())
        .with_context(|| format!("loading {}", args.config.display()))?;

    init_logging(&config.log);
    info!("Starting Tempora {}...", tempora_core::VERSION);
    info!(
        tier_sets = config.tier_sets.len(),
        granularities = ?config.tier_sets.granularities(),
        "Configuration loaded"
    );

    run(config).await
}

fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn run(config: ValidatedConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config.store, clock.clone());
    if let Some(path) = &config.store.snapshot_path {
        let restored = restore_snapshot(path, store.as_ref())?;
        info!("Restored {} keys from {}", restored, path.display());
    }

    let keys = KeySpace::new(config.store.prefix.clone());
    let persister = Persister::new(keys.clone(), config.tier_sets.clone(), config.raw.clone());

    // Sources
    let (http_tx, http_rx) = crossbeam_channel::bounded(tempora_core::defaults::SOURCE_QUEUE);
    let mut builder = IngestBuilder::new(config.ingest.clone(), store.clone(), persister)
        .add_source("http", http_rx)?;
    let line_tx = if config.line.enabled {
        let (tx, rx) = crossbeam_channel::bounded(config.line.queue);
        builder = builder.add_source("line", rx)?;
        Some(tx)
    } else {
        None
    };
    let ingest = builder.start()?;

    let scheduler = RollupScheduler::start(
        store.clone(),
        keys.clone(),
        config.tier_sets.clone(),
        clock.clone(),
        &config.rollup,
    )?;

    let cancel = CancellationToken::new();
    let maintenance = tokio::spawn(maintain(
        store.clone(),
        clock.clone(),
        config.clone(),
        cancel.clone(),
    ));

    let line_server = match line_tx {
        Some(tx) => {
            let listener = TcpListener::bind(config.line.bind)
                .await
                .with_context(|| format!("binding line protocol on {}", config.line.bind))?;
            Some(tokio::spawn(protocol::graphite::serve(listener, tx, cancel.clone())))
        }
        None => None,
    };

    let state = Arc::new(api::ServerState {
        engine: Engine::new(store.clone(), keys, config.raw.clone()),
        writes: http_tx,
        ingest_stats: ingest.stats(),
        queue: Some(ingest.gauge()),
        rollup_stats: scheduler.stats(),
    });
    let app = api::create_router(state);

    let listener = TcpListener::bind(config.http.bind)
        .await
        .with_context(|| format!("binding HTTP on {}", config.http.bind))?;
    info!("Tempora server listening on {}", config.http.bind);

    tokio::spawn(shutdown_signal(cancel.clone()));
    let http_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_cancel.cancelled().await })
        .await?;

    // Listeners are down; drain the pipeline, stop rollup, persist
    cancel.cancel();
    if let Some(line_server) = line_server {
        if let Err(e) = line_server.await {
            warn!(error = %e, "Line protocol listener failed");
        }
    }
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task failed");
    }

    tokio::task::spawn_blocking(move || {
        ingest.shutdown();
        scheduler.shutdown();
    })
    .await?;

    if let Some(path) = &config.store.snapshot_path {
        match write_snapshot(path, store.as_ref(), clock.now()) {
            Ok(count) => info!("Final snapshot of {} keys written", count),
            Err(e) => error!(error = %e, "Final snapshot failed"),
        }
    }

    info!("Tempora stopped");
    Ok(())
}

/// Purge expired keys and write periodic snapshots until cancelled
async fn maintain(
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: ValidatedConfig,
    cancel: CancellationToken,
) {
    let period = config.store.snapshot_interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let store = store.clone();
        let clock = clock.clone();
        let path = config.store.snapshot_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let purged = store.purge_expired();
            let written = match &path {
                Some(path) => Some(write_snapshot(path, store.as_ref(), clock.now())),
                None => None,
            };
            (purged, written)
        })
        .await;

        match result {
            Ok((purged, written)) => {
                if purged > 0 {
                    info!("Purged {} expired keys", purged);
                }
                if let Some(Err(e)) = written {
                    warn!(error = %e, "Snapshot failed");
                }
            }
            Err(e) => warn!(error = %e, "Maintenance tick panicked"),
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
