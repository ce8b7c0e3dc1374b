//! Pricestream - simulated instrument prices, cached live and synced durably
//!
//! One generator task per instrument feeds the volatile cache, a single sync
//! task drains it into SQLite, and the reader API stitches both for the UI.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricestream_backend::{
    api::{self, ApiState, ReaderSessions},
    cache::{PriceCache, TimeSeriesCache},
    clock::{Clock, SystemClock},
    config::PipelineConfig,
    notify::PriceNotifier,
    simulator::{InstrumentWalk, PriceSimulator},
    store::{DurableStore, SqlitePriceStore},
    sync::DurableSync,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = PipelineConfig::from_env().context("Failed to load pipeline configuration")?;
    info!(
        instruments = ?config.instrument_ids(),
        retention_minutes = config.retention_minutes,
        tick_period_ms = config.tick_period_ms,
        sync_interval_secs = config.sync_interval_secs,
        "Pricestream starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(TimeSeriesCache::new(config.retention_ms(), clock.clone()));
    let db_path = resolve_data_path(&config.database_path);
    let store = Arc::new(
        SqlitePriceStore::open(&db_path)
            .with_context(|| format!("Failed to open price store at {}", db_path.display()))?,
    );
    let notifier = Arc::new(PriceNotifier::new(config.notify_capacity));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Generators
    let simulator = Arc::new(PriceSimulator::new(
        cache.clone(),
        notifier.clone(),
        clock.clone(),
        config.tick_period(),
    ));
    let walks = config
        .instrument_ids()
        .into_iter()
        .map(InstrumentWalk::random)
        .collect();
    let mut generators = simulator.spawn_all(walks, shutdown_rx.clone());

    // Durable sync
    let sync = DurableSync::new(
        cache.clone() as Arc<dyn PriceCache>,
        store.clone() as Arc<dyn DurableStore>,
        clock.clone(),
        config.sync_interval(),
    )
    .with_instruments(config.instrument_ids())
    .with_overlap(config.tick_period());
    let sync_task = tokio::spawn(sync.run(shutdown_rx.clone()));

    // Reader API
    let listen_addr = config.listen_addr.clone();
    let state = ApiState {
        sessions: Arc::new(ReaderSessions::new(config.session_idle())),
        config: Arc::new(config),
        cache: cache.clone(),
        store: store.clone(),
        clock,
        notifier,
    };
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::serve(state, &listen_addr, shutdown_rx).await {
            error!("Reader API stopped: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    while let Some(res) = generators.join_next().await {
        if let Err(e) = res {
            warn!("Generator task ended abnormally: {}", e);
        }
    }
    match sync_task.await {
        Ok(sync) => info!(cursor = ?sync.cursor(), "Sync task joined"),
        Err(e) => warn!("Sync task ended abnormally: {}", e),
    }
    if let Err(e) = api_task.await {
        warn!("API task ended abnormally: {}", e);
    }

    let generated = simulator.stats();
    let stats = cache.stats().snapshot();
    info!(
        ticks = generated.ticks.load(Ordering::Relaxed),
        tick_failures = generated.failures.load(Ordering::Relaxed),
        published = generated.published.load(Ordering::Relaxed),
        appended = stats.appended,
        evicted = stats.evicted,
        durable_rows = store.count().unwrap_or(0),
        "Pricestream stopped"
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pricestream_backend=info,pricestream=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also pick up a .env next to the manifest when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

/// Relative database paths resolve against the crate directory, not the cwd.
fn resolve_data_path(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw.trim());
    if p.is_absolute() {
        return p;
    }
    Path::new(env!("CARGO_MANIFEST_DIR")).join(p)
}
