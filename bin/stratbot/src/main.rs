use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use broker::{Ledger, PgLedger};
use common::Config;
use marketdata::{
    BinanceVenue, CandleSource, KlineManager, KlineManagerConfig, KlineStore, PgKlineStore,
    ProjectSymbolSource, SeriesCache,
};
use runner::{Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(exchange = %cfg.exchange_id, "Stratbot starting");

    // ── Database ─────────────────────────────────────────────────────────────
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to database: {e}"));
    sqlx::migrate!("../../migrations")
        .run(&db)
        .await
        .unwrap_or_else(|e| panic!("Database migration failed: {e}"));
    info!("Database ready");

    // ── Shared components ────────────────────────────────────────────────────
    let cache = SeriesCache::new(cfg.indicator_max_candles);
    let store: Arc<dyn KlineStore> = Arc::new(PgKlineStore::new(db.clone()));
    let venue: Arc<dyn CandleSource> = Arc::new(BinanceVenue::new(cfg.exchange_id.clone()));
    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(db.clone()));

    // ── Kline ingestion ──────────────────────────────────────────────────────
    let symbols = Arc::new(ProjectSymbolSource::new(
        db.clone(),
        cfg.active_project_statuses.clone(),
    ));
    let (manager, manager_handle) = KlineManager::new(
        cfg.exchange_id.clone(),
        store.clone(),
        venue,
        symbols,
        cache.clone(),
        KlineManagerConfig {
            poll_every: Duration::from_millis(cfg.kline_refresh_every_ms),
            history_days: cfg.kline_retention_days,
            max_concurrency: cfg.kline_max_concurrency,
            intervals: cfg.kline_sync_intervals.clone(),
        },
    );

    // ── Strategy scheduler ───────────────────────────────────────────────────
    let scheduler = Scheduler::new(
        db.clone(),
        store,
        ledger,
        cache,
        SchedulerConfig {
            tick: Duration::from_millis(cfg.scheduler_tick_ms),
            claim_batch: cfg.claim_batch,
            vm_timeout: Duration::from_millis(cfg.vm_timeout_ms),
            exchange: cfg.exchange_id.clone(),
            max_candles: cfg.indicator_max_candles,
        },
    );

    // ── Spawn all tasks ──────────────────────────────────────────────────────
    tokio::spawn(manager.run());
    tokio::spawn(scheduler.run());

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.unwrap();
    manager_handle.stop();
    info!("Shutdown signal received. Exiting.");
}
