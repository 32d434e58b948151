use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};

use common::{Candle, Interval, Result};

use crate::binance::{CandleSource, FetchReq, MAX_KLINES_LIMIT};
use crate::cache::{SeriesCache, SeriesKey};
use crate::store::KlineStore;

/// Delay between two pages of the same paged fetch.
const PAGE_DELAY: Duration = Duration::from_millis(120);
/// Delay after each symbol a worker finishes.
const SYMBOL_DELAY: Duration = Duration::from_millis(150);
/// Retention trims run at most this often.
const TRIM_EVERY: Duration = Duration::from_secs(3600);
/// Upper bound on pages per fetch; a runaway cursor stops here.
const MAX_PAGES: usize = 1000;

const DAY_MS: i64 = 86_400_000;

/// Where the manager learns which symbols are worth syncing.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn active_symbols(&self) -> Result<Vec<String>>;
}

/// Production symbol discovery: symbols of projects whose status is in
/// the configured active set.
pub struct ProjectSymbolSource {
    pool: PgPool,
    statuses: Vec<String>,
}

impl ProjectSymbolSource {
    pub fn new(pool: PgPool, statuses: Vec<String>) -> Self {
        Self { pool, statuses }
    }
}

#[async_trait]
impl SymbolSource for ProjectSymbolSource {
    async fn active_symbols(&self) -> Result<Vec<String>> {
        let rows: Vec<Vec<String>> =
            sqlx::query_scalar("SELECT symbols FROM projects WHERE status = ANY($1)")
                .bind(&self.statuses)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().flatten().collect())
    }
}

#[derive(Debug, Clone)]
pub struct KlineManagerConfig {
    pub poll_every: Duration,
    pub history_days: i64,
    pub max_concurrency: usize,
    pub intervals: Vec<Interval>,
}

/// Cooperative stop switch for the ingestion loop. Takes effect between
/// ticks and between symbol pops, never mid-fetch.
#[derive(Clone)]
pub struct ManagerHandle {
    stopped: Arc<AtomicBool>,
}

impl ManagerHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Background ingestion loop: keeps a bounded rolling window of candles
/// in the store (and the hot cache) for every active symbol.
#[derive(Clone)]
pub struct KlineManager {
    exchange: String,
    store: Arc<dyn KlineStore>,
    venue: Arc<dyn CandleSource>,
    symbols: Arc<dyn SymbolSource>,
    cache: SeriesCache,
    config: KlineManagerConfig,
    stopped: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl KlineManager {
    pub fn new(
        exchange: impl Into<String>,
        store: Arc<dyn KlineStore>,
        venue: Arc<dyn CandleSource>,
        symbols: Arc<dyn SymbolSource>,
        cache: SeriesCache,
        config: KlineManagerConfig,
    ) -> (Self, ManagerHandle) {
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = ManagerHandle {
            stopped: stopped.clone(),
        };
        let manager = Self {
            exchange: exchange.into(),
            store,
            venue,
            symbols,
            cache,
            config,
            stopped,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };
        (manager, handle)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Run the ingestion loop until stopped. Call from `tokio::spawn`.
    /// Every tick error is caught and logged; the loop always continues.
    pub async fn run(self) {
        info!(
            intervals = ?self.config.intervals.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
            every = ?self.config.poll_every,
            "Kline manager running"
        );
        let mut last_trim: Option<Instant> = None;
        loop {
            if self.is_stopped() {
                info!("Kline manager stopped");
                return;
            }
            if let Err(e) = self.tick(&mut last_trim).await {
                error!(error = %e, "Kline tick failed");
            }
            tokio::time::sleep(self.config.poll_every).await;
        }
    }

    async fn tick(&self, last_trim: &mut Option<Instant>) -> Result<()> {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = self
            .symbols
            .active_symbols()
            .await?
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if symbols.is_empty() {
            return Ok(());
        }

        let queue: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(symbols.iter().cloned().collect()));
        let workers = self.config.max_concurrency.max(1).min(symbols.len());
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let manager = self.clone();
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { manager.drain_queue(queue).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        if last_trim.map_or(true, |t| t.elapsed() >= TRIM_EVERY) {
            self.trim_all(&symbols).await;
            *last_trim = Some(Instant::now());
        }
        Ok(())
    }

    /// One worker: pop symbols until the queue is drained or a stop is
    /// requested. A symbol another worker still holds in-flight is
    /// skipped, not re-queued.
    async fn drain_queue(&self, queue: Arc<Mutex<VecDeque<String>>>) {
        loop {
            if self.is_stopped() {
                return;
            }
            let symbol = {
                let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
                q.pop_front()
            };
            let Some(symbol) = symbol else { return };

            let claimed = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(symbol.clone());
            if !claimed {
                continue;
            }

            if let Err(e) = self.sync_one(&symbol).await {
                warn!(symbol = %symbol, error = %e, "Kline sync failed");
            }

            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&symbol);
            tokio::time::sleep(SYMBOL_DELAY).await;
        }
    }

    /// Bring one symbol up to date on every configured interval:
    /// bootstrap an unknown series, otherwise tail-sync from the last
    /// stored candle.
    async fn sync_one(&self, symbol: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for interval in &self.config.intervals {
            if self.is_stopped() {
                return Ok(());
            }
            let key = SeriesKey::new(self.exchange.clone(), symbol, *interval);
            let start = match self.store.latest_open_time(&key).await? {
                None => {
                    info!(series = %key, days = self.config.history_days, "Bootstrapping series");
                    now - self.config.history_days * DAY_MS
                }
                Some(latest) => {
                    let start = latest + interval.duration_ms();
                    if start > now - interval.duration_ms() {
                        continue; // up to date
                    }
                    start
                }
            };

            let candles = self.fetch_paged(symbol, *interval, start, now).await?;
            if !candles.is_empty() {
                self.store.upsert_many(&candles).await?;
                info!(series = %key, bars = candles.len(), "Series advanced");
            }

            // Keep the hot cache consistent for series someone is reading.
            if self.cache.contains(&key) {
                if let Err(e) = self.cache.preload(self.store.as_ref(), &key, None).await {
                    warn!(series = %key, error = %e, "Cache refresh failed");
                }
            }
        }
        Ok(())
    }

    /// Cursor-paged fetch over `[start_time, end_time]`, inclusive lower
    /// bound, ascending. Stops on an empty page, a short page, a cursor
    /// that failed to advance, or a cursor past the end.
    async fn fetch_paged(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Candle>> {
        let mut cursor = start_time;
        let mut out = Vec::new();

        for _ in 0..MAX_PAGES {
            if cursor > end_time {
                break;
            }
            let chunk = self
                .venue
                .fetch_candles(&FetchReq {
                    symbol: symbol.to_string(),
                    interval,
                    start_time: Some(cursor),
                    end_time: Some(end_time),
                    limit: Some(MAX_KLINES_LIMIT),
                })
                .await?;

            let Some(last) = chunk.last() else { break };
            let next = last.open_time + interval.duration_ms();
            let short = chunk.len() < MAX_KLINES_LIMIT;
            out.extend(chunk);

            if next <= cursor || short {
                break;
            }
            cursor = next;
            tokio::time::sleep(PAGE_DELAY).await;
        }
        Ok(out)
    }

    /// Trim every active series down to the retention window. Errors are
    /// logged and never abort the tick.
    async fn trim_all(&self, symbols: &[String]) {
        let min_open_time = Utc::now().timestamp_millis() - self.config.history_days * DAY_MS;
        for symbol in symbols {
            for interval in &self.config.intervals {
                let key = SeriesKey::new(self.exchange.clone(), symbol, *interval);
                match self.store.trim_old(&key, min_open_time).await {
                    Ok(0) => {}
                    Ok(n) => info!(series = %key, rows = n, "Trimmed old klines"),
                    Err(e) => warn!(series = %key, error = %e, "Trim failed"),
                }
            }
        }
    }
}
