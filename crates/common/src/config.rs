use crate::Interval;

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Venue
    pub exchange_id: String,

    // Kline ingestion
    pub kline_retention_days: i64,
    pub kline_refresh_every_ms: u64,
    pub kline_max_concurrency: usize,
    pub kline_sync_intervals: Vec<Interval>,

    // Indicator cache
    pub indicator_max_candles: usize,

    // Scheduler
    pub active_project_statuses: Vec<String>,
    pub scheduler_tick_ms: u64,
    pub claim_batch: i32,
    pub vm_timeout_ms: u64,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let kline_sync_intervals = optional_env("KLINE_SYNC_INTERVALS")
            .unwrap_or_else(|| "1m,5m,15m,1h,4h,1d".to_string())
            .split(',')
            .map(|s| {
                let s = s.trim();
                Interval::parse(s).unwrap_or_else(|| {
                    panic!("KLINE_SYNC_INTERVALS contains unknown interval: '{s}'")
                })
            })
            .collect();

        let active_project_statuses = optional_env("ACTIVE_PROJECT_STATUSES")
            .unwrap_or_else(|| "live,running".to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Config {
            database_url: required_env("DATABASE_URL"),
            exchange_id: optional_env("EXCHANGE_ID").unwrap_or_else(|| "binance".to_string()),
            kline_retention_days: env_i64("KLINE_RETENTION_DAYS", 30).max(1),
            // Refreshing faster than 10s would hammer the venue for no gain.
            kline_refresh_every_ms: env_u64("KLINE_REFRESH_EVERY_MS", 60_000).max(10_000),
            kline_max_concurrency: env_u64("KLINE_MAX_CONCURRENCY", 3).max(1) as usize,
            kline_sync_intervals,
            indicator_max_candles: env_u64("INDICATOR_MAX_CANDLES", 5_000).max(50) as usize,
            active_project_statuses,
            scheduler_tick_ms: env_u64("SCHEDULER_TICK_MS", 2_000).max(250),
            claim_batch: env_i64("CLAIM_BATCH", 5).clamp(1, 100) as i32,
            vm_timeout_ms: env_u64("VM_TIMEOUT_MS", 5_000).max(100),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    optional_env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    optional_env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
