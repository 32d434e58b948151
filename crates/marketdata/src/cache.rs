use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use common::{Candle, Interval, Result};
use tracing::debug;

use crate::store::KlineStore;

/// Identity of one cached series: (exchange, symbol, interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            interval,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.interval)
    }
}

/// Parallel OHLCV arrays for one series, ascending by open time.
///
/// A `Series` is immutable once built; the cache swaps whole `Arc<Series>`
/// values so readers never observe a partially updated window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub open_times: Vec<i64>,
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl Series {
    pub fn from_candles(candles: &[Candle]) -> Series {
        let mut s = Series {
            open_times: Vec::with_capacity(candles.len()),
            opens: Vec::with_capacity(candles.len()),
            highs: Vec::with_capacity(candles.len()),
            lows: Vec::with_capacity(candles.len()),
            closes: Vec::with_capacity(candles.len()),
            volumes: Vec::with_capacity(candles.len()),
        };
        for c in candles {
            s.open_times.push(c.open_time);
            s.opens.push(c.open);
            s.highs.push(c.high);
            s.lows.push(c.low);
            s.closes.push(c.close);
            s.volumes.push(c.volume);
        }
        s
    }

    pub fn len(&self) -> usize {
        self.open_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_times.is_empty()
    }
}

/// Lower bound on the per-series window the cache will hold.
pub const MIN_CACHE_CANDLES: usize = 50;

/// In-memory hot window of recent candles per series.
///
/// Reads are synchronous and never block on I/O; the only write path is
/// `preload`, which re-reads the durable store and replaces the entry
/// wholesale. Cloning the cache clones a handle to shared state.
#[derive(Clone)]
pub struct SeriesCache {
    entries: Arc<RwLock<HashMap<SeriesKey, Arc<Series>>>>,
    cap: usize,
}

impl SeriesCache {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            cap: cap.max(MIN_CACHE_CANDLES),
        }
    }

    pub fn series(&self, key: &SeriesKey) -> Option<Arc<Series>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Close prices for the series, oldest first. Empty when not cached.
    pub fn closes(&self, key: &SeriesKey) -> Vec<f64> {
        self.series(key).map(|s| s.closes.clone()).unwrap_or_default()
    }

    /// Fetch the most recent `min(cap, max_candles)` candles from the
    /// store and replace the cached entry atomically. A failed fetch
    /// leaves any existing entry untouched and surfaces the error.
    pub async fn preload(
        &self,
        store: &dyn KlineStore,
        key: &SeriesKey,
        max_candles: Option<usize>,
    ) -> Result<Arc<Series>> {
        let want = max_candles.map_or(self.cap, |m| m.min(self.cap)).max(1);
        let candles = store.recent(key, want).await?;
        let series = Arc::new(Series::from_candles(&candles));
        debug!(series = %key, bars = series.len(), "series preloaded");

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), series.clone());
        Ok(series)
    }

    /// Insert a prebuilt series. Used by tests and by callers that already
    /// hold the candles.
    pub fn insert(&self, key: SeriesKey, series: Series) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(series));
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemKlineStore;
    use common::Interval;

    fn candle(key: &SeriesKey, open_time: i64, close: f64) -> Candle {
        Candle {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            interval: key.interval,
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time: open_time + key.interval.duration_ms() - 1,
        }
    }

    #[tokio::test]
    async fn preload_is_oldest_first_and_strictly_ascending() {
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::M1);
        let store = MemKlineStore::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(&key, i * 60_000, 100.0 + i as f64)).collect();
        store.upsert_many(&candles).await.unwrap();

        let cache = SeriesCache::new(100);
        let series = cache.preload(&store, &key, None).await.unwrap();

        assert_eq!(series.len(), 5);
        assert!(series.open_times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(series.closes, vec![100.0, 101.0, 102.0, 103.0, 104.0]);
    }

    #[tokio::test]
    async fn preload_keeps_only_most_recent_candles() {
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::M1);
        let store = MemKlineStore::new();
        let candles: Vec<Candle> =
            (0..200).map(|i| candle(&key, i * 60_000, i as f64)).collect();
        store.upsert_many(&candles).await.unwrap();

        let cache = SeriesCache::new(100);
        let series = cache.preload(&store, &key, Some(60)).await.unwrap();

        assert_eq!(series.len(), 60);
        // The window ends at the newest candle.
        assert_eq!(*series.closes.last().unwrap(), 199.0);
    }

    #[tokio::test]
    async fn cap_is_floored() {
        let cache = SeriesCache::new(1);
        assert_eq!(cache.cap, MIN_CACHE_CANDLES);
    }

    #[tokio::test]
    async fn reads_miss_until_preloaded_and_clear_wipes() {
        let key = SeriesKey::new("binance", "ETHUSDT", Interval::M5);
        let store = MemKlineStore::new();
        store
            .upsert_many(&[candle(&key, 0, 50.0)])
            .await
            .unwrap();

        let cache = SeriesCache::new(100);
        assert!(cache.series(&key).is_none());
        assert!(cache.closes(&key).is_empty());

        cache.preload(&store, &key, None).await.unwrap();
        assert_eq!(cache.closes(&key), vec![50.0]);

        cache.clear();
        assert!(cache.series(&key).is_none());
    }
}
