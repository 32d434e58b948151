use async_trait::async_trait;
use sqlx::PgPool;

use common::{Candle, Result};

use crate::cache::SeriesKey;

/// Rows per bulk upsert statement. Bounds the payload the database sees
/// in one round trip.
const UPSERT_CHUNK: usize = 500;

/// Durable per-series candle persistence.
///
/// All operations may fail with a transport or constraint error; callers
/// treat failures as retryable on the next ingestion tick.
#[async_trait]
pub trait KlineStore: Send + Sync {
    /// Maximum stored open time for the series, or `None` when the series
    /// has never been written.
    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>>;

    /// Idempotent bulk upsert keyed on (exchange, symbol, interval,
    /// open_time). Returns the number of rows written.
    async fn upsert_many(&self, candles: &[Candle]) -> Result<u64>;

    /// Delete rows with `open_time < min_open_time` for the series.
    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<u64>;

    /// The most recent `limit` candles for the series, oldest first.
    async fn recent(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>>;
}

/// Postgres-backed kline store over the `market_klines` table.
pub struct PgKlineStore {
    pool: PgPool,
}

impl PgKlineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CandleRow {
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    close_time: i64,
}

#[async_trait]
impl KlineStore for PgKlineStore {
    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(open_time) FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3",
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn upsert_many(&self, candles: &[Candle]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in candles.chunks(UPSERT_CHUNK) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO market_klines \
                 (exchange, symbol, interval, open_time, open, high, low, close, volume, close_time) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(&c.exchange)
                    .push_bind(&c.symbol)
                    .push_bind(c.interval.as_str())
                    .push_bind(c.open_time)
                    .push_bind(c.open)
                    .push_bind(c.high)
                    .push_bind(c.low)
                    .push_bind(c.close)
                    .push_bind(c.volume)
                    .push_bind(c.close_time);
            });
            qb.push(
                " ON CONFLICT (exchange, symbol, interval, open_time) DO UPDATE SET \
                 open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
                 close = EXCLUDED.close, volume = EXCLUDED.volume, close_time = EXCLUDED.close_time",
            );
            written += qb.build().execute(&self.pool).await.map_err(common::Error::from)?.rows_affected();
        }
        Ok(written)
    }

    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3 AND open_time < $4",
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .bind(min_open_time)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn recent(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>> {
        // Newest-first fetch bounded by `limit`, reversed back to
        // chronological order for consumers.
        let rows: Vec<CandleRow> = sqlx::query_as(
            "SELECT open_time, open, high, low, close, volume, close_time
             FROM market_klines
             WHERE exchange = $1 AND symbol = $2 AND interval = $3
             ORDER BY open_time DESC
             LIMIT $4",
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.interval.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candles: Vec<Candle> = rows
            .into_iter()
            .map(|r| Candle {
                exchange: key.exchange.clone(),
                symbol: key.symbol.clone(),
                interval: key.interval,
                open_time: r.open_time,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
                close_time: r.close_time,
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }
}

/// In-memory kline store. Backs unit tests for the cache and the kline
/// manager without a database.
#[derive(Default)]
pub struct MemKlineStore {
    rows: std::sync::Mutex<std::collections::BTreeMap<MemKey, Candle>>,
}

type MemKey = (String, String, &'static str, i64);

impl MemKlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mem_key(key: &SeriesKey, open_time: i64) -> MemKey {
        (
            key.exchange.clone(),
            key.symbol.clone(),
            key.interval.as_str(),
            open_time,
        )
    }

    pub fn count(&self, key: &SeriesKey) -> usize {
        let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        rows.keys()
            .filter(|(e, s, i, _)| {
                *e == key.exchange && *s == key.symbol && *i == key.interval.as_str()
            })
            .count()
    }
}

#[async_trait]
impl KlineStore for MemKlineStore {
    async fn latest_open_time(&self, key: &SeriesKey) -> Result<Option<i64>> {
        let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(rows
            .iter()
            .filter(|((e, s, i, _), _)| {
                *e == key.exchange && *s == key.symbol && *i == key.interval.as_str()
            })
            .map(|((_, _, _, t), _)| *t)
            .max())
    }

    async fn upsert_many(&self, candles: &[Candle]) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for c in candles {
            let key = SeriesKey::new(c.exchange.clone(), c.symbol.clone(), c.interval);
            rows.insert(Self::mem_key(&key, c.open_time), c.clone());
        }
        Ok(candles.len() as u64)
    }

    async fn trim_old(&self, key: &SeriesKey, min_open_time: i64) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|(e, s, i, t), _| {
            !(*e == key.exchange
                && *s == key.symbol
                && *i == key.interval.as_str()
                && *t < min_open_time)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn recent(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>> {
        let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matched: Vec<Candle> = rows
            .iter()
            .filter(|((e, s, i, _), _)| {
                *e == key.exchange && *s == key.symbol && *i == key.interval.as_str()
            })
            .map(|(_, c)| c.clone())
            .collect();
        matched.sort_by_key(|c| c.open_time);
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Interval;

    fn candle(key: &SeriesKey, open_time: i64) -> Candle {
        Candle {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            interval: key.interval,
            open_time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            close_time: open_time + 59_999,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_under_the_primary_key() {
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::M1);
        let store = MemKlineStore::new();
        let candles = vec![candle(&key, 0), candle(&key, 60_000)];

        store.upsert_many(&candles).await.unwrap();
        store.upsert_many(&candles).await.unwrap();

        assert_eq!(store.count(&key), 2);
        assert_eq!(store.latest_open_time(&key).await.unwrap(), Some(60_000));
    }

    #[tokio::test]
    async fn trim_deletes_strictly_older_rows() {
        let key = SeriesKey::new("binance", "BTCUSDT", Interval::M1);
        let store = MemKlineStore::new();
        let candles: Vec<Candle> = (0..4).map(|i| candle(&key, i * 60_000)).collect();
        store.upsert_many(&candles).await.unwrap();

        let deleted = store.trim_old(&key, 120_000).await.unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.recent(&key, 10).await.unwrap();
        assert_eq!(remaining[0].open_time, 120_000);
    }

    #[tokio::test]
    async fn series_are_isolated_by_key() {
        let btc = SeriesKey::new("binance", "BTCUSDT", Interval::M1);
        let eth = SeriesKey::new("binance", "ETHUSDT", Interval::M1);
        let store = MemKlineStore::new();
        store.upsert_many(&[candle(&btc, 0)]).await.unwrap();

        assert_eq!(store.latest_open_time(&eth).await.unwrap(), None);
        assert!(store.recent(&eth, 10).await.unwrap().is_empty());
    }
}
