pub mod ledger;

pub use ledger::{Ledger, LogEntry, MemLedger, PgLedger};

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use common::{Interval, LogLevel, Position, PositionSide, PositionStatus, Result};
use marketdata::{SeriesCache, SeriesKey};

/// Remainders at or below this are treated as a full close.
const DUST_QTY: f64 = 1e-12;

/// Paper order execution for one (project, symbol) invocation.
///
/// All state lives in the ledger; the broker is a thin command layer that
/// marks prices from the hot series cache and never touches a real venue.
/// Invalid requests degrade to logged no-ops; only storage failures
/// propagate and fail the enclosing run.
pub struct PaperBroker {
    ledger: Arc<dyn Ledger>,
    cache: SeriesCache,
    exchange: String,
    symbol: String,
    project_id: Uuid,
    user_id: Uuid,
    mark_tf: Interval,
}

impl PaperBroker {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        cache: SeriesCache,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        Self {
            ledger,
            cache,
            exchange: exchange.into(),
            symbol: symbol.into(),
            project_id,
            user_id,
            mark_tf: Interval::M1,
        }
    }

    /// The last close of the broker's mark timeframe. A degenerate last
    /// close (non-finite or non-positive) means no price — the broker
    /// must not silently fall back to an older bar.
    fn mark_price(&self) -> Option<f64> {
        let key = SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.mark_tf);
        let series = self.cache.series(&key)?;
        let last = *series.closes.last()?;
        (last.is_finite() && last > 0.0).then_some(last)
    }

    /// Open a long worth `usd` at the current mark price. No-ops (with a
    /// strategy log line) on bad input, a missing mark price, or an
    /// already-open position — including one opened concurrently, which
    /// surfaces as a unique violation from the ledger.
    pub async fn buy(&self, usd: f64) -> Result<()> {
        if !usd.is_finite() || usd <= 0.0 {
            self.log(LogLevel::Warn, "buy ignored: usd must be positive", json!({ "usd": usd }))
                .await;
            return Ok(());
        }
        if self
            .ledger
            .open_position(self.project_id, &self.symbol)
            .await?
            .is_some()
        {
            self.log(LogLevel::Info, "buy skipped: position already open", Value::Null)
                .await;
            return Ok(());
        }
        let Some(price) = self.mark_price() else {
            self.log(
                LogLevel::Warn,
                "buy ignored: no mark price available",
                json!({ "symbol": self.symbol, "tf": self.mark_tf.as_str() }),
            )
            .await;
            return Ok(());
        };

        let position = Position {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            user_id: self.user_id,
            symbol: self.symbol.clone(),
            side: PositionSide::Long,
            status: PositionStatus::Open,
            qty: usd / price,
            entry_price: price,
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            realized_pnl: 0.0,
        };

        match self.ledger.insert_position(&position).await {
            Ok(()) => {
                self.log(
                    LogLevel::Info,
                    "opened long",
                    json!({ "qty": position.qty, "price": price, "usd": usd }),
                )
                .await;
                Ok(())
            }
            Err(common::Error::UniqueViolation) => {
                self.log(LogLevel::Info, "buy skipped: position already open", Value::Null)
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close `pct` percent of the open position at the current mark
    /// price. Remainders at or below dust close the position outright.
    pub async fn sell(&self, pct: f64) -> Result<()> {
        if !pct.is_finite() || pct <= 0.0 {
            self.log(LogLevel::Warn, "sell ignored: pct must be positive", json!({ "pct": pct }))
                .await;
            return Ok(());
        }
        let Some(position) = self
            .ledger
            .open_position(self.project_id, &self.symbol)
            .await?
        else {
            self.log(LogLevel::Info, "sell skipped: no open position", Value::Null)
                .await;
            return Ok(());
        };
        let Some(price) = self.mark_price() else {
            self.log(
                LogLevel::Warn,
                "sell ignored: no mark price available",
                json!({ "symbol": self.symbol, "tf": self.mark_tf.as_str() }),
            )
            .await;
            return Ok(());
        };

        let close_frac = (pct / 100.0).min(1.0);
        let close_qty = position.qty * close_frac;
        let remaining = position.qty - close_qty;
        let realized = (price - position.entry_price) * close_qty;
        let total_pnl = position.realized_pnl + realized;
        let now = Utc::now();

        if remaining <= DUST_QTY {
            self.ledger
                .close_position(position.id, price, now, total_pnl)
                .await?;
            self.log(
                LogLevel::Info,
                "closed long",
                json!({ "qty": close_qty, "price": price, "realized_pnl": total_pnl }),
            )
            .await;
        } else {
            self.ledger
                .reduce_position(position.id, remaining, price, now, total_pnl)
                .await?;
            self.log(
                LogLevel::Info,
                "reduced long",
                json!({ "closed_qty": close_qty, "remaining_qty": remaining, "price": price }),
            )
            .await;
        }
        Ok(())
    }

    /// Append a strategy log line. A failed write must never abort the
    /// run, so errors are reported on the host log only.
    pub async fn log(&self, level: LogLevel, message: &str, meta: Value) {
        debug!(project = %self.project_id, %level, message, "strategy log");
        if let Err(e) = self
            .ledger
            .append_log(self.project_id, self.user_id, level, message, &meta)
            .await
        {
            warn!(project = %self.project_id, error = %e, "Strategy log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use marketdata::Series;

    fn cache_with_close(symbol: &str, close: f64) -> SeriesCache {
        let cache = SeriesCache::new(100);
        set_mark(&cache, symbol, close);
        cache
    }

    fn set_mark(cache: &SeriesCache, symbol: &str, close: f64) {
        cache.insert(
            SeriesKey::new("binance", symbol, Interval::M1),
            Series {
                open_times: vec![0],
                opens: vec![close],
                highs: vec![close],
                lows: vec![close],
                closes: vec![close],
                volumes: vec![1.0],
            },
        );
    }

    fn broker(ledger: Arc<MemLedger>, cache: SeriesCache) -> PaperBroker {
        PaperBroker::new(
            ledger,
            cache,
            "binance",
            "BTCUSDT",
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn buy_then_partial_then_full_sell() {
        let ledger = Arc::new(MemLedger::new());
        let cache = cache_with_close("BTCUSDT", 50.0);
        let hp = broker(ledger.clone(), cache.clone());

        hp.buy(100.0).await.unwrap();
        let open = ledger.positions()[0].clone();
        assert_eq!(open.status, PositionStatus::Open);
        assert!((open.qty - 2.0).abs() < 1e-12);
        assert_eq!(open.entry_price, 50.0);

        set_mark(&cache, "BTCUSDT", 60.0);
        hp.sell(50.0).await.unwrap();
        let reduced = ledger.positions()[0].clone();
        assert_eq!(reduced.status, PositionStatus::Open);
        assert!((reduced.qty - 1.0).abs() < 1e-12);
        assert!((reduced.realized_pnl - 10.0).abs() < 1e-9);

        set_mark(&cache, "BTCUSDT", 70.0);
        hp.sell(100.0).await.unwrap();
        let closed = ledger.positions()[0].clone();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_price, Some(70.0));
        assert!((closed.realized_pnl - 30.0).abs() < 1e-9);

        // Fully closed — nothing left to sell.
        assert!(hp
            .ledger
            .open_position(hp.project_id, "BTCUSDT")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn realized_pnl_matches_exit_vwap_identity() {
        let ledger = Arc::new(MemLedger::new());
        let cache = cache_with_close("BTCUSDT", 50.0);
        let hp = broker(ledger.clone(), cache.clone());

        hp.buy(100.0).await.unwrap(); // qty 2 @ 50

        let mut sold = Vec::new(); // (qty, price)
        set_mark(&cache, "BTCUSDT", 60.0);
        hp.sell(25.0).await.unwrap();
        sold.push((0.5, 60.0));
        set_mark(&cache, "BTCUSDT", 70.0);
        hp.sell(50.0).await.unwrap(); // 50% of remaining 1.5
        sold.push((0.75, 70.0));
        set_mark(&cache, "BTCUSDT", 40.0);
        hp.sell(100.0).await.unwrap();
        sold.push((0.75, 40.0));

        let total_qty: f64 = sold.iter().map(|(q, _)| q).sum();
        let exit_vwap: f64 = sold.iter().map(|(q, p)| q * p).sum::<f64>() / total_qty;
        let expected = (exit_vwap - 50.0) * total_qty;

        let closed = ledger.positions()[0].clone();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(
            (closed.realized_pnl - expected).abs() < 1e-9,
            "pnl {} vs {}",
            closed.realized_pnl,
            expected
        );
    }

    #[tokio::test]
    async fn bad_amounts_are_logged_noops() {
        let ledger = Arc::new(MemLedger::new());
        let hp = broker(ledger.clone(), cache_with_close("BTCUSDT", 50.0));

        hp.buy(0.0).await.unwrap();
        hp.buy(-5.0).await.unwrap();
        hp.buy(f64::NAN).await.unwrap();
        hp.sell(0.0).await.unwrap();

        assert!(ledger.positions().is_empty());
        assert!(ledger.logs().iter().all(|l| l.level == LogLevel::Warn));
        assert_eq!(ledger.logs().len(), 4);
    }

    #[tokio::test]
    async fn second_buy_is_a_noop_while_open() {
        let ledger = Arc::new(MemLedger::new());
        let hp = broker(ledger.clone(), cache_with_close("BTCUSDT", 50.0));

        hp.buy(100.0).await.unwrap();
        hp.buy(100.0).await.unwrap();

        assert_eq!(ledger.positions().len(), 1);
    }

    #[tokio::test]
    async fn sell_without_position_is_a_noop() {
        let ledger = Arc::new(MemLedger::new());
        let hp = broker(ledger.clone(), cache_with_close("BTCUSDT", 50.0));

        hp.sell(100.0).await.unwrap();
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.logs().len(), 1);
        assert_eq!(ledger.logs()[0].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn buy_without_mark_price_is_a_noop() {
        let ledger = Arc::new(MemLedger::new());
        let hp = broker(ledger.clone(), SeriesCache::new(100));

        hp.buy(100.0).await.unwrap();
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.logs()[0].level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn degenerate_last_close_does_not_fall_back_to_older_bars() {
        let ledger = Arc::new(MemLedger::new());
        let cache = SeriesCache::new(100);
        // Healthy bar followed by a zero close: the price is unavailable,
        // not 50.0.
        cache.insert(
            SeriesKey::new("binance", "BTCUSDT", Interval::M1),
            Series {
                open_times: vec![0, 60_000],
                opens: vec![50.0, 50.0],
                highs: vec![51.0, 51.0],
                lows: vec![49.0, 0.0],
                closes: vec![50.0, 0.0],
                volumes: vec![1.0, 1.0],
            },
        );
        let hp = broker(ledger.clone(), cache);

        hp.buy(100.0).await.unwrap();
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.logs()[0].level, LogLevel::Warn);
    }

    /// Ledger that loses the open-check race: the open lookup sees
    /// nothing, but the insert hits the unique constraint.
    struct RacingLedger(MemLedger);

    #[async_trait]
    impl Ledger for RacingLedger {
        async fn open_position(&self, _p: Uuid, _s: &str) -> Result<Option<Position>> {
            Ok(None)
        }
        async fn insert_position(&self, _p: &Position) -> Result<()> {
            Err(common::Error::UniqueViolation)
        }
        async fn reduce_position(
            &self,
            id: Uuid,
            q: f64,
            ep: f64,
            et: DateTime<Utc>,
            pnl: f64,
        ) -> Result<()> {
            self.0.reduce_position(id, q, ep, et, pnl).await
        }
        async fn close_position(
            &self,
            id: Uuid,
            ep: f64,
            et: DateTime<Utc>,
            pnl: f64,
        ) -> Result<()> {
            self.0.close_position(id, ep, et, pnl).await
        }
        async fn append_log(
            &self,
            p: Uuid,
            u: Uuid,
            l: LogLevel,
            m: &str,
            meta: &Value,
        ) -> Result<()> {
            self.0.append_log(p, u, l, m, meta).await
        }
    }

    #[tokio::test]
    async fn unique_violation_on_buy_is_already_open_noop() {
        let racing = Arc::new(RacingLedger(MemLedger::new()));
        let hp = PaperBroker::new(
            racing.clone(),
            cache_with_close("BTCUSDT", 50.0),
            "binance",
            "BTCUSDT",
            Uuid::new_v4(),
            Uuid::new_v4(),
        );

        // The lost race must not surface as an error.
        hp.buy(100.0).await.unwrap();
        let logs = racing.0.logs();
        assert!(logs.iter().any(|l| l.message.contains("already open")));
    }

    #[tokio::test]
    async fn dust_remainder_closes_outright() {
        let ledger = Arc::new(MemLedger::new());
        let hp = broker(ledger.clone(), cache_with_close("BTCUSDT", 50.0));

        hp.buy(100.0).await.unwrap();
        // 99.9999999999999% leaves a remainder below the dust threshold.
        hp.sell(99.9999999999999).await.unwrap();
        assert_eq!(ledger.positions()[0].status, PositionStatus::Closed);
    }
}
