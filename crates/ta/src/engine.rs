use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use common::Interval;
use marketdata::{Series, SeriesCache, SeriesKey};
use tracing::{debug, warn};

use crate::math::{self, Bands, MacdPoint};
use crate::source::Source;

/// Indicator surface for one strategy invocation, bound to one
/// (exchange, symbol) context.
///
/// Results are memoized for the lifetime of the object: three tables keyed
/// by canonical strings hold computed series, scalar results, and tuple
/// results, so a strategy can call the same indicator repeatedly without
/// recomputation. Degenerate input (missing series, short history,
/// non-finite values) yields NaN or `false`, never an error.
pub struct Indicators {
    cache: SeriesCache,
    exchange: String,
    symbol: String,
    default_tf: Interval,
    series_memo: Mutex<HashMap<String, Arc<Vec<f64>>>>,
    scalar_memo: Mutex<HashMap<String, f64>>,
    tuple_memo: Mutex<HashMap<String, [f64; 3]>>,
    warned: Mutex<HashSet<String>>,
}

impl Indicators {
    pub fn new(
        cache: SeriesCache,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        default_tf: Interval,
    ) -> Self {
        Self {
            cache,
            exchange: exchange.into(),
            symbol: symbol.into(),
            default_tf,
            series_memo: Mutex::new(HashMap::new()),
            scalar_memo: Mutex::new(HashMap::new()),
            tuple_memo: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // ── Parameter handling ──────────────────────────────────────────────

    /// Numeric parameters are floored to integers and lower-bounded at 1.
    fn period(n: f64) -> usize {
        if n.is_finite() {
            n.floor().max(1.0) as usize
        } else {
            1
        }
    }

    fn tf(&self, tf: &str) -> Interval {
        Interval::parse(tf.trim()).unwrap_or(self.default_tf)
    }

    fn source(&self, name: &str) -> Source {
        Source::lookup(name).unwrap_or_else(|| {
            self.warn_once(format!("source|{name}"), || {
                debug!(source = name, "Unknown source, defaulting to Close")
            });
            Source::Close
        })
    }

    /// Run `log` the first time `key` is seen in this invocation.
    fn warn_once(&self, key: String, log: impl FnOnce()) {
        let mut warned = self.warned.lock().unwrap_or_else(PoisonError::into_inner);
        if warned.insert(key) {
            log();
        }
    }

    // ── Series plumbing ─────────────────────────────────────────────────

    fn series(&self, tf: Interval) -> Option<Arc<Series>> {
        let key = SeriesKey::new(self.exchange.clone(), self.symbol.clone(), tf);
        self.cache.series(&key)
    }

    /// Derived source series, computed lazily and memoized.
    fn values(&self, tf: Interval, source: Source) -> Arc<Vec<f64>> {
        let key = format!("{tf}|src|{source}");
        if let Some(hit) = self
            .series_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return hit.clone();
        }
        let computed = Arc::new(
            self.series(tf)
                .map(|s| source.derive(&s))
                .unwrap_or_default(),
        );
        self.series_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, computed.clone());
        computed
    }

    fn memo_series(&self, key: String, compute: impl FnOnce() -> Vec<f64>) -> Arc<Vec<f64>> {
        if let Some(hit) = self
            .series_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return hit.clone();
        }
        let computed = Arc::new(compute());
        self.series_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, computed.clone());
        computed
    }

    fn memo_scalar(&self, key: String, compute: impl FnOnce() -> f64) -> f64 {
        if let Some(hit) = self
            .scalar_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return *hit;
        }
        let computed = compute();
        self.scalar_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, computed);
        computed
    }

    fn memo_tuple(&self, key: String, compute: impl FnOnce() -> [f64; 3]) -> [f64; 3] {
        if let Some(hit) = self
            .tuple_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return *hit;
        }
        let computed = compute();
        self.tuple_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, computed);
        computed
    }

    fn ema_series(&self, tf: Interval, source: Source, n: usize) -> Arc<Vec<f64>> {
        let values = self.values(tf, source);
        self.memo_series(format!("{tf}|ema[]|{source}|{n}"), || math::ema(&values, n))
    }

    fn sma_series(&self, tf: Interval, source: Source, n: usize) -> Arc<Vec<f64>> {
        let values = self.values(tf, source);
        self.memo_series(format!("{tf}|sma[]|{source}|{n}"), || math::sma(&values, n))
    }

    fn macd_series(
        &self,
        tf: Interval,
        source: Source,
        fast: usize,
        slow: usize,
        signal: usize,
    ) -> (Arc<Vec<f64>>, Arc<Vec<f64>>) {
        let line_key = format!("{tf}|macdline[]|{source}|{fast}|{slow}|{signal}");
        let signal_key = format!("{tf}|macdsig[]|{source}|{fast}|{slow}|{signal}");
        {
            let memo = self
                .series_memo
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let (Some(line), Some(sig)) = (memo.get(&line_key), memo.get(&signal_key)) {
                return (line.clone(), sig.clone());
            }
        }
        let values = self.values(tf, source);
        let (line, sig) = math::macd_lines(&values, fast, slow, signal);
        let line = Arc::new(line);
        let sig = Arc::new(sig);
        let mut memo = self
            .series_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        memo.insert(line_key, line.clone());
        memo.insert(signal_key, sig.clone());
        (line, sig)
    }

    // ── Scalar indicators ───────────────────────────────────────────────

    pub fn ema(&self, tf: &str, source: &str, length: f64) -> f64 {
        let (tf, source, n) = (self.tf(tf), self.source(source), Self::period(length));
        self.memo_scalar(format!("{tf}|EMA|{source}|{n}"), || {
            if self.values(tf, source).len() < n {
                return f64::NAN;
            }
            math::last_finite(&self.ema_series(tf, source, n))
        })
    }

    pub fn sma(&self, tf: &str, source: &str, length: f64) -> f64 {
        let (tf, source, n) = (self.tf(tf), self.source(source), Self::period(length));
        self.memo_scalar(format!("{tf}|SMA|{source}|{n}"), || {
            if self.values(tf, source).len() < n {
                return f64::NAN;
            }
            math::last_finite(&self.sma_series(tf, source, n))
        })
    }

    pub fn wma(&self, tf: &str, source: &str, length: f64) -> f64 {
        let (tf, source, n) = (self.tf(tf), self.source(source), Self::period(length));
        self.memo_scalar(format!("{tf}|WMA|{source}|{n}"), || {
            let values = self.values(tf, source);
            if values.len() < n {
                return f64::NAN;
            }
            math::last_finite(&math::wma(&values, n))
        })
    }

    /// RSI with Wilder smoothing. Any other smoothing name warns once per
    /// (indicator, value) pair and falls back to Wilder.
    pub fn rsi(&self, tf: &str, source: &str, period: f64, smoothing: Option<&str>) -> f64 {
        if let Some(name) = smoothing {
            if !matches!(name.trim().to_ascii_lowercase().as_str(), "wilder" | "rma") {
                self.warn_once(format!("RSI|{name}"), || {
                    warn!(smoothing = name, "Unknown RSI smoothing, using Wilder")
                });
            }
        }
        let (tf, source, n) = (self.tf(tf), self.source(source), Self::period(period));
        self.memo_scalar(format!("{tf}|RSI|{source}|{n}"), || {
            math::rsi(&self.values(tf, source), n)
        })
    }

    pub fn atr(&self, tf: &str, period: f64) -> f64 {
        let (tf, n) = (self.tf(tf), Self::period(period));
        self.memo_scalar(format!("{tf}|ATR|{n}"), || match self.series(tf) {
            Some(s) => math::atr(&s.highs, &s.lows, &s.closes, n),
            None => f64::NAN,
        })
    }

    /// Cumulative VWAP over the entire cached window; not session
    /// anchored. Rows with a non-finite price or volume are ignored.
    pub fn vwap(&self, tf: &str, source: Option<&str>) -> f64 {
        let tf = self.tf(tf);
        let source = source.map(|s| self.source(s)).unwrap_or(Source::Hlc3);
        self.memo_scalar(format!("{tf}|VWAP|{source}"), || {
            let Some(series) = self.series(tf) else {
                return f64::NAN;
            };
            let prices = source.derive(&series);
            let mut pv = 0.0;
            let mut vol = 0.0;
            for (p, v) in prices.iter().zip(&series.volumes) {
                if p.is_finite() && v.is_finite() {
                    pv += p * v;
                    vol += v;
                }
            }
            if vol > 0.0 {
                pv / vol
            } else {
                f64::NAN
            }
        })
    }

    // ── Tuple indicators ────────────────────────────────────────────────

    pub fn macd(&self, tf: &str, source: &str, fast: f64, slow: f64, signal: f64) -> MacdPoint {
        let (tf, source) = (self.tf(tf), self.source(source));
        let (fast, slow, signal) = (
            Self::period(fast),
            Self::period(slow),
            Self::period(signal),
        );
        let [m, s, h] = self.memo_tuple(
            format!("{tf}|MACD|{source}|{fast}|{slow}|{signal}"),
            || {
                let p = math::macd(&self.values(tf, source), fast, slow, signal);
                [p.macd, p.signal, p.histogram]
            },
        );
        MacdPoint {
            macd: m,
            signal: s,
            histogram: h,
        }
    }

    pub fn bbands(&self, tf: &str, source: &str, length: f64, mult: f64) -> Bands {
        let (tf, source, n) = (self.tf(tf), self.source(source), Self::period(length));
        let mult = if mult.is_finite() { mult } else { 2.0 };
        let [u, m, l] = self.memo_tuple(format!("{tf}|BB|{source}|{n}|{mult}"), || {
            let b = math::bollinger(&self.values(tf, source), n, mult);
            [b.upper, b.middle, b.lower]
        });
        Bands {
            upper: u,
            middle: m,
            lower: l,
        }
    }

    // ── Boolean indicators ──────────────────────────────────────────────

    /// With a finite `level`, compares the current close against it.
    /// Otherwise compares against the extreme of the previous `lookback`
    /// bars, excluding the current one.
    pub fn breakout_up(&self, tf: &str, lookback: f64, level: Option<f64>) -> bool {
        self.breakout(tf, lookback, level, true)
    }

    pub fn breakout_down(&self, tf: &str, lookback: f64, level: Option<f64>) -> bool {
        self.breakout(tf, lookback, level, false)
    }

    fn breakout(&self, tf: &str, lookback: f64, level: Option<f64>, up: bool) -> bool {
        let tf = self.tf(tf);
        let closes = self.values(tf, Source::Close);
        let Some(&curr) = closes.last() else {
            return false;
        };
        if !curr.is_finite() {
            return false;
        }

        if let Some(level) = level {
            if level.is_finite() {
                return if up { curr > level } else { curr < level };
            }
        }

        let n = Self::period(lookback);
        if closes.len() < n + 1 {
            return false;
        }
        let window = &closes[closes.len() - 1 - n..closes.len() - 1];
        let extreme = window
            .iter()
            .copied()
            .fold(f64::NAN, if up { f64::max } else { f64::min });
        if !extreme.is_finite() {
            return false;
        }
        if up {
            curr > extreme
        } else {
            curr < extreme
        }
    }

    pub fn ema_cross_up(&self, tf: &str, fast: f64, slow: f64) -> bool {
        let tf = self.tf(tf);
        let (fast, slow) = (Self::period(fast), Self::period(slow));
        let a = self.ema_series(tf, Source::Close, fast);
        let b = self.ema_series(tf, Source::Close, slow);
        math::cross_up(&a, &b)
    }

    pub fn ema_cross_down(&self, tf: &str, fast: f64, slow: f64) -> bool {
        let tf = self.tf(tf);
        let (fast, slow) = (Self::period(fast), Self::period(slow));
        let a = self.ema_series(tf, Source::Close, fast);
        let b = self.ema_series(tf, Source::Close, slow);
        math::cross_down(&a, &b)
    }

    pub fn sma_cross_up(&self, tf: &str, fast: f64, slow: f64) -> bool {
        let tf = self.tf(tf);
        let (fast, slow) = (Self::period(fast), Self::period(slow));
        let a = self.sma_series(tf, Source::Close, fast);
        let b = self.sma_series(tf, Source::Close, slow);
        math::cross_up(&a, &b)
    }

    pub fn macd_cross_up(&self, tf: &str, fast: f64, slow: f64, signal: f64) -> bool {
        let tf = self.tf(tf);
        let (fast, slow, signal) = (
            Self::period(fast),
            Self::period(slow),
            Self::period(signal),
        );
        let (line, sig) = self.macd_series(tf, Source::Close, fast, slow, signal);
        math::cross_up(&line, &sig)
    }
}
