use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use tracing::debug;

use broker::PaperBroker;
use common::{Error, LogLevel, Result};
use ta::Indicators;

/// Extra slack on the outer watchdog so the in-VM deadline fires first.
const WATCHDOG_GRACE: Duration = Duration::from_millis(500);

/// Execute one user strategy against a fresh, restricted script engine.
///
/// The engine exposes exactly the indicator surface, the `HP` broker
/// facade and a read-only `context` map. There is no module loader, no
/// filesystem, no network and no process access; `eval` is disabled so
/// the script cannot compile code from strings. A wall-clock deadline is
/// enforced from inside the VM at every operation boundary — time spent
/// inside a broker call is only charged once control returns to the
/// script. The outer watchdog covers a script stuck inside a host call.
///
/// Script errors and timeouts surface as `Error::Sandbox`; the caller
/// turns them into a failed run without touching other projects.
pub async fn execute(
    source: String,
    indicators: Arc<Indicators>,
    broker: Arc<PaperBroker>,
    timeout: Duration,
) -> Result<()> {
    let handle = tokio::runtime::Handle::current();
    let task = tokio::task::spawn_blocking(move || -> Result<()> {
        let engine = build_engine(&indicators, timeout);
        let mut scope = Scope::new();
        scope.push_constant("context", context_map(&indicators));
        scope.push("HP", HpBroker { broker, handle });

        match engine.eval_with_scope::<Dynamic>(&mut scope, &source) {
            Ok(_) => Ok(()),
            Err(e) => match *e {
                EvalAltResult::ErrorTerminated(..) => Err(Error::Sandbox(format!(
                    "strategy exceeded its {} ms budget",
                    timeout.as_millis()
                ))),
                other => Err(Error::Sandbox(other.to_string())),
            },
        }
    });

    match tokio::time::timeout(timeout + WATCHDOG_GRACE, task).await {
        Err(_) => Err(Error::Sandbox(format!(
            "strategy exceeded its {} ms budget",
            timeout.as_millis()
        ))),
        Ok(Err(join_err)) => Err(Error::Sandbox(format!("strategy task failed: {join_err}"))),
        Ok(Ok(result)) => result,
    }
}

fn context_map(indicators: &Indicators) -> Map {
    let mut ctx = Map::new();
    ctx.insert("exchange".into(), indicators.exchange().into());
    ctx.insert("symbol".into(), indicators.symbol().into());
    ctx
}

/// Broker facade bound into the script as `HP`. Broker calls are async
/// under the hood; the facade blocks the VM thread on each call, which is
/// the script's only suspension point.
#[derive(Clone)]
struct HpBroker {
    broker: Arc<PaperBroker>,
    handle: tokio::runtime::Handle,
}

impl HpBroker {
    fn buy(&self, usd: f64) -> Result<(), Box<EvalAltResult>> {
        self.handle
            .block_on(self.broker.buy(usd))
            .map_err(|e| e.to_string().into())
    }

    fn sell(&self, pct: f64) -> Result<(), Box<EvalAltResult>> {
        self.handle
            .block_on(self.broker.sell(pct))
            .map_err(|e| e.to_string().into())
    }

    fn log(&self, level: &str, message: &str, meta: serde_json::Value) {
        self.handle
            .block_on(self.broker.log(LogLevel::parse(level), message, meta));
    }
}

// ── Parameter extraction ────────────────────────────────────────────────

/// Numeric map field; integers are accepted where floats are expected.
/// Missing or non-numeric fields come back NaN and are clamped by the
/// indicator engine's coercion rules.
fn num(params: &Map, key: &str) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().ok().or_else(|| v.as_int().ok().map(|i| i as f64)))
        .unwrap_or(f64::NAN)
}

fn opt_num(params: &Map, key: &str) -> Option<f64> {
    let v = num(params, key);
    v.is_finite().then_some(v)
}

fn text(params: &Map, key: &str) -> String {
    params
        .get(key)
        .and_then(|v| v.clone().into_string().ok())
        .unwrap_or_default()
}

fn opt_text(params: &Map, key: &str) -> Option<String> {
    let s = text(params, key);
    (!s.is_empty()).then_some(s)
}

/// Structured log metadata crossing out of the VM. Only plain values
/// survive; anything exotic is stringified.
fn meta_value(params: &Map) -> serde_json::Value {
    let entries = params
        .iter()
        .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
        .collect();
    serde_json::Value::Object(entries)
}

fn dynamic_to_json(v: &Dynamic) -> serde_json::Value {
    if let Ok(b) = v.as_bool() {
        return serde_json::Value::Bool(b);
    }
    if let Ok(i) = v.as_int() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = v.as_float() {
        return serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if v.is_unit() {
        return serde_json::Value::Null;
    }
    if let Some(map) = v.read_lock::<Map>() {
        return serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    if let Some(array) = v.read_lock::<rhai::Array>() {
        return serde_json::Value::Array(array.iter().map(dynamic_to_json).collect());
    }
    serde_json::Value::String(v.to_string())
}

// ── Engine construction ─────────────────────────────────────────────────

fn build_engine(indicators: &Arc<Indicators>, timeout: Duration) -> Engine {
    let mut engine = Engine::new();

    // No code-from-string, no module imports, bounded recursion, bounded
    // data. The dummy resolver backstops `import` in case the symbol ever
    // comes back.
    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.set_max_call_levels(64);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(10_000);

    let deadline = Instant::now() + timeout;
    engine.on_progress(move |_ops| {
        if Instant::now() >= deadline {
            Some("timeout".into())
        } else {
            None
        }
    });

    register_indicators(&mut engine, indicators);
    register_broker(&mut engine);
    engine
}

fn register_indicators(engine: &mut Engine, indicators: &Arc<Indicators>) {
    macro_rules! scalar_ma {
        ($name:literal, $method:ident) => {
            let ind = indicators.clone();
            engine.register_fn($name, move |params: Map| -> f64 {
                ind.$method(&text(&params, "tf"), &text(&params, "source"), num(&params, "length"))
            });
        };
    }
    scalar_ma!("EMA", ema);
    scalar_ma!("SMA", sma);
    scalar_ma!("WMA", wma);

    let ind = indicators.clone();
    engine.register_fn("RSI", move |params: Map| -> f64 {
        ind.rsi(
            &text(&params, "tf"),
            &text(&params, "source"),
            num(&params, "period"),
            opt_text(&params, "smoothing").as_deref(),
        )
    });

    let ind = indicators.clone();
    engine.register_fn("ATR", move |params: Map| -> f64 {
        ind.atr(&text(&params, "tf"), num(&params, "period"))
    });

    let ind = indicators.clone();
    engine.register_fn("MACD", move |params: Map| -> Map {
        let p = ind.macd(
            &text(&params, "tf"),
            &text(&params, "source"),
            num(&params, "fast"),
            num(&params, "slow"),
            num(&params, "signal"),
        );
        let mut out = Map::new();
        out.insert("macd".into(), Dynamic::from(p.macd));
        out.insert("signal".into(), Dynamic::from(p.signal));
        out.insert("histogram".into(), Dynamic::from(p.histogram));
        out
    });

    let ind = indicators.clone();
    engine.register_fn("BBANDS", move |params: Map| -> Map {
        let mult = opt_num(&params, "mult").unwrap_or(2.0);
        let b = ind.bbands(
            &text(&params, "tf"),
            &text(&params, "source"),
            num(&params, "length"),
            mult,
        );
        let mut out = Map::new();
        out.insert("upper".into(), Dynamic::from(b.upper));
        out.insert("middle".into(), Dynamic::from(b.middle));
        out.insert("lower".into(), Dynamic::from(b.lower));
        out
    });

    let ind = indicators.clone();
    engine.register_fn("VWAP", move |params: Map| -> f64 {
        ind.vwap(&text(&params, "tf"), opt_text(&params, "source").as_deref())
    });
    let ind = indicators.clone();
    engine.register_fn("VWAP", move || -> f64 { ind.vwap("", None) });

    let ind = indicators.clone();
    engine.register_fn("BREAKOUT_UP", move |params: Map| -> bool {
        ind.breakout_up(&text(&params, "tf"), num(&params, "lookback"), opt_num(&params, "level"))
    });
    let ind = indicators.clone();
    engine.register_fn("BREAKOUT_DOWN", move |params: Map| -> bool {
        ind.breakout_down(&text(&params, "tf"), num(&params, "lookback"), opt_num(&params, "level"))
    });

    macro_rules! ma_cross {
        ($name:literal, $method:ident) => {
            let ind = indicators.clone();
            engine.register_fn($name, move |params: Map| -> bool {
                ind.$method(&text(&params, "tf"), num(&params, "fast"), num(&params, "slow"))
            });
        };
    }
    ma_cross!("EMA_CROSS_UP", ema_cross_up);
    ma_cross!("EMA_CROSS_DOWN", ema_cross_down);
    ma_cross!("SMA_CROSS_UP", sma_cross_up);

    let ind = indicators.clone();
    engine.register_fn("MACD_CROSS_UP", move |params: Map| -> bool {
        ind.macd_cross_up(
            &text(&params, "tf"),
            num(&params, "fast"),
            num(&params, "slow"),
            num(&params, "signal"),
        )
    });
}

/// `HP.buy` / `HP.sell` accept the object form (`#{usd: ...}` /
/// `#{pct: ...}`) plus the legacy positional forms: a bare number, or
/// `(symbol, number)` where the symbol is ignored because the host runs
/// one symbol per invocation.
fn register_broker(engine: &mut Engine) {
    engine.register_type_with_name::<HpBroker>("Broker");

    engine.register_fn("buy", |hp: &mut HpBroker, params: Map| hp.buy(num(&params, "usd")));
    engine.register_fn("buy", |hp: &mut HpBroker, usd: f64| hp.buy(usd));
    engine.register_fn("buy", |hp: &mut HpBroker, usd: i64| hp.buy(usd as f64));
    engine.register_fn("buy", |hp: &mut HpBroker, symbol: &str, usd: f64| {
        debug!(symbol, "legacy buy(symbol, usd) form");
        hp.buy(usd)
    });
    engine.register_fn("buy", |hp: &mut HpBroker, symbol: &str, usd: i64| {
        debug!(symbol, "legacy buy(symbol, usd) form");
        hp.buy(usd as f64)
    });

    engine.register_fn("sell", |hp: &mut HpBroker, params: Map| hp.sell(num(&params, "pct")));
    engine.register_fn("sell", |hp: &mut HpBroker, pct: f64| hp.sell(pct));
    engine.register_fn("sell", |hp: &mut HpBroker, pct: i64| hp.sell(pct as f64));
    engine.register_fn("sell", |hp: &mut HpBroker, symbol: &str, pct: f64| {
        debug!(symbol, "legacy sell(symbol, pct) form");
        hp.sell(pct)
    });
    engine.register_fn("sell", |hp: &mut HpBroker, symbol: &str, pct: i64| {
        debug!(symbol, "legacy sell(symbol, pct) form");
        hp.sell(pct as f64)
    });

    engine.register_fn("log", |hp: &mut HpBroker, level: &str, message: &str| {
        hp.log(level, message, serde_json::Value::Null)
    });
    engine.register_fn(
        "log",
        |hp: &mut HpBroker, level: &str, message: &str, meta: Map| {
            let meta = meta_value(&meta);
            hp.log(level, message, meta)
        },
    );
    engine.register_fn("log", |hp: &mut HpBroker, message: &str| {
        hp.log("info", message, serde_json::Value::Null)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::MemLedger;
    use common::{Interval, PositionStatus};
    use marketdata::{Series, SeriesCache, SeriesKey};
    use uuid::Uuid;

    fn cache_with_closes(closes: &[f64]) -> SeriesCache {
        let cache = SeriesCache::new(100);
        cache.insert(
            SeriesKey::new("binance", "BTCUSDT", Interval::M1),
            Series {
                open_times: (0..closes.len() as i64).map(|i| i * 60_000).collect(),
                opens: closes.to_vec(),
                highs: closes.iter().map(|c| c + 1.0).collect(),
                lows: closes.iter().map(|c| c - 1.0).collect(),
                closes: closes.to_vec(),
                volumes: vec![1.0; closes.len()],
            },
        );
        cache
    }

    fn harness(closes: &[f64]) -> (Arc<MemLedger>, Arc<Indicators>, Arc<PaperBroker>) {
        let cache = cache_with_closes(closes);
        let ledger = Arc::new(MemLedger::new());
        let indicators = Arc::new(Indicators::new(
            cache.clone(),
            "binance",
            "BTCUSDT",
            Interval::M1,
        ));
        let broker = Arc::new(PaperBroker::new(
            ledger.clone() as Arc<dyn broker::Ledger>,
            cache,
            "binance",
            "BTCUSDT",
            Uuid::new_v4(),
            Uuid::new_v4(),
        ));
        (ledger, indicators, broker)
    }

    async fn run(source: &str, closes: &[f64]) -> (Result<()>, Arc<MemLedger>) {
        let (ledger, indicators, broker) = harness(closes);
        let result = execute(
            source.to_string(),
            indicators,
            broker,
            Duration::from_secs(5),
        )
        .await;
        (result, ledger)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn strategy_can_read_indicators_and_buy() {
        let source = r#"
            let fast = EMA(#{ tf: "1m", length: 3 });
            let slow = EMA(#{ tf: "1m", length: 5 });
            if fast >= slow {
                HP.buy(#{ usd: 100.0 });
            }
        "#;
        let closes: Vec<f64> = (0..20).map(|i| 50.0 + i as f64).collect();
        let (result, ledger) = run(source, &closes).await;
        result.unwrap();

        let positions = ledger.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Open);
        assert_eq!(positions[0].entry_price, 69.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_positional_forms_work() {
        let source = r#"
            HP.buy(100);
            HP.sell("BTCUSDT", 50.0);
            HP.sell(#{ pct: 100 });
        "#;
        let (result, ledger) = run(source, &[50.0]).await;
        result.unwrap();

        let positions = ledger.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn context_is_visible_and_logs_flow() {
        let source = r#"
            HP.log("info", "seen " + context.symbol, #{ exchange: context.exchange });
        "#;
        let (result, ledger) = run(source, &[50.0]).await;
        result.unwrap();

        let logs = ledger.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "seen BTCUSDT");
        assert_eq!(logs[0].meta["exchange"], "binance");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thrown_errors_become_sandbox_errors() {
        let (result, _) = run(r#"throw "boom";"#, &[50.0]).await;
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runaway_scripts_hit_the_wall_clock() {
        let (_, indicators, broker) = harness(&[50.0]);
        let result = execute(
            "let x = 0; loop { x += 1; }".to_string(),
            indicators,
            broker,
            Duration::from_millis(200),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("budget"), "got: {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eval_is_disabled() {
        let (result, _) = run(r#"eval("1 + 1");"#, &[50.0]).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn import_is_disabled() {
        let (result, _) = run(r#"import "/etc/passwd" as x;"#, &[50.0]).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tuple_indicators_come_back_as_maps() {
        let source = r#"
            let m = MACD(#{ tf: "1m", fast: 3, slow: 6, signal: 3 });
            let b = BBANDS(#{ tf: "1m", length: 5, mult: 2.0 });
            if m.histogram >= 0.0 && b.upper >= b.lower {
                HP.log("info", "bands ok");
            }
        "#;
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let (result, ledger) = run(source, &closes).await;
        result.unwrap();
        assert_eq!(ledger.logs().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn breakout_matches_engine_semantics() {
        let source = r#"
            if BREAKOUT_UP(#{ tf: "1m", lookback: 3 }) {
                HP.buy(#{ usd: 10.0 });
            }
            if BREAKOUT_UP(#{ tf: "1m", lookback: 3, level: 14.0 }) {
                HP.sell(#{ pct: 100.0 });
            }
        "#;
        let (result, ledger) = run(source, &[10.0, 12.0, 11.0, 13.0]).await;
        result.unwrap();
        let positions = ledger.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Open);
    }
}
