use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use common::{Candle, Error, Interval, Result};

const BASE_URL: &str = "https://api.binance.com";

/// Hard upper bound the venue imposes on one klines page.
pub const MAX_KLINES_LIMIT: usize = 1000;

/// How much of an error body to carry into the error message.
const BODY_SNIPPET_LEN: usize = 300;

/// One candle-fetch request. `start_time` is an inclusive lower bound on
/// open time.
#[derive(Debug, Clone)]
pub struct FetchReq {
    pub symbol: String,
    pub interval: Interval,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

/// Upstream candle feed. The kline manager only ever talks to this trait,
/// so tests can substitute a scripted feed.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch candles ascending by open time.
    async fn fetch_candles(&self, req: &FetchReq) -> Result<Vec<Candle>>;
}

/// REST client for the Binance-compatible klines endpoint.
pub struct BinanceVenue {
    exchange: String,
    http: Client,
    base_url: String,
}

impl BinanceVenue {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self::with_base_url(exchange, BASE_URL)
    }

    pub fn with_base_url(exchange: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            http: Client::builder()
                .use_rustls_tls()
                .user_agent("stratbot/0.1")
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CandleSource for BinanceVenue {
    async fn fetch_candles(&self, req: &FetchReq) -> Result<Vec<Candle>> {
        let limit = req.limit.unwrap_or(MAX_KLINES_LIMIT).clamp(1, MAX_KLINES_LIMIT);
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, req.symbol, req.interval, limit
        );
        if let Some(start) = req.start_time {
            url.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = req.end_time {
            url.push_str(&format!("&endTime={end}"));
        }

        debug!(symbol = %req.symbol, interval = %req.interval, "Fetching klines");
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
            return Err(Error::Exchange(format!("HTTP {status}: {snippet}")));
        }

        let rows: Vec<Value> = serde_json::from_str(&body)?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(fields) = row.as_array() else { continue };
            if fields.len() < 7 {
                continue;
            }
            candles.push(Candle {
                exchange: self.exchange.clone(),
                symbol: req.symbol.clone(),
                interval: req.interval,
                open_time: as_i64(&fields[0]),
                open: as_f64(&fields[1]),
                high: as_f64(&fields[2]),
                low: as_f64(&fields[3]),
                close: as_f64(&fields[4]),
                volume: as_f64(&fields[5]),
                close_time: as_i64(&fields[6]),
            });
        }
        Ok(candles)
    }
}

/// The venue sends prices as strings and times as numbers; parse either,
/// and collapse anything non-finite to 0.
fn as_f64(v: &Value) -> f64 {
    let parsed = match v {
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };
    if parsed.is_finite() {
        parsed
    } else {
        0.0
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_parse_defensively() {
        assert_eq!(as_f64(&Value::String("42.5".into())), 42.5);
        assert_eq!(as_f64(&Value::String("NaN".into())), 0.0);
        assert_eq!(as_f64(&Value::String("garbage".into())), 0.0);
        assert_eq!(as_f64(&Value::Null), 0.0);
        assert_eq!(as_i64(&serde_json::json!(1_625_000_000_000_i64)), 1_625_000_000_000);
        assert_eq!(as_i64(&Value::String("17".into())), 17);
    }
}
