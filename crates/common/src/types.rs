use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One OHLCV candle for a single symbol and interval.
///
/// Times are millisecond epochs as delivered by the venue. The primary key
/// in durable storage is (exchange, symbol, interval, open_time), so
/// re-delivering the same candle is always safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Candle interval. Closed set — the venue rejects anything else, and the
/// series cache keys on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum Interval {
    #[serde(rename = "1m")]
    #[sqlx(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    #[sqlx(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    #[sqlx(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    #[sqlx(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    #[sqlx(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    #[sqlx(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    #[sqlx(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    #[sqlx(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    #[sqlx(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    #[sqlx(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    #[sqlx(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    #[sqlx(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
        }
    }

    /// Fixed bar duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Interval::M1 => MINUTE,
            Interval::M3 => 3 * MINUTE,
            Interval::M5 => 5 * MINUTE,
            Interval::M15 => 15 * MINUTE,
            Interval::M30 => 30 * MINUTE,
            Interval::H1 => 60 * MINUTE,
            Interval::H2 => 120 * MINUTE,
            Interval::H4 => 240 * MINUTE,
            Interval::H6 => 360 * MINUTE,
            Interval::H8 => 480 * MINUTE,
            Interval::H12 => 720 * MINUTE,
            Interval::D1 => 1440 * MINUTE,
        }
    }

    pub fn parse(s: &str) -> Option<Interval> {
        Interval::ALL.iter().copied().find(|iv| iv.as_str() == s)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Interval {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s).ok_or_else(|| crate::Error::Config(format!("unknown interval '{s}'")))
    }
}

/// Side of a position. The paper broker only ever opens longs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A paper position recorded in the ledger. At most one `open` row exists
/// per (project, symbol) — enforced by a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
}

/// Terminal and non-terminal states of one strategy invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Severity of a strategy log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lenient parse used at the sandbox boundary; anything unknown is info.
    pub fn parse(s: &str) -> LogLevel {
        match s.to_ascii_lowercase().as_str() {
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Descriptor handed to a runner by the atomic claim RPC. Claiming marks
/// the project so no other runner picks it up for this cycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectClaim {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub generated_js: String,
    pub interval_seconds: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_roundtrips_through_str() {
        for iv in Interval::ALL {
            assert_eq!(Interval::parse(iv.as_str()), Some(iv));
        }
        assert_eq!(Interval::parse("7m"), None);
    }

    #[test]
    fn interval_durations_are_strictly_increasing() {
        let mut prev = 0;
        for iv in Interval::ALL {
            assert!(iv.duration_ms() > prev, "{iv} not increasing");
            prev = iv.duration_ms();
        }
        assert_eq!(Interval::M1.duration_ms(), 60_000);
        assert_eq!(Interval::D1.duration_ms(), 86_400_000);
    }

    #[test]
    fn log_level_parse_is_lenient() {
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Info);
    }
}
