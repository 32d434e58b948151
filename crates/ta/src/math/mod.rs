//! Pure numeric kernel. Every function here is stateless, takes finite or
//! non-finite f64 input, and marks "not yet defined" positions with NaN
//! rather than erroring. Degenerate input is never a failure.

pub mod atr;
pub mod bollinger;
pub mod cross;
pub mod ma;
pub mod macd;
pub mod rsi;

pub use atr::atr;
pub use bollinger::{bollinger, Bands};
pub use cross::{cross_down, cross_up};
pub use ma::{ema, sma, wma};
pub use macd::{macd, macd_lines, MacdPoint};
pub use rsi::rsi;

/// Scan from the tail for the last finite value.
pub fn last_finite(values: &[f64]) -> f64 {
    values
        .iter()
        .rev()
        .copied()
        .find(|v| v.is_finite())
        .unwrap_or(f64::NAN)
}
