use super::ma::ema;
use super::last_finite;

/// Latest MACD triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl MacdPoint {
    pub const NAN: MacdPoint = MacdPoint {
        macd: f64::NAN,
        signal: f64::NAN,
        histogram: f64::NAN,
    };
}

/// Full MACD line and signal line, both aligned to the input length.
///
/// The MACD line is `EMA(values, fast) - EMA(values, slow)` and is NaN
/// wherever either EMA is undefined. The signal line is the EMA of the
/// finite tail of the MACD line, NaN-padded back to full length.
pub fn macd_lines(values: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>) {
    let fast = fast.max(1);
    let slow = slow.max(1);
    let signal = signal.max(1);
    let len = values.len();

    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);
    let macd_line: Vec<f64> = (0..len).map(|i| ema_fast[i] - ema_slow[i]).collect();

    let mut signal_line = vec![f64::NAN; len];
    if let Some(first) = macd_line.iter().position(|v| v.is_finite()) {
        let tail = ema(&macd_line[first..], signal);
        signal_line[first..].copy_from_slice(&tail);
    }

    (macd_line, signal_line)
}

/// Latest MACD value. All-NaN when `len < max(fast, slow) + signal`.
///
/// The macd and signal scalars are independently the last finite value of
/// their own series, so they can come from different indices while the
/// signal is still warming up.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> MacdPoint {
    let fast = fast.max(1);
    let slow = slow.max(1);
    let signal = signal.max(1);
    if values.len() < fast.max(slow) + signal {
        return MacdPoint::NAN;
    }

    let (macd_line, signal_line) = macd_lines(values, fast, slow, signal);
    let m = last_finite(&macd_line);
    let s = last_finite(&signal_line);
    MacdPoint {
        macd: m,
        signal: s,
        histogram: m - s,
    }
}
