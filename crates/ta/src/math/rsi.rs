/// RSI with Wilder smoothing, evaluated at the last index only.
///
/// Matches TradingView / standard RSI: initial average gain/loss over the
/// first `n` diffs, then `avg = (avg*(n-1) + current)/n` for the rest.
/// Returns NaN with fewer than `n + 1` values; returns 100 when the
/// average loss is exactly zero (RS = +inf).
pub fn rsi(values: &[f64], n: usize) -> f64 {
    let n = n.max(1);
    if values.len() < n + 1 {
        return f64::NAN;
    }

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let mut avg_gain = diffs[..n].iter().filter(|&&d| d > 0.0).sum::<f64>() / n as f64;
    let mut avg_loss =
        diffs[..n].iter().filter(|&&d| d < 0.0).map(|d| d.abs()).sum::<f64>() / n as f64;

    for &d in &diffs[n..] {
        let gain = if d > 0.0 { d } else { 0.0 };
        let loss = if d < 0.0 { -d } else { 0.0 };
        avg_gain = (avg_gain * (n - 1) as f64 + gain) / n as f64;
        avg_loss = (avg_loss * (n - 1) as f64 + loss) / n as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
