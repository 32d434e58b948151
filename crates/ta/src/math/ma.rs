/// Simple moving average over a trailing window of `n` values.
///
/// Returns an array the same length as the input, NaN for indices before
/// the window is full. Computed with a rolling sum.
pub fn sma(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let mut out = vec![f64::NAN; values.len()];
    let mut sum = 0.0;

    for (i, &v) in values.iter().enumerate() {
        sum += v;
        if i >= n {
            sum -= values[i - n];
        }
        if i + 1 >= n {
            out[i] = sum / n as f64;
        }
    }
    out
}

/// Exponential moving average, seeded with the SMA of the first `n` values
/// at index `n-1`, then `EMA[i] = (v - EMA[i-1]) * k + EMA[i-1]` with
/// `k = 2/(n+1)`.
///
/// Non-finite inputs are skipped: the previous EMA carries forward
/// unchanged, and only if it is itself defined. Indices before the seed
/// are NaN.
pub fn ema(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if len < n {
        return out;
    }

    let k = 2.0 / (n as f64 + 1.0);
    let seed = values[..n].iter().sum::<f64>() / n as f64;
    out[n - 1] = seed;

    let mut prev = seed;
    for i in n..len {
        let v = values[i];
        if v.is_finite() && prev.is_finite() {
            prev = (v - prev) * k + prev;
        }
        out[i] = prev;
    }
    out
}

/// Linearly weighted moving average with weights 1..n, newest value
/// weighted heaviest. NaN before the window fills, and NaN whenever any
/// value inside the window is non-finite.
pub fn wma(values: &[f64], n: usize) -> Vec<f64> {
    let n = n.max(1);
    let mut out = vec![f64::NAN; values.len()];
    let denom = (n * (n + 1)) as f64 / 2.0;

    for i in (n - 1)..values.len() {
        let window = &values[i + 1 - n..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let num: f64 = window
            .iter()
            .enumerate()
            .map(|(j, &v)| (j + 1) as f64 * v)
            .sum();
        out[i] = num / denom;
    }
    out
}
