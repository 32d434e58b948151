/// Average true range with Wilder smoothing, evaluated at the last index.
///
/// True range at index `i >= 1` is
/// `max(high - low, |high - prev_close|, |low - prev_close|)`.
/// Seeded with the mean of the first `n` true ranges. Returns NaN with
/// fewer than `n + 1` bars.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], n: usize) -> f64 {
    let n = n.max(1);
    let len = highs.len().min(lows.len()).min(closes.len());
    if len < n + 1 {
        return f64::NAN;
    }

    let tr = |i: usize| -> f64 {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        hl.max(hc).max(lc)
    };

    let mut atr = (1..=n).map(tr).sum::<f64>() / n as f64;
    for i in (n + 1)..len {
        atr = (atr * (n - 1) as f64 + tr(i)) / n as f64;
    }
    atr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let h = [2.0, 3.0, 4.0];
        let l = [1.0, 2.0, 3.0];
        let c = [1.5, 2.5, 3.5];
        assert!(atr(&h, &l, &c, 3).is_nan());
        assert!(!atr(&h, &l, &c, 2).is_nan());
    }

    #[test]
    fn atr_constant_range_equals_range() {
        // Every bar spans exactly 1.0 and closes mid-bar, so TR is
        // max(1.0, 0.5, 0.5) = 1.0 throughout.
        let h = [2.0, 2.0, 2.0, 2.0, 2.0];
        let l = [1.0, 1.0, 1.0, 1.0, 1.0];
        let c = [1.5, 1.5, 1.5, 1.5, 1.5];
        let v = atr(&h, &l, &c, 3);
        assert!((v - 1.0).abs() < 1e-9, "expected 1.0, got {v}");
    }

    #[test]
    fn atr_gap_up_counts_distance_from_prev_close() {
        // Second bar gaps well above the first close; TR must use
        // |high - prev_close|, not just high - low.
        let h = [2.0, 12.0];
        let l = [1.0, 11.0];
        let c = [1.5, 11.5];
        let v = atr(&h, &l, &c, 1);
        assert!((v - 10.5).abs() < 1e-9, "expected 10.5, got {v}");
    }
}
