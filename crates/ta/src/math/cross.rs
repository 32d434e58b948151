/// Last two indices, newest last, where both series are finite.
fn last_two_defined(a: &[f64], b: &[f64]) -> Option<(usize, usize)> {
    let len = a.len().min(b.len());
    let mut newest = None;
    for i in (0..len).rev() {
        if a[i].is_finite() && b[i].is_finite() {
            match newest {
                None => newest = Some(i),
                Some(curr) => return Some((i, curr)),
            }
        }
    }
    None
}

/// True iff `a` crossed above `b` between the last two indices where both
/// series are defined: `a_prev <= b_prev` and `a_curr > b_curr`. False
/// when fewer than two such pairs exist.
pub fn cross_up(a: &[f64], b: &[f64]) -> bool {
    match last_two_defined(a, b) {
        Some((prev, curr)) => a[prev] <= b[prev] && a[curr] > b[curr],
        None => false,
    }
}

/// True iff `a` crossed below `b`: `a_prev >= b_prev` and `a_curr < b_curr`.
pub fn cross_down(a: &[f64], b: &[f64]) -> bool {
    match last_two_defined(a, b) {
        Some((prev, curr)) => a[prev] >= b[prev] && a[curr] < b[curr],
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_up_detects_crossing() {
        let b = [1.5, 1.5, 1.5, 1.5];
        assert!(cross_up(&[1.0, 1.0, 1.0, 2.0], &b));
        assert!(!cross_up(&[1.0, 1.0, 2.0, 1.0], &b));
    }

    #[test]
    fn cross_up_false_when_already_above() {
        let b = [1.5, 1.5, 1.5];
        assert!(!cross_up(&[2.0, 2.0, 2.0], &b));
    }

    #[test]
    fn cross_down_mirrors_cross_up() {
        let b = [1.5, 1.5, 1.5, 1.5];
        assert!(cross_down(&[2.0, 2.0, 2.0, 1.0], &b));
        assert!(!cross_down(&[1.0, 1.0, 1.0, 2.0], &b));
    }

    #[test]
    fn cross_skips_nan_pairs() {
        // The NaN at the tail is ignored; the comparison uses the last two
        // indices where both sides are finite.
        let a = [1.0, 2.0, f64::NAN];
        let b = [1.5, 1.5, 1.5];
        assert!(cross_up(&a, &b));
    }

    #[test]
    fn cross_false_with_fewer_than_two_pairs() {
        assert!(!cross_up(&[2.0], &[1.0]));
        assert!(!cross_up(&[], &[]));
        assert!(!cross_up(&[f64::NAN, 2.0], &[1.0, 1.0]));
    }

    #[test]
    fn touch_then_break_counts_as_cross_up() {
        // Equality on the previous bar still satisfies a_prev <= b_prev.
        let a = [1.5, 2.0];
        let b = [1.5, 1.5];
        assert!(cross_up(&a, &b));
    }
}
