use super::ma::sma;

/// Latest Bollinger band triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Bands {
    pub const NAN: Bands = Bands {
        upper: f64::NAN,
        middle: f64::NAN,
        lower: f64::NAN,
    };
}

/// Bollinger bands over the trailing `length` values, evaluated at the
/// last index. Uses population standard deviation (divisor = length, not
/// length - 1) — callers depend on this exact convention. All-NaN when
/// `len < length`.
pub fn bollinger(values: &[f64], length: usize, mult: f64) -> Bands {
    let length = length.max(1);
    if values.len() < length {
        return Bands::NAN;
    }

    let middle = sma(values, length)[values.len() - 1];
    let window = &values[values.len() - length..];
    let mean = window.iter().sum::<f64>() / length as f64;
    let variance = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / length as f64;
    let sd = variance.sqrt();

    Bands {
        upper: middle + mult * sd,
        middle,
        lower: middle - mult * sd,
    }
}
