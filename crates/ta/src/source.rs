use marketdata::Series;

/// Which derived price series feeds an indicator.
///
/// Strategy code names these as strings; anything unrecognized falls back
/// to `Close` rather than failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Close,
    Open,
    High,
    Low,
    Volume,
    /// (high + low) / 2
    Hl2,
    /// (high + low + close) / 3, also known as "Typical Price"
    Hlc3,
    /// (open + high + low + close) / 4
    Ohlc4,
}

impl Source {
    /// Lenient lookup. Returns `None` for names outside the closed set so
    /// the caller can log the fallback.
    pub fn lookup(name: &str) -> Option<Source> {
        let normalized = name.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "close" => Some(Source::Close),
            "open" => Some(Source::Open),
            "high" => Some(Source::High),
            "low" => Some(Source::Low),
            "volume" => Some(Source::Volume),
            "hl2" => Some(Source::Hl2),
            "hlc3" | "typical price" | "typicalprice" => Some(Source::Hlc3),
            "ohlc4" => Some(Source::Ohlc4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Close => "Close",
            Source::Open => "Open",
            Source::High => "High",
            Source::Low => "Low",
            Source::Volume => "Volume",
            Source::Hl2 => "HL2",
            Source::Hlc3 => "HLC3",
            Source::Ohlc4 => "OHLC4",
        }
    }

    /// Materialize the derived series from a cached series.
    pub fn derive(&self, series: &Series) -> Vec<f64> {
        match self {
            Source::Close => series.closes.clone(),
            Source::Open => series.opens.clone(),
            Source::High => series.highs.clone(),
            Source::Low => series.lows.clone(),
            Source::Volume => series.volumes.clone(),
            Source::Hl2 => series
                .highs
                .iter()
                .zip(&series.lows)
                .map(|(h, l)| (h + l) / 2.0)
                .collect(),
            Source::Hlc3 => series
                .highs
                .iter()
                .zip(&series.lows)
                .zip(&series.closes)
                .map(|((h, l), c)| (h + l + c) / 3.0)
                .collect(),
            Source::Ohlc4 => series
                .opens
                .iter()
                .zip(&series.highs)
                .zip(&series.lows)
                .zip(&series.closes)
                .map(|(((o, h), l), c)| (o + h + l + c) / 4.0)
                .collect(),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> Series {
        Series {
            open_times: vec![0, 60_000],
            opens: vec![1.0, 2.0],
            highs: vec![4.0, 6.0],
            lows: vec![2.0, 2.0],
            closes: vec![3.0, 4.0],
            volumes: vec![10.0, 20.0],
        }
    }

    #[test]
    fn lookup_is_case_insensitive_with_aliases() {
        assert_eq!(Source::lookup("close"), Some(Source::Close));
        assert_eq!(Source::lookup("HLC3"), Some(Source::Hlc3));
        assert_eq!(Source::lookup("Typical Price"), Some(Source::Hlc3));
        assert_eq!(Source::lookup("bogus"), None);
    }

    #[test]
    fn derived_series_combine_components() {
        let s = series();
        assert_eq!(Source::Hl2.derive(&s), vec![3.0, 4.0]);
        assert_eq!(Source::Hlc3.derive(&s), vec![3.0, 4.0]);
        assert_eq!(Source::Ohlc4.derive(&s), vec![2.5, 4.0]);
        assert_eq!(Source::Volume.derive(&s), vec![10.0, 20.0]);
    }
}
