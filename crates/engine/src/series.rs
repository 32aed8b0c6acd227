//! Validated price series
//!
//! A `PriceSeries` owns klines whose open times are strictly increasing and
//! whose spacing never exceeds the bar interval times a gap tolerance.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::OptimizerError;
use crate::types::Kline;

/// Timeframe constraints checked when a series is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Bar interval (Binance notation: "1m", "15m", "1h", "1d", ...)
    pub interval: String,
    /// Largest allowed spacing between bars, in multiples of the interval.
    /// `None` disables the gap check.
    pub gap_tolerance: Option<f64>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            interval: "1d".to_string(),
            gap_tolerance: Some(1.5),
        }
    }
}

/// Parse a Binance-style interval string into milliseconds.
pub fn interval_ms(interval: &str) -> Option<i64> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (count, unit) = interval.split_at(interval.len() - 1);
    let count: i64 = count.parse().ok().filter(|c| *c > 0)?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        // Month bars have no fixed length; 31 days is the widest
        "M" => 31 * 86_400_000,
        _ => return None,
    };
    Some(count * unit_ms)
}

/// Ordered OHLCV bars, validated on construction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSeries {
    interval: String,
    klines: Vec<Kline>,
}

impl PriceSeries {
    pub fn new(klines: Vec<Kline>, config: &SeriesConfig) -> Result<Self, OptimizerError> {
        if klines.is_empty() {
            return Err(OptimizerError::EmptySeries);
        }

        let max_gap_ms = match config.gap_tolerance {
            Some(tolerance) => {
                if !tolerance.is_finite() || tolerance < 1.0 {
                    return Err(OptimizerError::InvalidConfig(format!(
                        "gap_tolerance must be >= 1.0, got {tolerance}"
                    )));
                }
                let step = interval_ms(&config.interval).ok_or_else(|| {
                    OptimizerError::InvalidConfig(format!(
                        "unknown interval '{}'",
                        config.interval
                    ))
                })?;
                Some((step as f64 * tolerance).round() as i64)
            }
            None => None,
        };

        for (i, pair) in klines.windows(2).enumerate() {
            let (previous, current) = (pair[0].open_time, pair[1].open_time);
            if current <= previous {
                return Err(OptimizerError::UnorderedSeries {
                    index: i + 1,
                    previous,
                    current,
                });
            }
            if let Some(max_gap_ms) = max_gap_ms {
                let gap_ms = current - previous;
                if gap_ms > max_gap_ms {
                    return Err(OptimizerError::GapTooLarge {
                        index: i + 1,
                        gap_ms,
                        max_gap_ms,
                    });
                }
            }
        }

        Ok(Self {
            interval: config.interval.clone(),
            klines,
        })
    }

    /// Sort by open time and drop duplicate bars before validating.
    /// Paginated API fetches can return an overlapping bar at page edges.
    pub fn normalized(mut klines: Vec<Kline>, config: &SeriesConfig) -> Result<Self, OptimizerError> {
        klines.sort_by_key(|k| k.open_time);
        klines.dedup_by_key(|k| k.open_time);
        Self::new(klines, config)
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn klines(&self) -> &[Kline] {
        &self.klines
    }

    pub fn len(&self) -> usize {
        self.klines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klines.is_empty()
    }

    /// Bars in an index range (as produced by the window splitter)
    pub fn slice(&self, range: Range<usize>) -> &[Kline] {
        &self.klines[range]
    }

    /// Open time of the first bar and close time of the last bar in a range
    pub fn time_span(&self, range: &Range<usize>) -> Option<(i64, i64)> {
        let first = self.klines.get(range.start)?;
        let last = self.klines.get(range.end.checked_sub(1)?)?;
        Some((first.open_time, last.close_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const DAY: i64 = 86_400_000;

    fn bar(open_time: i64) -> Kline {
        Kline {
            open_time,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            volume: dec!(10),
            close_time: open_time + DAY - 1,
        }
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(interval_ms("15m"), Some(15 * 60_000));
        assert_eq!(interval_ms("1h"), Some(3_600_000));
        assert_eq!(interval_ms("1d"), Some(DAY));
        assert_eq!(interval_ms("0d"), None);
        assert_eq!(interval_ms("d"), None);
        assert_eq!(interval_ms("5x"), None);
    }

    #[test]
    fn test_accepts_regular_series() {
        let klines: Vec<Kline> = (0..10).map(|i| bar(i * DAY)).collect();
        let series = PriceSeries::new(klines, &SeriesConfig::default()).unwrap();
        assert_eq!(series.len(), 10);
        assert_eq!(series.time_span(&(2..4)), Some((2 * DAY, 4 * DAY - 1)));
        assert_eq!(series.time_span(&(3..3)), None);
    }

    #[test]
    fn test_rejects_empty_series() {
        assert_eq!(
            PriceSeries::new(vec![], &SeriesConfig::default()),
            Err(OptimizerError::EmptySeries)
        );
    }

    #[test]
    fn test_rejects_duplicate_timestamps() {
        let klines = vec![bar(0), bar(DAY), bar(DAY)];
        let err = PriceSeries::new(klines, &SeriesConfig::default()).unwrap_err();
        assert_eq!(
            err,
            OptimizerError::UnorderedSeries {
                index: 2,
                previous: DAY,
                current: DAY
            }
        );
    }

    #[test]
    fn test_rejects_gap_beyond_tolerance() {
        let klines = vec![bar(0), bar(DAY), bar(4 * DAY)];
        let err = PriceSeries::new(klines.clone(), &SeriesConfig::default()).unwrap_err();
        assert!(matches!(err, OptimizerError::GapTooLarge { index: 2, .. }));

        let lenient = SeriesConfig {
            gap_tolerance: None,
            ..Default::default()
        };
        assert!(PriceSeries::new(klines, &lenient).is_ok());
    }

    #[test]
    fn test_normalized_sorts_and_dedups() {
        let klines = vec![bar(2 * DAY), bar(0), bar(DAY), bar(DAY)];
        let series = PriceSeries::normalized(klines, &SeriesConfig::default()).unwrap();
        let times: Vec<i64> = series.klines().iter().map(|k| k.open_time).collect();
        assert_eq!(times, vec![0, DAY, 2 * DAY]);
    }
}
