//! Signal generators and the ATR tracker used for risk sizing
//!
//! Each generator processes klines bar-by-bar and emits Buy/Sell/Hold.
//! Indicator math comes from the `ta` crate.

use ta::indicators::{AverageTrueRange, ExponentialMovingAverage, RelativeStrengthIndex};
use ta::{DataItem, Next, Reset};

use crate::error::EvaluationError;
use crate::strategy::Signal;
use crate::types::Kline;

// ============================================================================
// Core trait
// ============================================================================

/// Trait for bar-by-bar signal generation
pub trait SignalGenerator: Send {
    fn name(&self) -> &str;
    fn on_bar(&mut self, kline: &Kline) -> Signal;
    fn reset(&mut self);
    /// Bars consumed before the first signal can fire
    fn warmup_bars(&self) -> usize;
}

fn invalid(what: &str, err: ta::errors::TaError) -> EvaluationError {
    EvaluationError::InvalidParameters(format!("{what}: {err:?}"))
}

// ============================================================================
// 1. RSI Signal Generator
// ============================================================================

pub struct RsiSignalGenerator {
    rsi: RelativeStrengthIndex,
    overbought: f64,
    oversold: f64,
    period: usize,
    bars_seen: usize,
}

impl RsiSignalGenerator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Result<Self, EvaluationError> {
        if oversold >= overbought {
            return Err(EvaluationError::InvalidParameters(format!(
                "oversold {oversold} must be below overbought {overbought}"
            )));
        }
        Ok(Self {
            rsi: RelativeStrengthIndex::new(period).map_err(|e| invalid("RSI period", e))?,
            overbought,
            oversold,
            period,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for RsiSignalGenerator {
    fn name(&self) -> &str {
        "RSI"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let val = self.rsi.next(kline.close_f64());
        self.bars_seen += 1;
        if self.bars_seen <= self.period {
            return Signal::Hold;
        }

        if val < self.oversold {
            Signal::Buy
        } else if val > self.overbought {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.rsi.reset();
        self.bars_seen = 0;
    }

    fn warmup_bars(&self) -> usize {
        self.period
    }
}

// ============================================================================
// 2. EMA Crossover Signal Generator
// ============================================================================

pub struct EmaCrossoverSignalGenerator {
    ema_fast: ExponentialMovingAverage,
    ema_slow: ExponentialMovingAverage,
    slow_period: usize,
    prev_fast: f64,
    prev_slow: f64,
    bars_seen: usize,
}

impl EmaCrossoverSignalGenerator {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self, EvaluationError> {
        if fast_period >= slow_period {
            return Err(EvaluationError::InvalidParameters(format!(
                "fast period {fast_period} must be shorter than slow period {slow_period}"
            )));
        }
        Ok(Self {
            ema_fast: ExponentialMovingAverage::new(fast_period)
                .map_err(|e| invalid("fast EMA period", e))?,
            ema_slow: ExponentialMovingAverage::new(slow_period)
                .map_err(|e| invalid("slow EMA period", e))?,
            slow_period,
            prev_fast: 0.0,
            prev_slow: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for EmaCrossoverSignalGenerator {
    fn name(&self) -> &str {
        "EMACrossover"
    }

    fn on_bar(&mut self, kline: &Kline) -> Signal {
        let close = kline.close_f64();
        let fast_val = self.ema_fast.next(close);
        let slow_val = self.ema_slow.next(close);
        self.bars_seen += 1;

        let result = if self.bars_seen > self.slow_period {
            if self.prev_fast <= self.prev_slow && fast_val > slow_val {
                // Golden cross
                Signal::Buy
            } else if self.prev_fast >= self.prev_slow && fast_val < slow_val {
                // Death cross
                Signal::Sell
            } else {
                Signal::Hold
            }
        } else {
            Signal::Hold
        };

        self.prev_fast = fast_val;
        self.prev_slow = slow_val;
        result
    }

    fn reset(&mut self) {
        self.ema_fast.reset();
        self.ema_slow.reset();
        self.prev_fast = 0.0;
        self.prev_slow = 0.0;
        self.bars_seen = 0;
    }

    fn warmup_bars(&self) -> usize {
        self.slow_period
    }
}

// ============================================================================
// ATR tracker (risk sizing and stops)
// ============================================================================

/// Rolling average true range; `None` until `period` bars have been seen
pub struct AtrTracker {
    atr: AverageTrueRange,
    period: usize,
    bars_seen: usize,
    last: f64,
}

impl AtrTracker {
    pub fn new(period: usize) -> Result<Self, EvaluationError> {
        Ok(Self {
            atr: AverageTrueRange::new(period).map_err(|e| invalid("ATR period", e))?,
            period,
            bars_seen: 0,
            last: 0.0,
        })
    }

    pub fn update(&mut self, kline: &Kline) -> Option<f64> {
        let close = kline.close_f64();
        let high = kline.high_f64().max(close);
        let low = kline.low_f64().min(close);

        // DataItem rejects inconsistent bars; those are skipped
        let bar = DataItem::builder()
            .open(close)
            .high(high)
            .low(low)
            .close(close)
            .volume(0.0)
            .build();
        if let Ok(bar) = bar {
            self.last = self.atr.next(&bar);
            self.bars_seen += 1;
        }

        self.current()
    }

    pub fn current(&self) -> Option<f64> {
        (self.bars_seen >= self.period && self.last > 0.0).then_some(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::klines_from_closes;

    fn run(gen: &mut dyn SignalGenerator, closes: &[f64]) -> (bool, bool) {
        let mut had_buy = false;
        let mut had_sell = false;
        for kline in &klines_from_closes(closes) {
            match gen.on_bar(kline) {
                Signal::Buy => had_buy = true,
                Signal::Sell => had_sell = true,
                Signal::Hold => {}
            }
        }
        (had_buy, had_sell)
    }

    #[test]
    fn test_rsi_generator_produces_signals() {
        let mut gen = RsiSignalGenerator::new(14, 70.0, 30.0).unwrap();
        assert_eq!(gen.name(), "RSI");

        let mut prices = Vec::new();
        for i in 0..20 {
            prices.push(100.0 - (i as f64) * 3.0);
        }
        for i in 0..20 {
            prices.push(40.0 + (i as f64) * 4.0);
        }

        let (had_buy, had_sell) = run(&mut gen, &prices);
        assert!(had_buy, "RSI should have generated a buy signal");
        assert!(had_sell, "RSI should have generated a sell signal");
    }

    #[test]
    fn test_rsi_rejects_inverted_thresholds() {
        assert!(RsiSignalGenerator::new(14, 30.0, 70.0).is_err());
        assert!(RsiSignalGenerator::new(0, 70.0, 30.0).is_err());
    }

    #[test]
    fn test_ema_crossover_detects_both_crosses() {
        let mut gen = EmaCrossoverSignalGenerator::new(3, 8).unwrap();
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        prices.extend((0..20).map(|i| 80.0 + 2.0 * i as f64));
        prices.extend((0..20).map(|i| 120.0 - 2.0 * i as f64));

        let (had_buy, had_sell) = run(&mut gen, &prices);
        assert!(had_buy);
        assert!(had_sell);
    }

    #[test]
    fn test_ema_reset_replays_identically() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + ((i as f64) * 0.7).sin() * 10.0).collect();
        let klines = klines_from_closes(&prices);
        let mut gen = EmaCrossoverSignalGenerator::new(3, 9).unwrap();
        let first: Vec<Signal> = klines.iter().map(|k| gen.on_bar(k)).collect();
        gen.reset();
        let second: Vec<Signal> = klines.iter().map(|k| gen.on_bar(k)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ema_rejects_fast_not_below_slow() {
        assert!(EmaCrossoverSignalGenerator::new(20, 20).is_err());
        assert!(EmaCrossoverSignalGenerator::new(30, 20).is_err());
    }

    #[test]
    fn test_atr_tracker_warms_up() {
        let mut atr = AtrTracker::new(5).unwrap();
        let klines = klines_from_closes(&[100.0; 10]);
        for k in &klines[..4] {
            assert!(atr.update(k).is_none());
        }
        let value = atr.update(&klines[4]).unwrap();
        // Fixture bars span +/-1 around the close
        assert!(value > 0.0 && value <= 2.0 + 1e-9);
    }
}
