//! Bar-by-bar backtesting engine

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::EvaluationError;
use crate::indicators::{AtrTracker, SignalGenerator};
use crate::strategy::Signal;
use crate::types::*;

/// Account and sizing settings for a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    /// Position size as percentage of equity (e.g., 10.0 = 10%)
    pub position_size_pct: Decimal,
    /// Taker fee charged on entry and exit notional, in percent
    pub fee_pct: Decimal,
    /// Size positions by ATR risk and place an ATR stop
    pub atr_risk_sizing: bool,
    pub atr_period: usize,
    /// Stop distance in ATRs
    pub atr_multiplier: Decimal,
    /// Equity risked per trade when ATR sizing is on, in percent
    pub risk_per_trade_pct: Decimal,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(10000),
            position_size_pct: Decimal::from(10),
            fee_pct: dec!(0.1),
            atr_risk_sizing: false,
            atr_period: 14,
            atr_multiplier: dec!(2),
            risk_per_trade_pct: Decimal::ONE,
        }
    }
}

/// Position state during simulation
struct OpenPosition {
    entry_time: i64,
    entry_price: Decimal,
    size: Decimal,
    stop: Option<Decimal>,
}

/// Backtesting engine that simulates long-only bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest of `generator` over `klines`
    pub fn run(
        config: &BacktestConfig,
        generator: &mut dyn SignalGenerator,
        klines: &[Kline],
    ) -> Result<BacktestResult, EvaluationError> {
        let mut atr = if config.atr_risk_sizing {
            Some(AtrTracker::new(config.atr_period)?)
        } else {
            None
        };

        let mut equity = config.initial_capital;
        let mut peak_equity = equity;
        let mut max_drawdown = Decimal::ZERO;
        let mut max_drawdown_pct = Decimal::ZERO;

        let mut trades: Vec<BacktestTrade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(klines.len());
        let mut position: Option<OpenPosition> = None;

        let hundred = dec!(100);
        let fee_rate = config.fee_pct / hundred;

        for kline in klines {
            let current_atr = atr.as_mut().and_then(|a| a.update(kline));

            // Stops trigger intrabar, before the close-based signal
            let stopped = position
                .as_ref()
                .and_then(|p| p.stop)
                .is_some_and(|stop| kline.low <= stop);
            if stopped {
                if let Some(pos) = position.take() {
                    let exit_price = pos.stop.unwrap_or(kline.close).min(kline.open);
                    let trade = close_position(pos, kline.open_time, exit_price, fee_rate, ExitReason::StopLoss);
                    equity += trade.pnl + trade.size * trade.entry_price * fee_rate;
                    trace!(exit = %exit_price, pnl = %trade.pnl, "Stop hit");
                    trades.push(trade);
                }
            }

            match generator.on_bar(kline) {
                Signal::Buy if position.is_none() && kline.close > Decimal::ZERO => {
                    let (size, stop) = Self::size_position(config, equity, kline.close, current_atr);
                    if size > Decimal::ZERO {
                        equity -= size * kline.close * fee_rate;
                        position = Some(OpenPosition {
                            entry_time: kline.open_time,
                            entry_price: kline.close,
                            size,
                            stop,
                        });
                        trace!(price = %kline.close, size = %size, "Opened LONG position");
                    }
                }
                Signal::Sell => {
                    if let Some(pos) = position.take() {
                        let trade = close_position(pos, kline.open_time, kline.close, fee_rate, ExitReason::Signal);
                        // Entry fee was already taken out of equity
                        equity += trade.pnl + trade.size * trade.entry_price * fee_rate;
                        trades.push(trade);
                    }
                }
                _ => {}
            }

            // Track equity curve
            let unrealized = position
                .as_ref()
                .map(|p| (kline.close - p.entry_price) * p.size)
                .unwrap_or(Decimal::ZERO);
            let current_equity = equity + unrealized;

            equity_curve.push(EquityPoint {
                time: kline.open_time,
                equity: current_equity,
            });

            if current_equity > peak_equity {
                peak_equity = current_equity;
            }
            let drawdown = peak_equity - current_equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                if peak_equity > Decimal::ZERO {
                    max_drawdown_pct = drawdown / peak_equity * hundred;
                }
            }
        }

        // Close any remaining open position at last bar
        if let Some(pos) = position.take() {
            if let Some(last) = klines.last() {
                let trade = close_position(pos, last.open_time, last.close, fee_rate, ExitReason::EndOfData);
                equity += trade.pnl + trade.size * trade.entry_price * fee_rate;
                trades.push(trade);
            }
        }

        Ok(Self::summarize(config, klines, equity, max_drawdown, max_drawdown_pct, trades, equity_curve))
    }

    /// Units to buy and optional stop price
    fn size_position(
        config: &BacktestConfig,
        equity: Decimal,
        price: Decimal,
        atr: Option<f64>,
    ) -> (Decimal, Option<Decimal>) {
        let hundred = dec!(100);
        let fixed = equity * config.position_size_pct / hundred / price;

        let Some(atr) = atr.and_then(Decimal::from_f64) else {
            return (fixed, None);
        };
        let stop_distance = atr * config.atr_multiplier;
        if stop_distance <= Decimal::ZERO {
            return (fixed, None);
        }

        let risk_amount = equity * config.risk_per_trade_pct / hundred;
        // No leverage: never buy more than equity allows
        let size = (risk_amount / stop_distance).min(equity / price);
        (size, Some(price - stop_distance))
    }

    fn summarize(
        config: &BacktestConfig,
        klines: &[Kline],
        equity: Decimal,
        max_drawdown: Decimal,
        max_drawdown_pct: Decimal,
        trades: Vec<BacktestTrade>,
        equity_curve: Vec<EquityPoint>,
    ) -> BacktestResult {
        let hundred = dec!(100);

        let total_trades = trades.len() as u32;
        let winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count() as u32;
        let losing_trades = total_trades - winning_trades;

        let win_rate = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let total_pnl = equity - config.initial_capital;
        let total_pnl_pct = if config.initial_capital > Decimal::ZERO {
            total_pnl / config.initial_capital * hundred
        } else {
            Decimal::ZERO
        };

        // Profit factor = gross profits / gross losses
        let gross_profits: Decimal = trades
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .sum();
        let gross_losses: Decimal = trades
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl.abs())
            .sum();
        let profit_factor = if gross_losses > Decimal::ZERO {
            gross_profits / gross_losses
        } else if gross_profits > Decimal::ZERO {
            dec!(999.99) // Infinite profit factor capped
        } else {
            Decimal::ZERO
        };

        let sharpe_ratio = Self::calculate_sharpe(&trades);

        BacktestResult {
            start_time: klines.first().map(|k| k.open_time).unwrap_or(0),
            end_time: klines.last().map(|k| k.close_time).unwrap_or(0),
            initial_capital: config.initial_capital,
            final_equity: equity,
            total_pnl,
            total_pnl_pct,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio,
            profit_factor,
            trades,
            equity_curve,
        }
    }

    /// Per-trade Sharpe ratio: mean return / std dev of returns
    fn calculate_sharpe(trades: &[BacktestTrade]) -> Decimal {
        if trades.len() < 2 {
            return Decimal::ZERO;
        }

        let returns: Vec<f64> = trades
            .iter()
            .map(|t| t.pnl_pct.to_f64().unwrap_or(0.0))
            .collect();

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;

        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        if std_dev < 1e-10 {
            return Decimal::ZERO;
        }

        Decimal::from_f64(mean / std_dev)
            .map(|s| s.round_dp(4))
            .unwrap_or(Decimal::ZERO)
    }
}

/// Realize a long position; pnl is net of both entry and exit fees
fn close_position(
    pos: OpenPosition,
    exit_time: i64,
    exit_price: Decimal,
    fee_rate: Decimal,
    exit_reason: ExitReason,
) -> BacktestTrade {
    let hundred = dec!(100);
    let fees = (pos.entry_price + exit_price) * pos.size * fee_rate;
    let pnl = (exit_price - pos.entry_price) * pos.size - fees;
    let pnl_pct = if pos.entry_price > Decimal::ZERO {
        pnl / (pos.entry_price * pos.size) * hundred
    } else {
        Decimal::ZERO
    };

    BacktestTrade {
        entry_time: pos.entry_time,
        exit_time,
        side: TradeSide::Buy,
        entry_price: pos.entry_price,
        exit_price,
        size: pos.size,
        pnl,
        pnl_pct,
        exit_reason,
    }
}
