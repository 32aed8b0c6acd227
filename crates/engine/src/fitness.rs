//! Fitness functions
//!
//! The optimizer only sees `FitnessFunction`: a pure scoring of one parameter
//! vector against one slice of bars. `StrategyFitness` is the bundled
//! implementation that backtests a `StrategyKind` and reduces the result to
//! a scalar with a `FitnessMetric`.

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backtest::{BacktestConfig, BacktestEngine};
use crate::error::EvaluationError;
use crate::params::ParameterVector;
use crate::strategy::StrategyKind;
use crate::types::{BacktestResult, Kline};

/// Score assigned to an individual whose evaluation failed.
pub const WORST_FITNESS: f64 = f64::NEG_INFINITY;

/// Scores a parameter vector on a window of bars. Higher is better.
///
/// Implementations must be pure: read only `params` and `window`.
pub trait FitnessFunction: Send + Sync {
    fn evaluate(&self, params: &ParameterVector, window: &[Kline]) -> Result<f64, EvaluationError>;
}

impl<F> FitnessFunction for F
where
    F: Fn(&ParameterVector, &[Kline]) -> Result<f64, EvaluationError> + Send + Sync,
{
    fn evaluate(&self, params: &ParameterVector, window: &[Kline]) -> Result<f64, EvaluationError> {
        self(params, window)
    }
}

/// Evaluate and fold failures into `None`. Non-finite scores count as failures.
pub(crate) fn try_score(
    fitness: &dyn FitnessFunction,
    params: &ParameterVector,
    window: &[Kline],
) -> Option<f64> {
    match fitness.evaluate(params, window) {
        Ok(score) if score.is_finite() => Some(score),
        Ok(score) => {
            debug!(%params, score, "Non-finite fitness treated as failure");
            None
        }
        Err(e) => {
            debug!(%params, error = %e, "Fitness evaluation failed");
            None
        }
    }
}

// ============================================================================
// Strategy-backed fitness
// ============================================================================

/// How a backtest result collapses to one number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitnessMetric {
    /// Per-trade Sharpe ratio
    #[default]
    Sharpe,
    /// Total return in percent
    TotalReturn,
    /// Return % discounted by max drawdown %: r / (1 + dd)
    DrawdownAdjusted,
}

impl FitnessMetric {
    pub fn score(&self, result: &BacktestResult) -> f64 {
        let ret = result.total_pnl_pct.to_f64().unwrap_or(0.0);
        match self {
            FitnessMetric::Sharpe => result.sharpe_ratio.to_f64().unwrap_or(0.0),
            FitnessMetric::TotalReturn => ret,
            FitnessMetric::DrawdownAdjusted => {
                let dd = result.max_drawdown_pct.to_f64().unwrap_or(0.0).max(0.0);
                ret / (1.0 + dd)
            }
        }
    }
}

impl std::fmt::Display for FitnessMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitnessMetric::Sharpe => write!(f, "sharpe"),
            FitnessMetric::TotalReturn => write!(f, "total_return"),
            FitnessMetric::DrawdownAdjusted => write!(f, "drawdown_adjusted"),
        }
    }
}

impl std::str::FromStr for FitnessMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sharpe" => Ok(FitnessMetric::Sharpe),
            "total_return" | "return" => Ok(FitnessMetric::TotalReturn),
            "drawdown_adjusted" | "calmar" => Ok(FitnessMetric::DrawdownAdjusted),
            other => Err(format!("unknown fitness metric '{other}'")),
        }
    }
}

/// Backtests a strategy and scores it with a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyFitness {
    pub strategy: StrategyKind,
    pub metric: FitnessMetric,
    pub backtest: BacktestConfig,
    /// Windows with fewer trades score `few_trades_penalty`
    pub min_trades: u32,
    pub few_trades_penalty: f64,
}

impl StrategyFitness {
    pub fn new(strategy: StrategyKind, metric: FitnessMetric) -> Self {
        Self {
            strategy,
            metric,
            backtest: BacktestConfig::default(),
            min_trades: 3,
            few_trades_penalty: -100.0,
        }
    }

    pub fn with_backtest(mut self, backtest: BacktestConfig) -> Self {
        self.backtest = backtest;
        self
    }

    pub fn with_min_trades(mut self, min_trades: u32, penalty: f64) -> Self {
        self.min_trades = min_trades;
        self.few_trades_penalty = penalty;
        self
    }
}

impl FitnessFunction for StrategyFitness {
    fn evaluate(&self, params: &ParameterVector, window: &[Kline]) -> Result<f64, EvaluationError> {
        let mut generator = self.strategy.build(params)?;
        let required = generator.warmup_bars() + 1;
        if window.len() < required {
            return Err(EvaluationError::NotEnoughBars {
                bars: window.len(),
                required,
            });
        }

        let result = BacktestEngine::run(&self.backtest, generator.as_mut(), window)?;
        if result.total_trades < self.min_trades {
            return Ok(self.few_trades_penalty);
        }
        Ok(self.metric.score(&result))
    }
}
