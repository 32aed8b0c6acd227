//! Strategies the bundled fitness function can optimize

use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;
use crate::indicators::{EmaCrossoverSignalGenerator, RsiSignalGenerator, SignalGenerator};
use crate::params::{ParamDomain, ParameterSpace, ParameterVector};

/// Trading signal emitted once per bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Strategy family; concrete parameters come from a `ParameterVector`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// `period`, `overbought`, `oversold`
    Rsi,
    /// `fast_period`, `slow_period`
    EmaCrossover,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Rsi => write!(f, "RSI"),
            StrategyKind::EmaCrossover => write!(f, "EMA Crossover"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "rsi" => Ok(StrategyKind::Rsi),
            "ema" | "ema_crossover" => Ok(StrategyKind::EmaCrossover),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

impl StrategyKind {
    /// Default search bounds for this strategy
    pub fn parameter_space(&self) -> ParameterSpace {
        let domains = match self {
            StrategyKind::Rsi => vec![
                ParamDomain::integer("period", 5, 30),
                ParamDomain::continuous("overbought", 60.0, 90.0),
                ParamDomain::continuous("oversold", 10.0, 40.0),
            ],
            StrategyKind::EmaCrossover => vec![
                ParamDomain::integer("fast_period", 3, 30),
                ParamDomain::integer("slow_period", 20, 120),
            ],
        };
        // Static bounds above are always valid
        ParameterSpace::new(domains).unwrap_or_else(|e| unreachable!("{e}"))
    }

    /// Build a fresh signal generator from a parameter vector
    pub fn build(&self, params: &ParameterVector) -> Result<Box<dyn SignalGenerator>, EvaluationError> {
        Ok(match self {
            StrategyKind::Rsi => Box::new(RsiSignalGenerator::new(
                params.require_usize("period")?,
                params.require("overbought")?,
                params.require("oversold")?,
            )?),
            StrategyKind::EmaCrossover => Box::new(EmaCrossoverSignalGenerator::new(
                params.require_usize("fast_period")?,
                params.require_usize("slow_period")?,
            )?),
        })
    }
}
