//! Walkforge engine: walk-forward genetic optimization of trading strategies
//!
//! Provides:
//! - Validated price series and walk-forward window splitting
//! - Genetic parameter search with out-of-sample validation
//! - Aggregated, fingerprinted optimization reports
//! - RSI and EMA crossover strategies scored by a bar-by-bar backtester
//! - Binance public API client for market data

pub mod api;
pub mod backtest;
pub mod config;
pub mod error;
pub mod fitness;
pub mod genetic;
pub mod indicators;
pub mod optimizer;
pub mod params;
pub mod report;
pub mod series;
pub mod splitter;
pub mod strategy;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use api::BinanceClient;
pub use backtest::{BacktestConfig, BacktestEngine};
pub use config::OptimizerConfig;
pub use error::{EvaluationError, OptimizerError};
pub use fitness::{FitnessFunction, FitnessMetric, StrategyFitness, WORST_FITNESS};
pub use genetic::{
    CrossoverMethod, GeneticConfig, GeneticSearch, GenerationStats, Individual, SearchOutcome,
    SelectionMethod, Termination,
};
pub use indicators::SignalGenerator;
pub use optimizer::{OptimizeProgress, OptimizeStatus, WalkForwardOptimizer};
pub use params::{ParamDomain, ParamKind, ParameterSpace, ParameterVector};
pub use report::{OptimizationReport, ParameterStability, RankedParameters, ReportSummary, WindowResult};
pub use series::{PriceSeries, SeriesConfig};
pub use splitter::{WindowConfig, WindowIter, WindowPair, WindowSplitter};
pub use strategy::{Signal, StrategyKind};
pub use types::*;
