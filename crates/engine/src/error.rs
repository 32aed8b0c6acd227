//! Error types for the optimizer core

use thiserror::Error;

/// Errors that abort an optimization run (or reject its inputs up front).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    /// The series cannot produce a single full train/test pair
    #[error("insufficient data: one train/test window needs {required} bars, series has {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("price series is empty")]
    EmptySeries,

    /// Timestamps must be strictly increasing
    #[error("price series is not strictly increasing at index {index}: {previous} >= {current}")]
    UnorderedSeries {
        index: usize,
        previous: i64,
        current: i64,
    },

    /// A hole in the series wider than the configured timeframe tolerance
    #[error("gap of {gap_ms}ms before index {index} exceeds tolerance of {max_gap_ms}ms")]
    GapTooLarge {
        index: usize,
        gap_ms: i64,
        max_gap_ms: i64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid parameter domain: {0}")]
    InvalidDomain(String),
}

/// Failure to score one parameter vector. Recovered by the search engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("window has {bars} bars, strategy needs at least {required}")]
    NotEnoughBars { bars: usize, required: usize },

    #[error("evaluation failed: {0}")]
    Failed(String),
}
