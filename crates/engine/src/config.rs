//! Optimizer configuration
//!
//! One flat set of named options, read once (JSON file plus command-line
//! overrides) and passed explicitly to the runner.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::OptimizerError;
use crate::genetic::GeneticConfig;
use crate::series::{interval_ms, SeriesConfig};
use crate::splitter::{WindowConfig, WindowSplitter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(flatten)]
    pub search: GeneticConfig,
    #[serde(flatten)]
    pub windows: WindowConfig,
    #[serde(flatten)]
    pub series: SeriesConfig,
    pub seed: u64,
    /// Wall-clock budget for the whole run
    pub max_duration_secs: Option<u64>,
    /// Use the rayon pool for windows and generation evaluation
    pub parallel: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            search: GeneticConfig::default(),
            windows: WindowConfig::default(),
            series: SeriesConfig::default(),
            seed: 42,
            max_duration_secs: None,
            parallel: false,
        }
    }
}

impl OptimizerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, OptimizerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OptimizerError::InvalidConfig(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OptimizerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            OptimizerError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), OptimizerError> {
        self.search.validate()?;
        WindowSplitter::new(self.windows.clone())?;
        if interval_ms(&self.series.interval).is_none() {
            return Err(OptimizerError::InvalidConfig(format!(
                "unknown interval '{}'",
                self.series.interval
            )));
        }
        if let Some(tolerance) = self.series.gap_tolerance {
            if !tolerance.is_finite() || tolerance < 1.0 {
                return Err(OptimizerError::InvalidConfig(format!(
                    "gap_tolerance must be at least 1.0, got {tolerance}"
                )));
            }
        }
        if self.max_duration_secs == Some(0) {
            return Err(OptimizerError::InvalidConfig(
                "max_duration_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute deadline for a run starting at `start`. A budget too large
    /// to represent never expires.
    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        self.max_duration_secs
            .and_then(|secs| start.checked_add(Duration::from_secs(secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genetic::{CrossoverMethod, SelectionMethod};

    #[test]
    fn test_defaults_are_valid() {
        assert!(OptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_flat_json_fills_nested_sections() {
        let config = OptimizerConfig::from_json_str(
            r#"{
                "population_size": 12,
                "generations": 8,
                "selection": "roulette",
                "crossover": { "blend": { "alpha": 0.3 } },
                "train_len": 120,
                "test_len": 30,
                "step": 30,
                "anchored": true,
                "interval": "4h",
                "seed": 7,
                "max_duration_secs": 60,
                "parallel": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.search.population_size, 12);
        assert_eq!(config.search.generations, 8);
        assert_eq!(config.search.selection, SelectionMethod::Roulette);
        assert_eq!(config.search.crossover, CrossoverMethod::Blend { alpha: 0.3 });
        // Untouched options keep their defaults
        assert_eq!(config.search.elitism, GeneticConfig::default().elitism);
        assert_eq!(config.windows.train_len, 120);
        assert!(config.windows.anchored);
        assert_eq!(config.series.interval, "4h");
        assert_eq!(config.seed, 7);
        assert!(config.parallel);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(OptimizerConfig::from_json_str("{}").unwrap(), OptimizerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(OptimizerConfig::from_json_str(r#"{"step": 0}"#).is_err());
        assert!(OptimizerConfig::from_json_str(r#"{"mutation_rate": 2.0}"#).is_err());
        assert!(OptimizerConfig::from_json_str(r#"{"interval": "7x"}"#).is_err());
        assert!(OptimizerConfig::from_json_str(r#"{"max_duration_secs": 0}"#).is_err());
        assert!(OptimizerConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_deadline() {
        let start = Instant::now();
        assert_eq!(OptimizerConfig::default().deadline(start), None);
        let config = OptimizerConfig {
            max_duration_secs: Some(5),
            ..Default::default()
        };
        assert_eq!(config.deadline(start), Some(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_unrepresentable_deadline_never_expires() {
        let config = OptimizerConfig {
            max_duration_secs: Some(u64::MAX),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.deadline(Instant::now()), None);
    }
}
