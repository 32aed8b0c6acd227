//! Out-of-sample validation of a window's winning parameters

use tracing::warn;

use crate::fitness::{try_score, FitnessFunction};
use crate::params::ParameterVector;
use crate::types::Kline;

/// Re-scores a fixed parameter vector on held-out bars. No search happens
/// here and the score never feeds back into the optimizer.
pub struct OutOfSampleValidator<'a> {
    fitness: &'a dyn FitnessFunction,
}

impl<'a> OutOfSampleValidator<'a> {
    pub fn new(fitness: &'a dyn FitnessFunction) -> Self {
        Self { fitness }
    }

    /// `None` when the evaluation failed or was non-finite
    pub fn validate(&self, params: &ParameterVector, test_window: &[Kline]) -> Option<f64> {
        let score = try_score(self.fitness, params, test_window);
        if score.is_none() {
            warn!(%params, bars = test_window.len(), "Out-of-sample evaluation produced no score");
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::test_support::trending_klines;

    #[test]
    fn test_scores_on_the_given_window_only() {
        let bars_seen = |_: &ParameterVector, w: &[Kline]| -> Result<f64, EvaluationError> {
            Ok(w.len() as f64)
        };
        let validator = OutOfSampleValidator::new(&bars_seen);
        let bars = trending_klines(50, 100.0, 1.0);
        assert_eq!(validator.validate(&ParameterVector::new(), &bars[10..30]), Some(20.0));
    }

    #[test]
    fn test_failure_yields_no_score() {
        let failing = |_: &ParameterVector, _: &[Kline]| -> Result<f64, EvaluationError> {
            Err(EvaluationError::NotEnoughBars { bars: 5, required: 30 })
        };
        let validator = OutOfSampleValidator::new(&failing);
        assert_eq!(validator.validate(&ParameterVector::new(), &[]), None);
    }
}
