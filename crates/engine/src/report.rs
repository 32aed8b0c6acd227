//! Walk-forward results and the aggregate optimization report

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::ops::Range;

use crate::genetic::Termination;
use crate::params::ParameterVector;

// ============================================================================
// Per-window result
// ============================================================================

/// Outcome of one train/test window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub index: usize,
    pub train: Range<usize>,
    pub test: Range<usize>,
    /// First open time and last close time of each range, epoch ms
    pub train_period: (i64, i64),
    pub test_period: (i64, i64),
    pub best_params: ParameterVector,
    /// `None` when no candidate could be scored in-sample
    pub in_sample_fitness: Option<f64>,
    /// `None` when the out-of-sample evaluation failed
    pub out_of_sample_fitness: Option<f64>,
    /// In-sample minus out-of-sample fitness
    pub overfitting_gap: Option<f64>,
    pub generations_run: usize,
    pub termination: Termination,
}

impl WindowResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        train: Range<usize>,
        test: Range<usize>,
        train_period: (i64, i64),
        test_period: (i64, i64),
        best_params: ParameterVector,
        in_sample_fitness: Option<f64>,
        out_of_sample_fitness: Option<f64>,
        generations_run: usize,
        termination: Termination,
    ) -> Self {
        let overfitting_gap = match (in_sample_fitness, out_of_sample_fitness) {
            (Some(is), Some(oos)) => Some(is - oos),
            _ => None,
        };
        Self {
            index,
            train,
            test,
            train_period,
            test_period,
            best_params,
            in_sample_fitness,
            out_of_sample_fitness,
            overfitting_gap,
            generations_run,
            termination,
        }
    }

    /// Out-of-sample fitness was scored and non-negative
    pub fn is_consistent(&self) -> bool {
        self.out_of_sample_fitness.is_some_and(|f| f >= 0.0)
    }
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Windows the splitter produced
    pub windows_planned: usize,
    /// Windows actually optimized
    pub windows_completed: usize,
    /// Completed windows with an out-of-sample score
    pub windows_scored: usize,
    pub mean_oos_fitness: Option<f64>,
    /// Sample standard deviation; 0 for a single scored window
    pub std_oos_fitness: Option<f64>,
    /// Share of completed windows with non-negative out-of-sample fitness
    pub consistency_ratio: f64,
    pub mean_is_fitness: Option<f64>,
    pub mean_overfitting_gap: Option<f64>,
}

/// A window winner placed in the overall ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedParameters {
    /// 1-based
    pub rank: usize,
    pub window_index: usize,
    pub params: ParameterVector,
    pub in_sample_fitness: Option<f64>,
    pub out_of_sample_fitness: Option<f64>,
}

/// How much a parameter's winning value moved between windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStability {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    /// std / |mean|; `None` when the mean is zero
    pub coefficient_of_variation: Option<f64>,
}

// ============================================================================
// Report
// ============================================================================

/// Immutable result of a walk-forward run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    windows: Vec<WindowResult>,
    summary: ReportSummary,
    ranked: Vec<RankedParameters>,
    stability: Vec<ParameterStability>,
    partial: bool,
    seed: u64,
    fingerprint: String,
}

impl OptimizationReport {
    /// Aggregate window results (in window order). `interrupted` marks a run
    /// that stopped on its budget or a cancel request.
    pub fn build(windows: Vec<WindowResult>, windows_planned: usize, seed: u64, interrupted: bool) -> Self {
        let scored: Vec<f64> = windows.iter().filter_map(|w| w.out_of_sample_fitness).collect();
        let in_sample: Vec<f64> = windows.iter().filter_map(|w| w.in_sample_fitness).collect();
        let gaps: Vec<f64> = windows.iter().filter_map(|w| w.overfitting_gap).collect();

        let consistency_ratio = if windows.is_empty() {
            0.0
        } else {
            windows.iter().filter(|w| w.is_consistent()).count() as f64 / windows.len() as f64
        };

        let summary = ReportSummary {
            windows_planned,
            windows_completed: windows.len(),
            windows_scored: scored.len(),
            mean_oos_fitness: mean(&scored),
            std_oos_fitness: sample_std(&scored),
            consistency_ratio,
            mean_is_fitness: mean(&in_sample),
            mean_overfitting_gap: mean(&gaps),
        };

        let partial = interrupted
            || windows.len() < windows_planned
            || windows.iter().any(|w| w.termination.is_interrupted());

        let ranked = rank(&windows);
        let stability = stability(&windows);
        let fingerprint = fingerprint(&windows, seed, partial);

        Self {
            windows,
            summary,
            ranked,
            stability,
            partial,
            seed,
            fingerprint,
        }
    }

    pub fn windows(&self) -> &[WindowResult] {
        &self.windows
    }

    pub fn summary(&self) -> &ReportSummary {
        &self.summary
    }

    /// Window winners, best out-of-sample first
    pub fn ranked(&self) -> &[RankedParameters] {
        &self.ranked
    }

    pub fn best(&self) -> Option<&RankedParameters> {
        self.ranked.first()
    }

    pub fn stability(&self) -> &[ParameterStability] {
        &self.stability
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// SHA-256 over windows, seed and partial flag. Equal runs give equal fingerprints.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn sample_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Out-of-sample descending, unscored last, ties by window index
fn rank(windows: &[WindowResult]) -> Vec<RankedParameters> {
    let mut order: Vec<&WindowResult> = windows.iter().collect();
    order.sort_by(|a, b| match (a.out_of_sample_fitness, b.out_of_sample_fitness) {
        (Some(x), Some(y)) => y.total_cmp(&x).then(a.index.cmp(&b.index)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.index.cmp(&b.index),
    });

    order
        .into_iter()
        .enumerate()
        .map(|(i, w)| RankedParameters {
            rank: i + 1,
            window_index: w.index,
            params: w.best_params.clone(),
            in_sample_fitness: w.in_sample_fitness,
            out_of_sample_fitness: w.out_of_sample_fitness,
        })
        .collect()
}

fn stability(windows: &[WindowResult]) -> Vec<ParameterStability> {
    let names: BTreeSet<&str> = windows
        .iter()
        .flat_map(|w| w.best_params.iter().map(|(name, _)| name))
        .collect();

    names
        .into_iter()
        .filter_map(|name| {
            let values: Vec<f64> = windows.iter().filter_map(|w| w.best_params.get(name)).collect();
            let m = mean(&values)?;
            let std = sample_std(&values)?;
            Some(ParameterStability {
                name: name.to_string(),
                mean: m,
                std,
                coefficient_of_variation: (m.abs() > f64::EPSILON).then(|| std / m.abs()),
            })
        })
        .collect()
}

fn fingerprint(windows: &[WindowResult], seed: u64, partial: bool) -> String {
    let json = serde_json::to_string(windows).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hasher.update(seed.to_le_bytes());
    hasher.update([partial as u8]);
    format!("{:x}", hasher.finalize())
}
