//! Walk-forward optimization
//!
//! Splits a price series into train/test windows, runs a genetic search on
//! every train slice, re-scores the winner on the paired test slice and
//! aggregates everything into an `OptimizationReport`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    RwLock,
};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::OptimizerConfig;
use crate::error::OptimizerError;
use crate::fitness::FitnessFunction;
use crate::genetic::{GeneticSearch, GenerationStats};
use crate::params::ParameterSpace;
use crate::report::{OptimizationReport, WindowResult};
use crate::series::PriceSeries;
use crate::splitter::{WindowPair, WindowSplitter};
use crate::validation::OutOfSampleValidator;

// ============================================================================
// Progress tracking
// ============================================================================

/// Optimization run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress tracker between the runner and whoever is watching it
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_windows: AtomicU32,
    pub completed_windows: AtomicU32,
    pub generations_done: AtomicU32,
    pub cancelled: AtomicBool,
    pub report: RwLock<Option<OptimizationReport>>,
    pub error_message: RwLock<Option<String>>,
    /// Free-form description of what is being optimized
    pub label: RwLock<Option<String>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_windows: AtomicU32::new(0),
            completed_windows: AtomicU32::new(0),
            generations_done: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            report: RwLock::new(None),
            error_message: RwLock::new(None),
            label: RwLock::new(None),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self, label: impl Into<String>) {
        *self.status.write().unwrap() = OptimizeStatus::Running;
        self.total_windows.store(0, Ordering::Relaxed);
        self.completed_windows.store(0, Ordering::Relaxed);
        self.generations_done.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.report.write().unwrap() = None;
        *self.error_message.write().unwrap() = None;
        *self.label.write().unwrap() = Some(label.into());
    }

    /// Get progress as percentage of windows done
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_windows.load(Ordering::Relaxed);
        let done = self.completed_windows.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), OptimizeStatus::Running)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Publish the final report; status becomes `Complete`, or `Cancelled`
    /// when a cancel was requested
    pub fn finish(&self, report: &OptimizationReport) {
        let status = if self.is_cancelled() {
            OptimizeStatus::Cancelled
        } else {
            OptimizeStatus::Complete
        };
        *self.report.write().unwrap() = Some(report.clone());
        *self.status.write().unwrap() = status;
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.error_message.write().unwrap() = Some(message.into());
        *self.status.write().unwrap() = OptimizeStatus::Error;
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct WalkForwardOptimizer {
    config: OptimizerConfig,
    space: ParameterSpace,
    splitter: WindowSplitter,
}

impl WalkForwardOptimizer {
    pub fn new(config: OptimizerConfig, space: ParameterSpace) -> Result<Self, OptimizerError> {
        config.validate()?;
        let splitter = WindowSplitter::new(config.windows.clone())?;
        Ok(Self {
            config,
            space,
            splitter,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Number of windows a series of `series_len` bars would produce
    pub fn window_count(&self, series_len: usize) -> usize {
        self.splitter.count(series_len)
    }

    pub fn run(
        &self,
        series: &PriceSeries,
        fitness: &dyn FitnessFunction,
    ) -> Result<OptimizationReport, OptimizerError> {
        self.run_with_progress(series, fitness, &OptimizeProgress::new())
    }

    /// Run and publish progress, the final report and any error to `progress`.
    /// Setting `progress.cancelled` stops the run at the next generation boundary.
    pub fn run_with_progress(
        &self,
        series: &PriceSeries,
        fitness: &dyn FitnessFunction,
        progress: &OptimizeProgress,
    ) -> Result<OptimizationReport, OptimizerError> {
        match self.run_tracked(series, fitness, progress) {
            Ok(report) => {
                progress.finish(&report);
                Ok(report)
            }
            Err(e) => {
                progress.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Like `run_with_progress`, but the status stays `Running` afterwards.
    /// The caller publishes the outcome with `finish` or `fail` once its own
    /// follow-up work (such as storing the report) is done.
    pub fn run_tracked(
        &self,
        series: &PriceSeries,
        fitness: &dyn FitnessFunction,
        progress: &OptimizeProgress,
    ) -> Result<OptimizationReport, OptimizerError> {
        let windows: Vec<WindowPair> = self.splitter.split(series.len())?.collect();
        let planned = windows.len();
        progress
            .total_windows
            .store(u32::try_from(planned).unwrap_or(u32::MAX), Ordering::Relaxed);

        let start = Instant::now();
        let deadline = self.config.deadline(start);

        info!(
            bars = series.len(),
            windows = planned,
            params = self.space.len(),
            population = self.config.search.population_size,
            generations = self.config.search.generations,
            seed = self.config.seed,
            parallel = self.config.parallel,
            "Starting walk-forward optimization"
        );

        let count_generation = |_: &GenerationStats| {
            progress.generations_done.fetch_add(1, Ordering::Relaxed);
        };
        let search = GeneticSearch::new(&self.config.search, &self.space)?
            .parallel(self.config.parallel)
            .with_deadline(deadline)
            .with_cancel_flag(&progress.cancelled)
            .with_observer(&count_generation);
        let validator = OutOfSampleValidator::new(fitness);

        let run_window = |pair: &WindowPair| -> Option<WindowResult> {
            if progress.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(window = pair.index, "Skipping window, run interrupted");
                return None;
            }
            let result = self.run_window(pair, series, fitness, &search, &validator);
            progress.completed_windows.fetch_add(1, Ordering::Relaxed);
            Some(result)
        };

        let results: Vec<WindowResult> = if self.config.parallel {
            windows.par_iter().filter_map(run_window).collect()
        } else {
            let mut results = Vec::with_capacity(planned);
            for pair in &windows {
                match run_window(pair) {
                    Some(result) => results.push(result),
                    None => break,
                }
            }
            results
        };

        // Skipped windows and cut-short searches already mark the report partial
        let report = OptimizationReport::build(results, planned, self.config.seed, false);

        let summary = report.summary();
        info!(
            windows = summary.windows_completed,
            scored = summary.windows_scored,
            mean_oos = ?summary.mean_oos_fitness,
            consistency = summary.consistency_ratio,
            partial = report.is_partial(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            fingerprint = %report.fingerprint(),
            "Walk-forward optimization complete"
        );

        Ok(report)
    }

    fn run_window(
        &self,
        pair: &WindowPair,
        series: &PriceSeries,
        fitness: &dyn FitnessFunction,
        search: &GeneticSearch<'_>,
        validator: &OutOfSampleValidator<'_>,
    ) -> WindowResult {
        let train = series.slice(pair.train.clone());
        let test = series.slice(pair.test.clone());

        // Each window gets its own stream so results do not depend on scheduling
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(pair.index as u64));
        let outcome = search.run(fitness, train, &mut rng);

        let in_sample = outcome.best.is_scored().then(|| outcome.best.fitness());
        let out_of_sample = if in_sample.is_some() {
            validator.validate(outcome.best.params(), test)
        } else {
            warn!(window = pair.index, "No candidate could be scored in-sample");
            None
        };

        info!(
            window = pair.index,
            is_fitness = ?in_sample,
            oos_fitness = ?out_of_sample,
            generations = outcome.generations_run,
            termination = %outcome.termination,
            params = %outcome.best.params(),
            "Window complete"
        );

        WindowResult::new(
            pair.index,
            pair.train.clone(),
            pair.test.clone(),
            series.time_span(&pair.train).unwrap_or_default(),
            series.time_span(&pair.test).unwrap_or_default(),
            outcome.best.into_params(),
            in_sample,
            out_of_sample,
            outcome.generations_run,
            outcome.termination,
        )
    }
}
