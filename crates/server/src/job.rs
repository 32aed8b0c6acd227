//! One optimization job: load data, run the walk-forward optimizer, store the report

use anyhow::Context;
use engine::{
    BacktestConfig, BinanceClient, FitnessMetric, Kline, OptimizationReport, OptimizeProgress,
    OptimizerConfig, ParameterSpace, PriceSeries, StrategyFitness, StrategyKind,
    WalkForwardOptimizer,
};
use persistence::repository::{RunRecord, RunRepository, SaveOutcome, WindowRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
/// Longest history a request may ask Binance for
pub const MAX_HISTORY_DAYS: u32 = 10_000;

fn default_days() -> u32 {
    1000
}

/// Everything needed to run and label one optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub strategy: StrategyKind,
    #[serde(default)]
    pub metric: FitnessMetric,
    /// Binance symbol; ignored when `data_file` is set
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default = "default_days")]
    pub days: u32,
    /// JSON array of klines to use instead of fetching. CLI only; never
    /// read from or written to request JSON.
    #[serde(skip)]
    pub data_file: Option<String>,
    #[serde(default)]
    pub config: OptimizerConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    /// Windows with fewer trades score -100
    #[serde(default)]
    pub min_trades: Option<u32>,
    /// Overrides the strategy's default bounds
    #[serde(default)]
    pub space: Option<ParameterSpace>,
}

impl OptimizeRequest {
    pub fn symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL)
    }

    pub fn label(&self) -> String {
        let source = match &self.data_file {
            Some(path) => path.as_str(),
            None => self.symbol(),
        };
        format!("{} {} {}", self.strategy, source, self.config.series.interval)
    }

    pub fn fitness(&self) -> StrategyFitness {
        let fitness = StrategyFitness::new(self.strategy, self.metric).with_backtest(self.backtest.clone());
        match self.min_trades {
            Some(min) => fitness.with_min_trades(min, -100.0),
            None => fitness,
        }
    }

    pub fn space(&self) -> ParameterSpace {
        self.space
            .clone()
            .unwrap_or_else(|| self.strategy.parameter_space())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.days == 0 || self.days > MAX_HISTORY_DAYS {
            anyhow::bail!("days must be within 1..={MAX_HISTORY_DAYS}, got {}", self.days);
        }
        self.config.validate()?;
        Ok(())
    }
}

/// Marks the job failed if it ends without publishing an outcome, e.g. on panic
struct FailUnlessFinished<'a>(&'a OptimizeProgress);

impl Drop for FailUnlessFinished<'_> {
    fn drop(&mut self) {
        if self.0.is_running() {
            error!("Optimization job aborted");
            self.0.fail("optimization job aborted unexpectedly");
        }
    }
}

/// Load klines from file or Binance and validate them into a series
pub async fn load_series(request: &OptimizeRequest, binance: &BinanceClient) -> anyhow::Result<PriceSeries> {
    let series_config = &request.config.series;
    let klines: Vec<Kline> = match &request.data_file {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
            serde_json::from_str(&json).with_context(|| format!("{path} is not a JSON array of klines"))?
        }
        None => {
            binance
                .fetch_history(request.symbol(), &series_config.interval, request.days)
                .await?
        }
    };

    info!(klines = klines.len(), "Market data loaded");
    Ok(PriceSeries::normalized(klines, series_config)?)
}

/// Run the optimizer on tokio's blocking pool. Progress stays `Running`;
/// the caller publishes the outcome.
pub async fn optimize(
    request: &OptimizeRequest,
    series: PriceSeries,
    progress: Arc<OptimizeProgress>,
) -> anyhow::Result<(OptimizationReport, i64)> {
    let optimizer = WalkForwardOptimizer::new(request.config.clone(), request.space())?;
    let fitness = request.fitness();

    let handle = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let report = optimizer.run_tracked(&series, &fitness, &progress)?;
        let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        Ok::<_, engine::OptimizerError>((report, elapsed_ms))
    });

    Ok(handle.await.context("optimizer task panicked")??)
}

/// Full pipeline used by both the CLI and the HTTP API
pub async fn execute(
    request: OptimizeRequest,
    binance: &BinanceClient,
    db: Option<&persistence::Database>,
    progress: Arc<OptimizeProgress>,
) -> anyhow::Result<(OptimizationReport, Option<SaveOutcome>)> {
    progress.reset(request.label());
    let _guard = FailUnlessFinished(progress.as_ref());

    let result = async {
        request.validate()?;
        let series = load_series(&request, binance).await?;
        let (report, elapsed_ms) = optimize(&request, series, progress.clone()).await?;

        let saved = match db {
            Some(db) => {
                let (run, windows) = to_records(&request, &report, elapsed_ms)?;
                let repo = RunRepository::new(db.pool());
                Some(repo.save_run(&run, &windows).await?)
            }
            None => None,
        };
        Ok::<_, anyhow::Error>((report, saved))
    }
    .await;

    match &result {
        Ok((report, _)) => progress.finish(report),
        Err(e) => {
            error!(error = %e, "Optimization job failed");
            progress.fail(format!("{e:#}"));
        }
    }
    result
}

/// Flatten a report into database rows
pub fn to_records(
    request: &OptimizeRequest,
    report: &OptimizationReport,
    elapsed_ms: i64,
) -> anyhow::Result<(RunRecord, Vec<WindowRecord>)> {
    let summary = report.summary();
    let run = RunRecord {
        id: None,
        fingerprint: report.fingerprint().to_string(),
        label: request.label(),
        strategy: serde_json::to_value(request.strategy)?
            .as_str()
            .unwrap_or_default()
            .to_string(),
        metric: request.metric.to_string(),
        symbol: request.data_file.is_none().then(|| request.symbol().to_string()),
        interval: request.config.series.interval.clone(),
        seed: request.config.seed as i64,
        windows_planned: summary.windows_planned as i64,
        windows_completed: summary.windows_completed as i64,
        windows_scored: summary.windows_scored as i64,
        mean_oos_fitness: summary.mean_oos_fitness,
        std_oos_fitness: summary.std_oos_fitness,
        consistency_ratio: summary.consistency_ratio,
        partial: report.is_partial(),
        config_json: serde_json::to_string(request)?,
        report_json: serde_json::to_string(report)?,
        elapsed_ms: Some(elapsed_ms),
        created_at: None,
    };

    let windows = report
        .windows()
        .iter()
        .map(|w| {
            Ok(WindowRecord {
                id: None,
                run_id: 0,
                window_index: w.index as i64,
                train_start: w.train_period.0,
                train_end: w.train_period.1,
                test_start: w.test_period.0,
                test_end: w.test_period.1,
                params_json: serde_json::to_string(&w.best_params)?,
                in_sample_fitness: w.in_sample_fitness,
                out_of_sample_fitness: w.out_of_sample_fitness,
                overfitting_gap: w.overfitting_gap,
                generations_run: w.generations_run as i64,
                termination: w.termination.to_string(),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok((run, windows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{OptimizeStatus, ParameterVector, Termination, WindowResult};
    use std::sync::atomic::Ordering;

    const DAY: i64 = 86_400_000;

    /// Small RSI job over a daily kline file written to the temp dir
    fn file_request(name: &str) -> (OptimizeRequest, std::path::PathBuf) {
        let klines: Vec<serde_json::Value> = (0..120)
            .map(|i| {
                let close = 100.0 + 10.0 * (i as f64 * 0.2).sin();
                serde_json::json!({
                    "open_time": i * DAY,
                    "open": format!("{close:.4}"),
                    "high": format!("{:.4}", close + 1.0),
                    "low": format!("{:.4}", close - 1.0),
                    "close": format!("{close:.4}"),
                    "volume": "1000",
                    "close_time": i * DAY + DAY - 1,
                })
            })
            .collect();
        let path = std::env::temp_dir().join(format!("walkforge-{name}-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&klines).unwrap()).unwrap();

        let mut req: OptimizeRequest = serde_json::from_str(
            r#"{
                "strategy": "rsi",
                "config": { "population_size": 4, "generations": 2, "train_len": 60, "test_len": 20, "step": 20 }
            }"#,
        )
        .unwrap();
        req.data_file = Some(path.to_string_lossy().into_owned());
        (req, path)
    }

    fn request() -> OptimizeRequest {
        serde_json::from_str(r#"{"strategy": "ema_crossover"}"#).unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let req = request();
        assert_eq!(req.metric, FitnessMetric::Sharpe);
        assert_eq!(req.symbol(), DEFAULT_SYMBOL);
        assert_eq!(req.days, 1000);
        assert_eq!(req.config, OptimizerConfig::default());
        assert_eq!(req.label(), "EMA Crossover BTCUSDT 1d");
        assert_eq!(req.space(), StrategyKind::EmaCrossover.parameter_space());
    }

    #[test]
    fn test_request_accepts_flat_config() {
        let req: OptimizeRequest = serde_json::from_str(
            r#"{
                "strategy": "rsi",
                "metric": "drawdown_adjusted",
                "symbol": "ETHUSDT",
                "config": { "population_size": 10, "train_len": 100, "interval": "4h" },
                "backtest": { "atr_risk_sizing": true }
            }"#,
        )
        .unwrap();
        assert_eq!(req.config.search.population_size, 10);
        assert_eq!(req.config.windows.train_len, 100);
        assert!(req.backtest.atr_risk_sizing);
        assert_eq!(req.label(), "RSI ETHUSDT 4h");
    }

    #[test]
    fn test_to_records() {
        let req = request();
        let report = OptimizationReport::build(
            vec![WindowResult::new(
                0,
                0..200,
                200..250,
                (0, 199),
                (200, 249),
                ParameterVector::new().with("fast_period", 5.0).with("slow_period", 40.0),
                Some(1.0),
                Some(0.25),
                12,
                Termination::Stagnated,
            )],
            1,
            42,
            false,
        );

        let (run, windows) = to_records(&req, &report, 900).unwrap();
        assert_eq!(run.fingerprint, report.fingerprint());
        assert_eq!(run.strategy, "ema_crossover");
        assert_eq!(run.metric, "sharpe");
        assert_eq!(run.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(run.mean_oos_fitness, Some(0.25));
        assert_eq!(run.elapsed_ms, Some(900));

        let stored: OptimizationReport = serde_json::from_str(&run.report_json).unwrap();
        assert_eq!(stored, report);

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].termination, "stagnated");
        assert_eq!(windows[0].overfitting_gap, Some(0.75));
        assert_eq!(windows[0].params_json, r#"{"fast_period":5.0,"slow_period":40.0}"#);
    }

    #[test]
    fn test_data_file_is_not_accepted_from_json() {
        let req: OptimizeRequest =
            serde_json::from_str(r#"{"strategy": "rsi", "data_file": "/etc/passwd"}"#).unwrap();
        assert_eq!(req.data_file, None);
        assert_eq!(req.label(), "RSI BTCUSDT 1d");
    }

    #[test]
    fn test_days_are_capped() {
        let mut req = request();
        assert!(req.validate().is_ok());
        req.days = u32::MAX;
        assert!(req.validate().is_err());
        req.days = 0;
        assert!(req.validate().is_err());
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_job_failed() {
        let req: OptimizeRequest =
            serde_json::from_str(r#"{"strategy": "rsi", "days": 4294967295}"#).unwrap();
        let binance = BinanceClient::with_base_url("http://127.0.0.1:9").unwrap();
        let progress = Arc::new(OptimizeProgress::new());

        assert!(execute(req, &binance, None, progress.clone()).await.is_err());
        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Error);
        assert!(!progress.is_running());
    }

    #[tokio::test]
    async fn test_execute_publishes_report_when_done() {
        let (req, path) = file_request("ok");
        let binance = BinanceClient::new().unwrap();
        let progress = Arc::new(OptimizeProgress::new());

        let result = execute(req, &binance, None, progress.clone()).await;
        std::fs::remove_file(&path).ok();

        let (report, saved) = result.unwrap();
        assert!(saved.is_none());
        assert_eq!(report.windows().len(), 3);
        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Complete);
        assert_eq!(progress.report.read().unwrap().as_ref(), Some(&report));
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let (req, path) = file_request("closed-db");
        let db = persistence::Database::in_memory().await.unwrap();
        db.pool().close().await;
        let binance = BinanceClient::new().unwrap();
        let progress = Arc::new(OptimizeProgress::new());

        let result = execute(req, &binance, Some(&db), progress.clone()).await;
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
        assert_eq!(progress.completed_windows.load(Ordering::Relaxed), 3);
        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Error);
        assert!(progress.error_message.read().unwrap().is_some());
        assert!(progress.report.read().unwrap().is_none());
    }

    #[test]
    fn test_guard_fails_job_on_panic() {
        let progress = OptimizeProgress::new();
        progress.reset("panicking job");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = FailUnlessFinished(&progress);
            panic!("kline parser blew up");
        }));

        assert!(outcome.is_err());
        assert_eq!(*progress.status.read().unwrap(), OptimizeStatus::Error);
        assert!(progress.error_message.read().unwrap().is_some());
    }
}
