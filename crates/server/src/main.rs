//! Walkforge - walk-forward genetic optimizer for trading strategies
//!
//! Usage:
//!   walkforge run --strategy ema --symbol BTCUSDT   - Optimize from CLI
//!   walkforge serve --port 3001                      - Launch HTTP API
//!   walkforge runs                                   - List stored runs
//!   walkforge prune --keep 20                        - Delete old runs

mod job;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Args, Parser, Subcommand};
use engine::{
    BinanceClient, CrossoverMethod, FitnessMetric, OptimizationReport, OptimizeProgress,
    OptimizeStatus, OptimizerConfig, SelectionMethod, StrategyKind,
};
use persistence::repository::{RunRepository, SaveOutcome};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::job::OptimizeRequest;

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));
const DEFAULT_DB_PATH: &str = "data/walkforge.db";

#[derive(Parser)]
#[command(name = "walkforge")]
#[command(about = "Walk-forward genetic optimizer for trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run one walk-forward optimization from CLI (no web server)
    Run(RunArgs),
    /// List stored optimization runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Keep the N most recent runs, delete the rest
    Prune {
        #[arg(long, default_value_t = 20)]
        keep: i64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Strategy: rsi, ema_crossover
    #[arg(long, default_value = "ema_crossover")]
    strategy: StrategyKind,
    /// Fitness metric: sharpe, total_return, drawdown_adjusted
    #[arg(long, default_value = "sharpe")]
    metric: FitnessMetric,
    /// Binance symbol to fetch
    #[arg(long)]
    symbol: Option<String>,
    /// Days of history to fetch
    #[arg(long, default_value_t = 1000)]
    days: u32,
    /// Load klines from a JSON file instead of Binance
    #[arg(long)]
    data_file: Option<String>,
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    interval: Option<String>,
    #[arg(long)]
    population: Option<usize>,
    #[arg(long)]
    generations: Option<usize>,
    #[arg(long)]
    mutation_rate: Option<f64>,
    #[arg(long)]
    crossover_rate: Option<f64>,
    #[arg(long)]
    elitism: Option<usize>,
    /// Selection method: tournament, roulette
    #[arg(long)]
    selection: Option<SelectionMethod>,
    /// Use BLX-alpha crossover with this alpha instead of uniform
    #[arg(long)]
    blend_alpha: Option<f64>,
    #[arg(long)]
    train_len: Option<usize>,
    #[arg(long)]
    test_len: Option<usize>,
    #[arg(long)]
    step: Option<usize>,
    /// Expanding train window anchored at the first bar
    #[arg(long)]
    anchored: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Wall-clock budget for the whole run, in seconds
    #[arg(long)]
    max_duration: Option<u64>,
    /// Evaluate windows and populations on all cores
    #[arg(long)]
    parallel: bool,
    /// Size positions by ATR risk and place ATR stops
    #[arg(long)]
    atr_sizing: bool,
    /// Windows with fewer trades get a penalty score
    #[arg(long)]
    min_trades: Option<u32>,
    /// Optional JSON export path for the full report
    #[arg(long)]
    export: Option<String>,
    /// Do not store the run in the database
    #[arg(long)]
    no_save: bool,
}

impl RunArgs {
    fn into_request(self) -> anyhow::Result<OptimizeRequest> {
        let mut config = match &self.config {
            Some(path) => OptimizerConfig::from_json_file(path)?,
            None => OptimizerConfig::default(),
        };

        if let Some(interval) = self.interval {
            config.series.interval = interval;
        }
        if let Some(v) = self.population {
            config.search.population_size = v;
        }
        if let Some(v) = self.generations {
            config.search.generations = v;
        }
        if let Some(v) = self.mutation_rate {
            config.search.mutation_rate = v;
        }
        if let Some(v) = self.crossover_rate {
            config.search.crossover_rate = v;
        }
        if let Some(v) = self.elitism {
            config.search.elitism = v;
        }
        if let Some(selection) = self.selection {
            config.search.selection = selection;
        }
        if let Some(alpha) = self.blend_alpha {
            config.search.crossover = CrossoverMethod::Blend { alpha };
        }
        if let Some(v) = self.train_len {
            config.windows.train_len = v;
        }
        if let Some(v) = self.test_len {
            config.windows.test_len = v;
        }
        if let Some(v) = self.step {
            config.windows.step = v;
        }
        if self.anchored {
            config.windows.anchored = true;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if self.max_duration.is_some() {
            config.max_duration_secs = self.max_duration;
        }
        if self.parallel {
            config.parallel = true;
        }
        let mut request = OptimizeRequest {
            strategy: self.strategy,
            metric: self.metric,
            symbol: self.symbol,
            days: self.days,
            data_file: self.data_file,
            config,
            backtest: Default::default(),
            min_trades: self.min_trades,
            space: None,
        };
        request.backtest.atr_risk_sizing = self.atr_sizing;
        request.validate()?;
        Ok(request)
    }
}

#[derive(Clone)]
struct AppState {
    binance: Arc<BinanceClient>,
    db: Arc<persistence::Database>,
    optimize_progress: Arc<OptimizeProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,walkforge=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,walkforge=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("WALKFORGE_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

async fn open_db(path: &str) -> anyhow::Result<persistence::Database> {
    persistence::Database::new(path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run(args) => {
            cmd_run(args).await?;
        }
        Commands::Runs { limit } => {
            cmd_runs(limit).await?;
        }
        Commands::Prune { keep } => {
            cmd_prune(keep).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Serve command - Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Walkforge v{} starting...", APP_VERSION);

    let db_path = db_path();
    let db = open_db(&db_path).await?;
    info!("Database initialized: {}", db_path);

    let state = AppState {
        binance: Arc::new(BinanceClient::new()?),
        db: Arc::new(db),
        optimize_progress: Arc::new(OptimizeProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/optimize", post(api_start_optimization))
        .route("/optimize/status", get(api_optimize_status))
        .route("/optimize/cancel", post(api_cancel_optimization))
        .route("/runs", get(api_list_runs))
        .route("/runs/:id", get(api_get_run))
        .route("/stats", get(api_stats))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Walkforge v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/optimize            - Start walk-forward optimization");
    println!("  GET  /api/optimize/status     - Poll optimization progress");
    println!("  POST /api/optimize/cancel     - Cancel running optimization");
    println!("  GET  /api/runs                - Stored runs (paginated)");
    println!("  GET  /api/runs/:id            - One run with its windows");
    println!("  GET  /api/stats               - Stored run statistics");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Run command - CLI mode (no web server)
// ============================================================================

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let export = args.export.clone();
    let save = !args.no_save;
    let request = args.into_request()?;

    println!("\n=== Walkforge v{} ===", APP_VERSION);
    println!("Strategy: {} | Metric: {}", request.strategy, request.metric);
    match &request.data_file {
        Some(path) => println!("Data: {} ({})", path, request.config.series.interval),
        None => println!(
            "Data: {} {} x {} days (Binance)",
            request.symbol(),
            request.config.series.interval,
            request.days
        ),
    }
    let c = &request.config;
    println!(
        "Windows: train {} / test {} / step {}{} | GA: pop {} x {} gen | seed {}",
        c.windows.train_len,
        c.windows.test_len,
        c.windows.step,
        if c.windows.anchored { " (anchored)" } else { "" },
        c.search.population_size,
        c.search.generations,
        c.seed
    );
    println!();

    let db = if save { Some(open_db(&db_path()).await?) } else { None };
    let binance = BinanceClient::new()?;
    let progress = Arc::new(OptimizeProgress::new());
    progress.reset(request.label());

    // Ctrl+C stops the search at the next generation and keeps the partial report
    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    // Progress display loop
    let progress_for_display = progress.clone();
    let display = tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            let status = *progress_for_display.status.read().unwrap();
            if status != OptimizeStatus::Running {
                break;
            }
            let total = progress_for_display.total_windows.load(Ordering::Relaxed);
            if total == 0 {
                print!("\r  Loading market data...                    ");
                continue;
            }
            let done = progress_for_display.completed_windows.load(Ordering::Relaxed);
            let generations = progress_for_display.generations_done.load(Ordering::Relaxed);
            let pct = progress_for_display.progress_pct();

            let bar_len = 30;
            let filled = (pct as usize * bar_len) / 100;
            let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
            print!(
                "\r  Windows [{}] {:.0}% ({}/{}) | {} generations   ",
                bar, pct, done, total, generations
            );
        }
    });

    let result = job::execute(request, &binance, db.as_ref(), progress.clone()).await;
    let _ = display.await;
    println!();

    let (report, saved) = result?;
    print_report(&report);

    match saved {
        Some(SaveOutcome::Inserted(id)) => println!("\nSaved as run #{}", id),
        Some(SaveOutcome::Duplicate(id)) => println!("\nIdentical run already stored as #{}", id),
        None => {}
    }

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&export_path, &json)?;
        println!("Report exported to {}", export_path);
    }

    Ok(())
}

fn fmt_score(score: Option<f64>) -> String {
    score.map(|s| format!("{:+.3}", s)).unwrap_or_else(|| "n/a".to_string())
}

fn print_report(report: &OptimizationReport) {
    let s = report.summary();
    println!("\nWalk-forward summary{}:", if report.is_partial() { " (PARTIAL)" } else { "" });
    println!(
        "  Windows: {}/{} completed, {} scored",
        s.windows_completed, s.windows_planned, s.windows_scored
    );
    println!(
        "  OOS fitness: mean {} | std {} | consistency {:.0}%",
        fmt_score(s.mean_oos_fitness),
        fmt_score(s.std_oos_fitness),
        s.consistency_ratio * 100.0
    );
    println!(
        "  IS fitness: mean {} | mean gap {}",
        fmt_score(s.mean_is_fitness),
        fmt_score(s.mean_overfitting_gap)
    );

    println!("\n  {:>3}  {:>6}  {:>9}  {:>9}  Parameters", "#", "Window", "IS", "OOS");
    println!("  {}", "-".repeat(70));
    for r in report.ranked().iter().take(10) {
        println!(
            "  {:>3}  {:>6}  {:>9}  {:>9}  {}",
            r.rank,
            r.window_index,
            fmt_score(r.in_sample_fitness),
            fmt_score(r.out_of_sample_fitness),
            r.params
        );
    }

    if !report.stability().is_empty() {
        println!("\n  Parameter stability:");
        for p in report.stability() {
            let cv = p
                .coefficient_of_variation
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "n/a".to_string());
            println!("    {:<16} mean {:>10.3}  std {:>9.3}  cv {}", p.name, p.mean, p.std, cv);
        }
    }
    println!("\n  Fingerprint: {}", report.fingerprint());
}

// ============================================================================
// Runs / prune commands
// ============================================================================

async fn cmd_runs(limit: i64) -> anyhow::Result<()> {
    let db = open_db(&db_path()).await?;
    let repo = RunRepository::new(db.pool());
    let runs = repo
        .list_runs(limit, 0)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {}", e))?;

    if runs.is_empty() {
        println!("No stored runs.");
        return Ok(());
    }

    println!(
        "  {:>4}  {:<32} {:>8} {:>10} {:>7}  {}",
        "ID", "Label", "Windows", "Mean OOS", "Cons%", "Fingerprint"
    );
    println!("  {}", "-".repeat(90));
    for r in runs {
        println!(
            "  {:>4}  {:<32} {:>8} {:>10} {:>6.0}%  {}{}",
            r.id,
            r.label,
            r.windows_completed,
            fmt_score(r.mean_oos_fitness),
            r.consistency_ratio * 100.0,
            &r.fingerprint[..12.min(r.fingerprint.len())],
            if r.partial { " (partial)" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_prune(keep: i64) -> anyhow::Result<()> {
    info!("Walkforge DB prune - keeping the {} most recent runs", keep);

    let db_path = db_path();
    let db = open_db(&db_path).await?;
    info!("Database opened: {}", db_path);

    let repo = RunRepository::new(db.pool());
    let (deleted, remaining) = repo
        .prune_keep_latest(keep)
        .await
        .map_err(|e| anyhow::anyhow!("Prune failed: {}", e))?;

    info!("Running VACUUM to reclaim disk space...");
    repo.vacuum()
        .await
        .map_err(|e| anyhow::anyhow!("VACUUM failed: {}", e))?;

    info!("Done! Deleted {} runs, {} remaining.", deleted, remaining);
    Ok(())
}

// ============================================================================
// API Handlers - Optimization
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "walkforge",
        "version": APP_VERSION,
    }))
}

/// POST /api/optimize - start a walk-forward optimization in background
async fn api_start_optimization(
    State(state): State<AppState>,
    Json(request): Json<OptimizeRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.optimize_progress.is_running() {
        let pct = state.optimize_progress.progress_pct();
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("Optimization already in progress ({:.0}% complete)", pct),
        })));
    }

    if let Err(e) = request.validate() {
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": e.to_string(),
        })));
    }

    let label = request.label();
    info!(label = %label, "Starting walk-forward optimization");

    // Mark running before returning so a second request sees it
    state.optimize_progress.reset(label.clone());

    let progress = state.optimize_progress.clone();
    tokio::spawn(async move {
        if let Err(e) = job::execute(request, &state.binance, Some(state.db.as_ref()), progress).await {
            warn!(error = %e, "Background optimization failed");
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Optimization started: {}", label),
    })))
}

/// GET /api/optimize/status - poll optimization progress
async fn api_optimize_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.optimize_progress;
    let status = *progress.status.read().unwrap();
    let total = progress.total_windows.load(Ordering::Relaxed);
    let completed = progress.completed_windows.load(Ordering::Relaxed);
    let generations = progress.generations_done.load(Ordering::Relaxed);
    let pct = progress.progress_pct();
    let report = progress.report.read().unwrap().clone();
    let error = progress.error_message.read().unwrap().clone();
    let label = progress.label.read().unwrap().clone();

    Json(serde_json::json!({
        "status": status,
        "label": label,
        "progress_pct": pct,
        "completed_windows": completed,
        "total_windows": total,
        "generations": generations,
        "report": report,
        "error": error,
    }))
}

/// POST /api/optimize/cancel - stop at the next generation, keep the partial report
async fn api_cancel_optimization(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.optimize_progress.cancel();
    info!("Optimization cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}

// ============================================================================
// API Handlers - Stored runs
// ============================================================================

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/runs - stored runs, newest first
async fn api_list_runs(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Json<serde_json::Value> {
    let limit = page.limit.unwrap_or(20).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);

    let repo = RunRepository::new(state.db.pool());
    match repo.list_runs(limit, offset).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "limit": limit,
            "offset": offset,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to list runs: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/runs/:id - one run with its report and windows
async fn api_get_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let repo = RunRepository::new(state.db.pool());
    let run = repo.get_run(id).await.map_err(|e| {
        error!("Failed to load run {}: {}", id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let Some(run) = run else {
        return Err(StatusCode::NOT_FOUND);
    };
    let windows = repo.get_windows(id).await.map_err(|e| {
        error!("Failed to load windows of run {}: {}", id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let report: Option<OptimizationReport> = serde_json::from_str(&run.report_json).ok();
    let config: Option<serde_json::Value> = serde_json::from_str(&run.config_json).ok();

    Ok(Json(serde_json::json!({
        "success": true,
        "id": run.id,
        "label": run.label,
        "fingerprint": run.fingerprint,
        "created_at": run.created_at,
        "elapsed_ms": run.elapsed_ms,
        "request": config,
        "report": report,
        "windows": windows,
    })))
}

/// GET /api/stats - aggregate statistics over stored runs
async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let repo = RunRepository::new(state.db.pool());
    match repo.get_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "success": true,
            "stats": stats,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to get run stats: {}", e),
        })),
    }
}
