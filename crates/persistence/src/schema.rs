//! Database schema
//!
//! Full reports are kept as JSON; the summary columns exist for listing and
//! sorting. Statements run in order on every open.

pub const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS optimization_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        label TEXT NOT NULL,
        strategy TEXT NOT NULL,
        metric TEXT NOT NULL,
        symbol TEXT,
        interval TEXT NOT NULL,
        seed INTEGER NOT NULL,
        windows_planned INTEGER NOT NULL,
        windows_completed INTEGER NOT NULL,
        windows_scored INTEGER NOT NULL,
        mean_oos_fitness REAL,
        std_oos_fitness REAL,
        consistency_ratio REAL NOT NULL DEFAULT 0,
        partial INTEGER NOT NULL DEFAULT 0,
        config_json TEXT NOT NULL,
        report_json TEXT NOT NULL,
        elapsed_ms INTEGER,
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS window_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES optimization_runs(id) ON DELETE CASCADE,
        window_index INTEGER NOT NULL,
        train_start INTEGER NOT NULL,
        train_end INTEGER NOT NULL,
        test_start INTEGER NOT NULL,
        test_end INTEGER NOT NULL,
        params_json TEXT NOT NULL,
        in_sample_fitness REAL,
        out_of_sample_fitness REAL,
        overfitting_gap REAL,
        generations_run INTEGER NOT NULL,
        termination TEXT NOT NULL,
        UNIQUE(run_id, window_index)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_runs_created ON optimization_runs(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_runs_strategy ON optimization_runs(strategy, symbol)",
];
