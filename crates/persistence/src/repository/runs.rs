//! Optimization run repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

/// A persisted optimization run, including the full report JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub fingerprint: String,
    pub label: String,
    pub strategy: String,
    pub metric: String,
    pub symbol: Option<String>,
    pub interval: String,
    pub seed: i64,
    pub windows_planned: i64,
    pub windows_completed: i64,
    pub windows_scored: i64,
    pub mean_oos_fitness: Option<f64>,
    pub std_oos_fitness: Option<f64>,
    pub consistency_ratio: f64,
    pub partial: bool,
    pub config_json: String,
    pub report_json: String,
    pub elapsed_ms: Option<i64>,
    pub created_at: Option<i64>,
}

/// Listing row without the JSON payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunSummaryRecord {
    pub id: i64,
    pub fingerprint: String,
    pub label: String,
    pub strategy: String,
    pub metric: String,
    pub symbol: Option<String>,
    pub interval: String,
    pub windows_completed: i64,
    pub windows_scored: i64,
    pub mean_oos_fitness: Option<f64>,
    pub consistency_ratio: f64,
    pub partial: bool,
    pub created_at: Option<i64>,
}

/// One window of a run. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WindowRecord {
    pub id: Option<i64>,
    pub run_id: i64,
    pub window_index: i64,
    pub train_start: i64,
    pub train_end: i64,
    pub test_start: i64,
    pub test_end: i64,
    pub params_json: String,
    pub in_sample_fitness: Option<f64>,
    pub out_of_sample_fitness: Option<f64>,
    pub overfitting_gap: Option<f64>,
    pub generations_run: i64,
    pub termination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(i64),
    /// A run with the same fingerprint was already stored
    Duplicate(i64),
}

impl SaveOutcome {
    pub fn id(&self) -> i64 {
        match self {
            SaveOutcome::Inserted(id) | SaveOutcome::Duplicate(id) => *id,
        }
    }
}

/// Aggregate statistics about stored runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub total_runs: i64,
    pub total_windows: i64,
    pub partial_runs: i64,
    pub best_mean_oos_fitness: Option<f64>,
    pub best_label: Option<String>,
}

/// Repository for optimization runs and their windows
pub struct RunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a run and its windows in one transaction. Runs are
    /// content-addressed: saving the same fingerprint twice is a no-op.
    pub async fn save_run(&self, run: &RunRecord, windows: &[WindowRecord]) -> DbResult<SaveOutcome> {
        if let Some(existing) = self.find_id_by_fingerprint(&run.fingerprint).await? {
            debug!(id = existing, fingerprint = %run.fingerprint, "Run already stored");
            return Ok(SaveOutcome::Duplicate(existing));
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO optimization_runs (
                fingerprint, label, strategy, metric, symbol, interval, seed,
                windows_planned, windows_completed, windows_scored,
                mean_oos_fitness, std_oos_fitness, consistency_ratio, partial,
                config_json, report_json, elapsed_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(&run.fingerprint)
        .bind(&run.label)
        .bind(&run.strategy)
        .bind(&run.metric)
        .bind(&run.symbol)
        .bind(&run.interval)
        .bind(run.seed)
        .bind(run.windows_planned)
        .bind(run.windows_completed)
        .bind(run.windows_scored)
        .bind(run.mean_oos_fitness)
        .bind(run.std_oos_fitness)
        .bind(run.consistency_ratio)
        .bind(run.partial)
        .bind(&run.config_json)
        .bind(&run.report_json)
        .bind(run.elapsed_ms)
        .execute(&mut *tx)
        .await?;
        let run_id = result.last_insert_rowid();

        for w in windows {
            sqlx::query(
                r#"
                INSERT INTO window_results (
                    run_id, window_index, train_start, train_end, test_start, test_end,
                    params_json, in_sample_fitness, out_of_sample_fitness, overfitting_gap,
                    generations_run, termination
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(run_id)
            .bind(w.window_index)
            .bind(w.train_start)
            .bind(w.train_end)
            .bind(w.test_start)
            .bind(w.test_end)
            .bind(&w.params_json)
            .bind(w.in_sample_fitness)
            .bind(w.out_of_sample_fitness)
            .bind(w.overfitting_gap)
            .bind(w.generations_run)
            .bind(&w.termination)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(id = run_id, windows = windows.len(), label = %run.label, "Saved optimization run");
        Ok(SaveOutcome::Inserted(run_id))
    }

    async fn find_id_by_fingerprint(&self, fingerprint: &str) -> DbResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM optimization_runs WHERE fingerprint = ?1")
            .bind(fingerprint)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn get_run(&self, id: i64) -> DbResult<Option<RunRecord>> {
        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM optimization_runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_by_fingerprint(&self, fingerprint: &str) -> DbResult<Option<RunRecord>> {
        let record =
            sqlx::query_as::<_, RunRecord>("SELECT * FROM optimization_runs WHERE fingerprint = ?1")
                .bind(fingerprint)
                .fetch_optional(self.pool)
                .await?;
        Ok(record)
    }

    /// Newest first
    pub async fn list_runs(&self, limit: i64, offset: i64) -> DbResult<Vec<RunSummaryRecord>> {
        let records = sqlx::query_as::<_, RunSummaryRecord>(
            r#"
            SELECT id, fingerprint, label, strategy, metric, symbol, interval,
                   windows_completed, windows_scored, mean_oos_fitness,
                   consistency_ratio, partial, created_at
            FROM optimization_runs
            ORDER BY created_at DESC, id DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn get_windows(&self, run_id: i64) -> DbResult<Vec<WindowRecord>> {
        let records = sqlx::query_as::<_, WindowRecord>(
            "SELECT * FROM window_results WHERE run_id = ?1 ORDER BY window_index ASC",
        )
        .bind(run_id)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Keep the `keep` newest runs, delete the rest with their windows.
    /// Returns (deleted, remaining).
    pub async fn prune_keep_latest(&self, keep: i64) -> DbResult<(u64, i64)> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM optimization_runs WHERE id NOT IN (
                SELECT id FROM optimization_runs
                ORDER BY created_at DESC, id DESC
                LIMIT ?1
            )
            "#,
        )
        .bind(keep.max(0))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Foreign keys are enforced per connection; do not rely on the cascade
        sqlx::query("DELETE FROM window_results WHERE run_id NOT IN (SELECT id FROM optimization_runs)")
            .execute(&mut *tx)
            .await?;

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs")
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(deleted, remaining = remaining.0, "Pruned optimization runs");
        Ok((deleted, remaining.0))
    }

    /// Reclaim disk space after deletes
    pub async fn vacuum(&self) -> DbResult<()> {
        sqlx::query("VACUUM").execute(self.pool).await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> DbResult<RunStats> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs")
            .fetch_one(self.pool)
            .await?;

        let windows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM window_results")
            .fetch_one(self.pool)
            .await?;

        let partial: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs WHERE partial = 1")
            .fetch_one(self.pool)
            .await?;

        let best: Option<(f64, String)> = sqlx::query_as(
            r#"
            SELECT mean_oos_fitness, label
            FROM optimization_runs
            WHERE mean_oos_fitness IS NOT NULL
            ORDER BY mean_oos_fitness DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool)
        .await?;

        Ok(RunStats {
            total_runs: total.0,
            total_windows: windows.0,
            partial_runs: partial.0,
            best_mean_oos_fitness: best.as_ref().map(|b| b.0),
            best_label: best.map(|b| b.1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn run(fingerprint: &str, mean_oos: Option<f64>) -> RunRecord {
        RunRecord {
            id: None,
            fingerprint: fingerprint.to_string(),
            label: format!("EMA Crossover {fingerprint}"),
            strategy: "ema_crossover".to_string(),
            metric: "sharpe".to_string(),
            symbol: Some("BTCUSDT".to_string()),
            interval: "1d".to_string(),
            seed: 42,
            windows_planned: 2,
            windows_completed: 2,
            windows_scored: 1,
            mean_oos_fitness: mean_oos,
            std_oos_fitness: Some(0.0),
            consistency_ratio: 0.5,
            partial: false,
            config_json: "{}".to_string(),
            report_json: "{}".to_string(),
            elapsed_ms: Some(1500),
            created_at: None,
        }
    }

    fn window(index: i64, oos: Option<f64>) -> WindowRecord {
        WindowRecord {
            id: None,
            run_id: 0,
            window_index: index,
            train_start: index * 100,
            train_end: index * 100 + 79,
            test_start: index * 100 + 80,
            test_end: index * 100 + 99,
            params_json: r#"{"fast_period":5.0,"slow_period":30.0}"#.to_string(),
            in_sample_fitness: Some(1.2),
            out_of_sample_fitness: oos,
            overfitting_gap: oos.map(|o| 1.2 - o),
            generations_run: 10,
            termination: "completed".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        let outcome = repo
            .save_run(&run("abc", Some(0.4)), &[window(1, None), window(0, Some(0.4))])
            .await
            .unwrap();
        let id = match outcome {
            SaveOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        let stored = repo.get_run(id).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, "abc");
        assert_eq!(stored.mean_oos_fitness, Some(0.4));
        assert!(!stored.partial);
        assert_eq!(stored.elapsed_ms, Some(1500));
        assert!(stored.created_at.is_some());

        let windows = repo.get_windows(id).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window_index, 0);
        assert_eq!(windows[0].run_id, id);
        assert_eq!(windows[1].out_of_sample_fitness, None);

        assert!(repo.get_run(id + 100).await.unwrap().is_none());
        assert_eq!(repo.get_by_fingerprint("abc").await.unwrap().unwrap().id, Some(id));
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        let first = repo.save_run(&run("same", None), &[window(0, None)]).await.unwrap();
        let second = repo.save_run(&run("same", None), &[window(0, None)]).await.unwrap();
        assert_eq!(second, SaveOutcome::Duplicate(first.id()));

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.total_windows, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());
        for fp in ["a", "b", "c"] {
            repo.save_run(&run(fp, Some(0.1)), &[]).await.unwrap();
        }

        let listed = repo.list_runs(2, 0).await.unwrap();
        let fps: Vec<&str> = listed.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(fps, vec!["c", "b"]);
        assert_eq!(repo.list_runs(10, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_latest() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());
        for fp in ["a", "b", "c", "d"] {
            repo.save_run(&run(fp, Some(0.1)), &[window(0, Some(0.1)), window(1, Some(0.2))])
                .await
                .unwrap();
        }

        let (deleted, remaining) = repo.prune_keep_latest(1).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(remaining, 1);

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.total_windows, 2);
        assert_eq!(repo.list_runs(10, 0).await.unwrap()[0].fingerprint, "d");

        repo.vacuum().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_pick_best_run() {
        let db = Database::in_memory().await.unwrap();
        let repo = RunRepository::new(db.pool());

        let empty = repo.get_stats().await.unwrap();
        assert_eq!(empty.total_runs, 0);
        assert_eq!(empty.best_mean_oos_fitness, None);

        repo.save_run(&run("low", Some(-0.5)), &[]).await.unwrap();
        repo.save_run(&run("high", Some(1.5)), &[]).await.unwrap();
        repo.save_run(&run("none", None), &[]).await.unwrap();
        let mut partial = run("cut", Some(0.2));
        partial.partial = true;
        repo.save_run(&partial, &[]).await.unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.partial_runs, 1);
        assert_eq!(stats.best_mean_oos_fitness, Some(1.5));
        assert_eq!(stats.best_label.as_deref(), Some("EMA Crossover high"));
    }
}
