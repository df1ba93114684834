//! Query functions for the `runs` table: the per-attempt execution ledger.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::StoreResult;
use crate::error::StoreError;
use crate::models::{Run, RunStatus, RunWithResult};

/// Create a run for a task. Assigns `run_number = MAX(existing) + 1` inside
/// a transaction; the `(task_id, run_number)` uniqueness constraint turns a
/// lost race into a conflict instead of a gap.
pub async fn create_run(
    pool: &SqlitePool,
    task_id: &str,
    worker_id: &str,
    phase: &str,
) -> StoreResult<String> {
    let run_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    let run_number: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query(
        "INSERT INTO runs (id, task_id, worker_id, run_number, phase, status, started_at) \
         VALUES (?, ?, ?, ?, ?, 'running', ?)",
    )
    .bind(&run_id)
    .bind(task_id)
    .bind(worker_id)
    .bind(run_number)
    .bind(phase)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(run_id = %run_id, task_id = %task_id, worker_id, run_number, "run created");
    Ok(run_id)
}

/// Update run status and execution details. Terminal statuses set
/// `completed_at`.
#[allow(clippy::too_many_arguments)]
pub async fn update_run_status(
    pool: &SqlitePool,
    run_id: &str,
    status: RunStatus,
    phase: Option<&str>,
    result_data: Option<&serde_json::Value>,
    error_message: Option<&str>,
    output_log: Option<&str>,
    transcript: Option<&str>,
) -> StoreResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE runs SET status = ");
    qb.push_bind(status);
    if status.is_terminal() {
        qb.push(", completed_at = ");
        qb.push_bind(Utc::now());
    }
    if let Some(phase) = phase {
        qb.push(", phase = ");
        qb.push_bind(phase.to_owned());
    }
    if let Some(data) = result_data {
        qb.push(", result_data = ");
        qb.push_bind(sqlx::types::Json(data.clone()));
    }
    if let Some(msg) = error_message {
        qb.push(", error_message = ");
        qb.push_bind(msg.to_owned());
    }
    if let Some(log) = output_log {
        qb.push(", output_log = ");
        qb.push_bind(log.to_owned());
    }
    if let Some(t) = transcript {
        qb.push(", transcript = ");
        qb.push_bind(t.to_owned());
    }
    qb.push(" WHERE id = ");
    qb.push_bind(run_id.to_owned());

    let result = qb.build().execute(pool).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("run {run_id}")));
    }
    tracing::info!(run_id = %run_id, status = %status, "run status updated");
    Ok(())
}

/// Fetch a run together with the synthesized `result` view.
pub async fn get_run(pool: &SqlitePool, run_id: &str) -> StoreResult<Option<RunWithResult>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(run.map(RunWithResult::from))
}

/// All runs for a task, ordered by run number.
pub async fn get_task_runs(pool: &SqlitePool, task_id: &str) -> StoreResult<Vec<Run>> {
    let runs =
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE task_id = ? ORDER BY run_number ASC")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
    Ok(runs)
}

/// The most recent run for a task, if any.
pub async fn get_latest_run(pool: &SqlitePool, task_id: &str) -> StoreResult<Option<Run>> {
    let run = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE task_id = ? ORDER BY run_number DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    Ok(run)
}

/// Runs for a task that are still in a non-terminal status.
pub async fn get_open_runs(pool: &SqlitePool, task_id: &str) -> StoreResult<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE task_id = ? AND status IN ('pending', 'running') \
         ORDER BY run_number ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}
