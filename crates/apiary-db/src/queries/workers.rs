//! Query functions for the `workers` table: registration and heartbeats.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::StoreResult;
use crate::error::StoreError;
use crate::models::{WorkerRecord, WorkerRole, WorkerStatus};

/// Register a worker or refresh an existing registration (upsert).
pub async fn register_worker(
    pool: &SqlitePool,
    worker_id: &str,
    role: WorkerRole,
    capabilities: &[String],
    metadata: Option<&serde_json::Value>,
) -> StoreResult<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO workers (id, role, status, capabilities, metadata, last_heartbeat, registered_at) \
         VALUES (?, ?, 'active', ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
             role = excluded.role, \
             status = 'active', \
             capabilities = excluded.capabilities, \
             metadata = excluded.metadata, \
             last_heartbeat = excluded.last_heartbeat",
    )
    .bind(worker_id)
    .bind(role)
    .bind(sqlx::types::Json(capabilities.to_vec()))
    .bind(metadata.map(|m| sqlx::types::Json(m.clone())))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(worker_id, role = %role, "worker registered");
    Ok(())
}

/// Refresh a worker's heartbeat, optionally updating its status.
pub async fn update_worker_heartbeat(
    pool: &SqlitePool,
    worker_id: &str,
    status: Option<WorkerStatus>,
) -> StoreResult<()> {
    let result = match status {
        Some(status) => {
            sqlx::query("UPDATE workers SET last_heartbeat = ?, status = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(status)
                .bind(worker_id)
                .execute(pool)
                .await?
        }
        None => {
            sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(worker_id)
                .execute(pool)
                .await?
        }
    };
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("worker {worker_id}")));
    }
    Ok(())
}

/// Active workers, optionally filtered by role, most recently seen first.
pub async fn get_active_workers(
    pool: &SqlitePool,
    role: Option<WorkerRole>,
) -> StoreResult<Vec<WorkerRecord>> {
    let workers = match role {
        Some(role) => {
            sqlx::query_as::<_, WorkerRecord>(
                "SELECT * FROM workers \
                 WHERE role = ? AND status = 'active' \
                 ORDER BY last_heartbeat DESC",
            )
            .bind(role)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, WorkerRecord>(
                "SELECT * FROM workers WHERE status = 'active' ORDER BY last_heartbeat DESC",
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(workers)
}
