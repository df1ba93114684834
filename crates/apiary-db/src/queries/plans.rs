//! Query functions for the `planning_queue` and `execution_plans` tables.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::StoreResult;
use crate::error::StoreError;
use crate::models::{
    ExecutionPlan, PlanData, PlanStatus, PlanningRequest, TASK_TYPE_PLANNED_SUBTASK,
};

/// Enqueue a free-form request for the external planner.
pub async fn insert_planning_request(
    pool: &SqlitePool,
    task_description: &str,
    priority: i64,
    requestor: Option<&str>,
    context_data: Option<&serde_json::Value>,
) -> StoreResult<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO planning_queue (id, task_description, priority, requestor, context_data, \
                                     status, created_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', ?)",
    )
    .bind(&id)
    .bind(task_description)
    .bind(priority)
    .bind(requestor)
    .bind(context_data.map(|c| sqlx::types::Json(c.clone())))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Newly pending planning requests, highest priority first (at most 10).
pub async fn monitor_planning_queue_changes(
    pool: &SqlitePool,
) -> StoreResult<Vec<PlanningRequest>> {
    let requests = sqlx::query_as::<_, PlanningRequest>(
        "SELECT * FROM planning_queue \
         WHERE status = 'pending' \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 10",
    )
    .fetch_all(pool)
    .await?;
    Ok(requests)
}

/// Insert an execution plan. Subtask and dependency counts are derived
/// from the plan data.
pub async fn create_execution_plan(
    pool: &SqlitePool,
    planning_task_id: &str,
    plan_data: &PlanData,
    status: PlanStatus,
) -> StoreResult<String> {
    let id = Uuid::new_v4().to_string();
    let subtask_count = plan_data.sub_tasks.len() as i64;
    let dependency_count: i64 = plan_data
        .sub_tasks
        .iter()
        .map(|s| s.dependencies.len() as i64)
        .sum();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO execution_plans (id, planning_task_id, plan_data, subtask_count, \
                                      dependency_count, status, generated_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(planning_task_id)
    .bind(sqlx::types::Json(plan_data.clone()))
    .bind(subtask_count)
    .bind(dependency_count)
    .bind(status)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(plan_id = %id, subtask_count, "execution plan created");
    Ok(id)
}

/// Fetch a plan by id.
pub async fn get_execution_plan(
    pool: &SqlitePool,
    plan_id: &str,
) -> StoreResult<Option<ExecutionPlan>> {
    let plan = sqlx::query_as::<_, ExecutionPlan>("SELECT * FROM execution_plans WHERE id = ?")
        .bind(plan_id)
        .fetch_optional(pool)
        .await?;
    Ok(plan)
}

/// Fetch just the status column of a plan.
pub async fn get_execution_plan_status(
    pool: &SqlitePool,
    plan_id: &str,
) -> StoreResult<Option<PlanStatus>> {
    let status: Option<PlanStatus> =
        sqlx::query_scalar("SELECT status FROM execution_plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(pool)
            .await?;
    Ok(status)
}

/// Transition a plan `generated|approved -> executing`. Idempotent: returns
/// true when the plan is executing after the call, whether or not this call
/// performed the transition.
pub async fn mark_plan_execution_started(pool: &SqlitePool, plan_id: &str) -> StoreResult<bool> {
    let result = sqlx::query(
        "UPDATE execution_plans \
         SET status = 'executing', updated_at = ? \
         WHERE id = ? AND status IN ('generated', 'approved')",
    )
    .bind(Utc::now())
    .bind(plan_id)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(true);
    }
    Ok(get_execution_plan_status(pool, plan_id).await? == Some(PlanStatus::Executing))
}

/// Materialize the plan's subtasks into the task queue.
///
/// Each `sub_tasks` entry becomes a `planned_subtask` task with id
/// `subtask_<plan_id>_<sub_id>` carrying the plan reference and dependency
/// list in its payload. Entries already materialized are skipped. The whole
/// batch is inserted in one transaction. Returns the number created.
pub async fn create_planned_subtasks_from_plan(
    pool: &SqlitePool,
    plan_id: &str,
) -> StoreResult<u64> {
    let Some(plan) = get_execution_plan(pool, plan_id).await? else {
        return Err(StoreError::NotFound(format!("plan {plan_id}")));
    };

    let mut tx = pool.begin().await?;
    let mut created = 0u64;
    let now = Utc::now();

    for sub in &plan.plan_data.0.sub_tasks {
        let task_id = format!("subtask_{plan_id}_{}", sub.id);

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
            .bind(&task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            continue;
        }

        let assignee = sub.assignee.clone().unwrap_or_else(|| "worker:backend".to_owned());
        let payload = serde_json::json!({
            "parent_plan_id": plan_id,
            "subtask_id": &sub.id,
            "complexity": sub.complexity.clone().unwrap_or_else(|| "medium".to_owned()),
            "estimated_duration": sub.estimated_duration.unwrap_or(30),
            "workflow_phase": sub.workflow_phase.clone().unwrap_or_else(|| "implementation".to_owned()),
            "required_skills": &sub.required_skills,
            "deliverables": &sub.deliverables,
            "dependencies": &sub.dependencies,
            "assignee": &assignee,
        });

        sqlx::query(
            "INSERT INTO tasks (id, title, description, task_type, priority, status, \
                                current_phase, assignee, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 'queued', 'start', ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(sub.title.as_deref().unwrap_or("Planned Subtask"))
        .bind(sub.description.as_deref().unwrap_or(""))
        .bind(TASK_TYPE_PLANNED_SUBTASK)
        .bind(sub.priority.unwrap_or(50))
        .bind(&assignee)
        .bind(sqlx::types::Json(payload))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        created += 1;
    }

    tx.commit().await?;

    tracing::info!(plan_id = %plan_id, created, "materialized planned subtasks");
    Ok(created)
}

/// Rewrite a plan's embedded data and status.
pub async fn update_plan_data(
    pool: &SqlitePool,
    plan_id: &str,
    plan_data: &PlanData,
    status: PlanStatus,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE execution_plans SET plan_data = ?, status = ?, updated_at = ? WHERE id = ?",
    )
    .bind(sqlx::types::Json(plan_data.clone()))
    .bind(status)
    .bind(Utc::now())
    .bind(plan_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("plan {plan_id}")));
    }
    Ok(())
}

/// Plans in a live (non-terminal, non-draft) state, for status displays.
pub async fn list_active_plans(pool: &SqlitePool) -> StoreResult<Vec<ExecutionPlan>> {
    let plans = sqlx::query_as::<_, ExecutionPlan>(
        "SELECT * FROM execution_plans \
         WHERE status IN ('generated', 'approved', 'executing') \
         ORDER BY generated_at ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(plans)
}

/// Delete completed plans older than `max_age_days`, removing their
/// planned subtasks first (foreign-key-safe order). Returns the number of
/// plans deleted.
pub async fn cleanup_completed_plans(pool: &SqlitePool, max_age_days: i64) -> StoreResult<u64> {
    let cutoff = Utc::now() - Duration::days(max_age_days);

    let mut tx = pool.begin().await?;

    let plan_ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM execution_plans WHERE status = 'completed' AND updated_at < ?",
    )
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await?;

    if plan_ids.is_empty() {
        tx.commit().await?;
        return Ok(0);
    }

    let placeholders = vec!["?"; plan_ids.len()].join(", ");

    let subtask_sql = format!(
        "DELETE FROM tasks \
         WHERE task_type = '{TASK_TYPE_PLANNED_SUBTASK}' \
           AND json_extract(payload, '$.parent_plan_id') IN ({placeholders})"
    );
    let mut subtask_query = sqlx::query(&subtask_sql);
    for id in &plan_ids {
        subtask_query = subtask_query.bind(id);
    }
    let subtasks_deleted = subtask_query.execute(&mut *tx).await?.rows_affected();

    let plan_sql = format!("DELETE FROM execution_plans WHERE id IN ({placeholders})");
    let mut plan_query = sqlx::query(&plan_sql);
    for id in &plan_ids {
        plan_query = plan_query.bind(id);
    }
    let plans_deleted = plan_query.execute(&mut *tx).await?.rows_affected();

    tx.commit().await?;

    tracing::info!(plans_deleted, subtasks_deleted, "cleaned up completed plans");
    Ok(plans_deleted)
}
