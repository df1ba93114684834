//! Query functions for the `tasks` table: creation, queue pulls, status
//! transitions, dependency resolution, and the additive schema guard.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::StoreResult;
use crate::error::StoreError;
use crate::models::{Task, TaskStatus, Workflow};

/// Optional fields settable alongside a status update.
///
/// `Some(None)` on a double-option field clears the column; `None` leaves it
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub assignee: Option<Option<String>>,
    pub assigned_at: Option<Option<DateTime<Utc>>>,
    pub current_phase: Option<String>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub failure_reason: Option<String>,
    pub retry_count: Option<i64>,
    pub worktree: Option<String>,
    pub workspace_type: Option<String>,
}

impl TaskPatch {
    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(Some(assignee.into()));
        self
    }

    pub fn assigned_now(mut self) -> Self {
        self.assigned_at = Some(Some(Utc::now()));
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Some(Utc::now()));
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn retry_count(mut self, count: i64) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Clear assignment bookkeeping (assignee, assigned_at, started_at).
    pub fn clear_assignment(mut self) -> Self {
        self.assignee = Some(None);
        self.assigned_at = Some(None);
        self.started_at = Some(None);
        self
    }

    fn apply(self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(v) = self.assignee {
            qb.push(", assignee = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.assigned_at {
            qb.push(", assigned_at = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.current_phase {
            qb.push(", current_phase = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.started_at {
            qb.push(", started_at = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.failure_reason {
            qb.push(", failure_reason = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.retry_count {
            qb.push(", retry_count = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.worktree {
            qb.push(", worktree = ");
            qb.push_bind(v);
        }
        if let Some(v) = self.workspace_type {
            qb.push(", workspace_type = ");
            qb.push_bind(v);
        }
    }
}

/// Insert a new task row. Returns the generated task id.
#[allow(clippy::too_many_arguments)]
pub async fn create_task(
    pool: &SqlitePool,
    title: &str,
    task_type: &str,
    description: &str,
    workflow: Option<&Workflow>,
    payload: Option<&serde_json::Value>,
    priority: i64,
    max_retries: i64,
    tags: &[String],
    current_phase: &str,
) -> StoreResult<String> {
    let task_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO tasks (id, title, description, task_type, priority, current_phase, \
                            workflow, payload, max_retries, tags, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task_id)
    .bind(title)
    .bind(description)
    .bind(task_type)
    .bind(priority)
    .bind(current_phase)
    .bind(workflow.map(|w| sqlx::types::Json(w.clone())))
    .bind(payload.map(|p| sqlx::types::Json(p.clone())))
    .bind(max_retries)
    .bind(if tags.is_empty() {
        None
    } else {
        Some(sqlx::types::Json(tags.to_vec()))
    })
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(task_id = %task_id, title, "task created");
    Ok(task_id)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, id: &str) -> StoreResult<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(task)
}

/// All tasks with the given status, oldest first.
pub async fn get_tasks_by_status(pool: &SqlitePool, status: TaskStatus) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

/// All tasks, oldest first (for `apiary list`).
pub async fn list_tasks(pool: &SqlitePool) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC, rowid ASC")
        .fetch_all(pool)
        .await?;
    Ok(tasks)
}

/// Task counts grouped by status (for `apiary status`).
pub async fn count_tasks_by_status(pool: &SqlitePool) -> StoreResult<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

/// Queued tasks ordered by raw priority. This variant never boosts
/// planned-subtask priority.
pub async fn get_queued_tasks(
    pool: &SqlitePool,
    limit: i64,
    task_type: Option<&str>,
) -> StoreResult<Vec<Task>> {
    let tasks = match task_type {
        Some(tt) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks \
                 WHERE status = 'queued' AND task_type = ? \
                 ORDER BY priority DESC, created_at ASC, rowid ASC \
                 LIMIT ?",
            )
            .bind(tt)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks \
                 WHERE status = 'queued' \
                 ORDER BY priority DESC, created_at ASC, rowid ASC \
                 LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(tasks)
}

/// A queued candidate with its dependency gate pre-resolved.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub dependencies_met: bool,
}

/// Scheduling pull used by the queen: queued tasks plus planned subtasks
/// whose parent plan is live ({generated, approved, executing}).
///
/// Planned subtasks get a +10 priority boost in the ordering (only here;
/// the stored priority is untouched), and every returned row carries a
/// `dependencies_met` flag resolved in a single batch query. The optional
/// `task_type` filter narrows plain tasks but never excludes planned
/// subtasks.
pub async fn get_queued_tasks_with_planning(
    pool: &SqlitePool,
    limit: i64,
    task_type: Option<&str>,
) -> StoreResult<Vec<QueuedTask>> {
    let base = "SELECT t.* FROM tasks t \
         LEFT JOIN execution_plans ep \
           ON ep.id = json_extract(t.payload, '$.parent_plan_id') \
         WHERE t.status = 'queued' \
           AND (t.task_type != 'planned_subtask' \
                OR ep.status IN ('generated', 'approved', 'executing'))";
    let order = " ORDER BY \
           CASE WHEN t.task_type = 'planned_subtask' THEN t.priority + 10 \
                ELSE t.priority END DESC, \
           t.created_at ASC, t.rowid ASC \
         LIMIT ?";

    let tasks = match task_type {
        Some(tt) => {
            let sql =
                format!("{base} AND (t.task_type = ? OR t.task_type = 'planned_subtask'){order}");
            sqlx::query_as::<_, Task>(&sql)
                .bind(tt)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!("{base}{order}");
            sqlx::query_as::<_, Task>(&sql)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };

    let mut all_deps: HashSet<String> = HashSet::new();
    for task in &tasks {
        if task.is_planned_subtask() {
            all_deps.extend(task.dependencies());
        }
    }
    let (by_id, by_plan_sub) = completed_dependency_sets(pool, &all_deps).await?;

    Ok(tasks
        .into_iter()
        .map(|task| {
            let dependencies_met = dependencies_met(&task, &by_id, &by_plan_sub);
            QueuedTask {
                task,
                dependencies_met,
            }
        })
        .collect())
}

/// True iff every id in the task's `payload.dependencies` resolves to a
/// completed task (matched by full id, or by plan-local subtask id within
/// the same parent plan).
pub async fn check_subtask_dependencies(pool: &SqlitePool, task_id: &str) -> StoreResult<bool> {
    let Some(task) = get_task(pool, task_id).await? else {
        return Err(StoreError::NotFound(format!("task {task_id}")));
    };
    let deps: HashSet<String> = task.dependencies().into_iter().collect();
    if deps.is_empty() {
        return Ok(true);
    }
    let (by_id, by_plan_sub) = completed_dependency_sets(pool, &deps).await?;
    Ok(dependencies_met(&task, &by_id, &by_plan_sub))
}

/// Resolve which of `deps` are satisfied by completed tasks, in one query.
///
/// Returns (completed task ids, completed (parent_plan_id, subtask_id)
/// pairs).
async fn completed_dependency_sets(
    pool: &SqlitePool,
    deps: &HashSet<String>,
) -> StoreResult<(HashSet<String>, HashSet<(String, String)>)> {
    let mut by_id = HashSet::new();
    let mut by_plan_sub = HashSet::new();
    if deps.is_empty() {
        return Ok((by_id, by_plan_sub));
    }

    let placeholders = vec!["?"; deps.len()].join(", ");
    let sql = format!(
        "SELECT id, \
                json_extract(payload, '$.subtask_id') AS subtask_id, \
                json_extract(payload, '$.parent_plan_id') AS parent_plan_id \
         FROM tasks \
         WHERE status = 'completed' \
           AND (id IN ({placeholders}) \
                OR json_extract(payload, '$.subtask_id') IN ({placeholders}))"
    );

    let mut query = sqlx::query_as::<_, (String, Option<String>, Option<String>)>(&sql);
    for dep in deps {
        query = query.bind(dep);
    }
    for dep in deps {
        query = query.bind(dep);
    }
    let rows = query.fetch_all(pool).await?;

    for (id, subtask_id, parent_plan_id) in rows {
        by_id.insert(id);
        if let (Some(sub), Some(plan)) = (subtask_id, parent_plan_id) {
            by_plan_sub.insert((plan, sub));
        }
    }
    Ok((by_id, by_plan_sub))
}

fn dependencies_met(
    task: &Task,
    by_id: &HashSet<String>,
    by_plan_sub: &HashSet<(String, String)>,
) -> bool {
    if !task.is_planned_subtask() {
        return true;
    }
    let plan = task.parent_plan_id().unwrap_or_default();
    task.dependencies().iter().all(|dep| {
        by_id.contains(dep) || by_plan_sub.contains(&(plan.to_owned(), dep.clone()))
    })
}

/// Update a task's status and any patch fields. Errors with
/// [`StoreError::NotFound`] if the task does not exist.
pub async fn update_task_status(
    pool: &SqlitePool,
    id: &str,
    status: TaskStatus,
    patch: TaskPatch,
) -> StoreResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET status = ");
    qb.push_bind(status);
    qb.push(", updated_at = ");
    qb.push_bind(Utc::now());
    patch.apply(&mut qb);
    qb.push(" WHERE id = ");
    qb.push_bind(id.to_owned());

    let result = qb.build().execute(pool).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("task {id}")));
    }
    tracing::info!(task_id = %id, status = %status, "task status updated");
    Ok(())
}

/// Optimistically transition a task between statuses.
///
/// The UPDATE's WHERE clause includes `status = from`, so the row is only
/// touched when the current status matches. A zero-row update is reported
/// as [`StoreError::Conflict`].
pub async fn transition_task_status(
    pool: &SqlitePool,
    id: &str,
    from: TaskStatus,
    to: TaskStatus,
    patch: TaskPatch,
) -> StoreResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET status = ");
    qb.push_bind(to);
    qb.push(", updated_at = ");
    qb.push_bind(Utc::now());
    patch.apply(&mut qb);
    qb.push(" WHERE id = ");
    qb.push_bind(id.to_owned());
    qb.push(" AND status = ");
    qb.push_bind(from);

    let result = qb.build().execute(pool).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "task {id}: expected status {from} for transition to {to}"
        )));
    }
    Ok(())
}

/// Administrative reset: back to `queued` at phase `plan` with assignment
/// and workspace bookkeeping cleared.
pub async fn reset_task(pool: &SqlitePool, id: &str) -> StoreResult<()> {
    let patch = TaskPatch::default().phase("plan").clear_assignment();
    update_task_status(pool, id, TaskStatus::Queued, patch).await
}

/// Auto-queue a planner-owned task once its plan lands.
///
/// The `planned` status is written by the external planner and is not part
/// of the scheduler's state machine, so this matches on the raw column
/// instead of decoding it. Returns whether a row was transitioned.
pub async fn queue_planned_task(pool: &SqlitePool, id: &str) -> StoreResult<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             payload = json_set(COALESCE(payload, '{}'), '$.auto_triggered', json('true')), \
             updated_at = ? \
         WHERE id = ? AND status = 'planned'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Send a reviewed task back to the queue for rework, attaching the
/// reviewer's feedback to the payload.
pub async fn requeue_for_rework(
    pool: &SqlitePool,
    id: &str,
    feedback: Option<&str>,
) -> StoreResult<()> {
    let result = match feedback {
        Some(fb) => {
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'queued', current_phase = 'rework', \
                     payload = json_set(COALESCE(payload, '{}'), '$.review_feedback', ?), \
                     updated_at = ? \
                 WHERE id = ?",
            )
            .bind(fb)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?
        }
        None => {
            sqlx::query(
                "UPDATE tasks \
                 SET status = 'queued', current_phase = 'rework', updated_at = ? \
                 WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?
        }
    };
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("task {id}")));
    }
    Ok(())
}

/// Record a review decision: new status and phase, with the decision,
/// reason, and timestamp annotated onto the payload.
pub async fn record_review_decision(
    pool: &SqlitePool,
    id: &str,
    status: TaskStatus,
    phase: &str,
    decision: &str,
    reason: &str,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = ?, current_phase = ?, \
             payload = json_set(COALESCE(payload, '{}'), \
                                '$.review_decision', ?, \
                                '$.review_reason', ?, \
                                '$.reviewed_at', ?), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(status)
    .bind(phase)
    .bind(decision)
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("task {id}")));
    }
    Ok(())
}

/// Columns the orchestrator may set at runtime, with their SQL types.
/// Kept as a safety net for databases created by older builds; the full
/// schema ships in the initial migration.
const RUNTIME_COLUMNS: &[(&str, &str)] = &[
    ("assignee", "TEXT"),
    ("assigned_at", "TEXT"),
    ("current_phase", "TEXT DEFAULT 'start'"),
    ("workflow", "TEXT"),
    ("started_at", "TEXT"),
    ("completed_at", "TEXT"),
    ("failure_reason", "TEXT"),
    ("retry_count", "INTEGER DEFAULT 0"),
    ("worktree", "TEXT"),
    ("workspace_type", "TEXT"),
    ("depends_on", "TEXT"),
];

/// Add any missing runtime columns to `tasks`. Additive only.
pub async fn ensure_task_columns(pool: &SqlitePool) -> StoreResult<()> {
    let rows = sqlx::query("PRAGMA table_info(tasks)")
        .fetch_all(pool)
        .await?;
    let existing: HashSet<String> = rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect();

    for (column, column_type) in RUNTIME_COLUMNS {
        if existing.contains(*column) {
            continue;
        }
        // Identifiers are interpolated, so validate strictly first.
        if !column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Schema(format!(
                "invalid column name: {column:?}"
            )));
        }
        let stmt = format!("ALTER TABLE tasks ADD COLUMN {column} {column_type}");
        if let Err(e) = sqlx::query(&stmt).execute(pool).await {
            // A concurrent writer may have added it already.
            tracing::debug!(column, error = %e, "column add skipped");
        } else {
            tracing::info!(column, "added missing column to tasks table");
        }
    }
    Ok(())
}
