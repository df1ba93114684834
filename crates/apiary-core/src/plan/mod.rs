//! Planner-to-executor bridge: materializes approved execution plans into
//! dependency-gated queued subtasks, and feeds subtask terminal states back
//! into plan progress.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use apiary_db::models::{PlanStatus, PlanningRequest, Task, TaskStatus};
use apiary_db::queries::plans as plan_db;

/// How long a cached plan status stays fresh.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Planner-supplied context extracted from a subtask payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerContext {
    pub parent_plan_id: Option<String>,
    pub subtask_id: Option<String>,
    pub workflow_phase: Option<String>,
    pub estimated_duration: Option<i64>,
    pub required_skills: Vec<String>,
    pub deliverables: Vec<String>,
    pub complexity: String,
    pub assignee: String,
}

impl PlannerContext {
    fn from_task(task: &Task) -> Self {
        let payload = task
            .payload
            .as_ref()
            .map(|p| p.0.clone())
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let str_list = |key: &str| -> Vec<String> {
            payload
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            parent_plan_id: task.parent_plan_id().map(str::to_owned),
            subtask_id: task.subtask_id().map(str::to_owned),
            workflow_phase: payload
                .get("workflow_phase")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            estimated_duration: payload.get("estimated_duration").and_then(|v| v.as_i64()),
            required_skills: str_list("required_skills"),
            deliverables: str_list("deliverables"),
            complexity: payload
                .get("complexity")
                .and_then(|v| v.as_str())
                .unwrap_or("medium")
                .to_owned(),
            assignee: payload
                .get("assignee")
                .and_then(|v| v.as_str())
                .unwrap_or("worker:backend")
                .to_owned(),
        }
    }
}

/// A subtask whose dependency gate is open, enriched for scheduling.
#[derive(Debug, Clone)]
pub struct ReadySubtask {
    pub task: Task,
    pub planner_context: PlannerContext,
    /// Always true here; kept so callers can recheck conservatively.
    pub dependencies_met: bool,
}

/// Completion metrics for one plan, joined against live task statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCompletion {
    pub plan_id: String,
    pub plan_status: PlanStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub queued: usize,
    pub completion_percentage: f64,
    pub is_complete: bool,
    pub has_failures: bool,
}

/// Bridge between the planner's output tables and the task queue.
pub struct PlanBridge {
    pool: SqlitePool,
    status_cache: Mutex<HashMap<String, (Option<PlanStatus>, Instant)>>,
}

impl PlanBridge {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            status_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Planned subtasks ready for execution: parent plan live, every
    /// dependency completed. One query over tasks, execution_plans, and a
    /// correlated dependency check.
    pub async fn get_ready_planned_subtasks(&self, limit: i64) -> Result<Vec<ReadySubtask>> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT t.* FROM tasks t \
             JOIN execution_plans ep \
               ON ep.id = json_extract(t.payload, '$.parent_plan_id') \
             WHERE t.task_type = 'planned_subtask' \
               AND t.status = 'queued' \
               AND ep.status IN ('generated', 'approved', 'executing') \
               AND (json_extract(t.payload, '$.dependencies') IS NULL \
                    OR json_array_length(json_extract(t.payload, '$.dependencies')) = 0 \
                    OR NOT EXISTS ( \
                        SELECT 1 \
                        FROM json_each(json_extract(t.payload, '$.dependencies')) AS dep \
                        WHERE NOT EXISTS ( \
                            SELECT 1 FROM tasks t2 \
                            WHERE (t2.id = dep.value \
                                   OR (json_extract(t2.payload, '$.subtask_id') = dep.value \
                                       AND json_extract(t2.payload, '$.parent_plan_id') = ep.id)) \
                              AND t2.status = 'completed' \
                        ) \
                    )) \
             ORDER BY t.priority DESC, \
                      json_extract(t.payload, '$.workflow_phase'), \
                      t.created_at ASC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query ready planned subtasks")?;

        debug!(count = tasks.len(), "ready planned subtasks");
        Ok(tasks
            .into_iter()
            .map(|task| {
                let planner_context = PlannerContext::from_task(&task);
                ReadySubtask {
                    task,
                    planner_context,
                    dependencies_met: true,
                }
            })
            .collect())
    }

    /// Newly pending planning-queue entries awaiting the external planner.
    pub async fn monitor_planning_queue_changes(&self) -> Result<Vec<PlanningRequest>> {
        Ok(plan_db::monitor_planning_queue_changes(&self.pool).await?)
    }

    /// Plan status with a 60-second in-process cache.
    pub async fn get_execution_plan_status(&self, plan_id: &str) -> Result<Option<PlanStatus>> {
        {
            let cache = self.status_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((status, at)) = cache.get(plan_id) {
                if at.elapsed() < STATUS_CACHE_TTL {
                    return Ok(*status);
                }
            }
        }
        let status = plan_db::get_execution_plan_status(&self.pool, plan_id).await?;
        self.status_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan_id.to_owned(), (status, Instant::now()));
        Ok(status)
    }

    fn invalidate_status_cache(&self, plan_id: &str) {
        self.status_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plan_id);
    }

    /// Rewrite the embedded subtask statuses and recompute the overall plan
    /// status: all completed -> completed; any failed -> failed; any
    /// in_progress/assigned -> executing; else generated.
    pub async fn update_execution_plan_progress(
        &self,
        plan_id: &str,
        subtask_updates: &HashMap<String, String>,
    ) -> Result<bool> {
        let Some(plan) = plan_db::get_execution_plan(&self.pool, plan_id).await? else {
            return Ok(false);
        };

        let mut plan_data = plan.plan_data.0;
        let mut updated = false;
        for sub in &mut plan_data.sub_tasks {
            if let Some(new_status) = subtask_updates.get(&sub.id) {
                if sub.status.as_deref() != Some(new_status.as_str()) {
                    debug!(
                        plan_id,
                        subtask = %sub.id,
                        from = sub.status.as_deref().unwrap_or("queued"),
                        to = %new_status,
                        "subtask status updated in plan"
                    );
                    sub.status = Some(new_status.clone());
                    sub.updated_at = Some(Utc::now().to_rfc3339());
                    updated = true;
                }
            }
        }

        if updated {
            let statuses: Vec<&str> = plan_data
                .sub_tasks
                .iter()
                .map(|s| s.status.as_deref().unwrap_or("queued"))
                .collect();
            let plan_status = if statuses.iter().all(|s| *s == "completed") {
                PlanStatus::Completed
            } else if statuses.iter().any(|s| *s == "failed") {
                PlanStatus::Failed
            } else if statuses.iter().any(|s| *s == "in_progress" || *s == "assigned") {
                PlanStatus::Executing
            } else {
                PlanStatus::Generated
            };

            plan_db::update_plan_data(&self.pool, plan_id, &plan_data, plan_status).await?;
            self.invalidate_status_cache(plan_id);
            info!(plan_id, status = %plan_status, "execution plan progress updated");
        }

        Ok(true)
    }

    /// Propagate a subtask status change to its parent plan.
    pub async fn sync_subtask_status_to_plan(
        &self,
        task_id: &str,
        new_status: TaskStatus,
    ) -> Result<bool> {
        let Some(task) = apiary_db::queries::tasks::get_task(&self.pool, task_id).await? else {
            return Ok(false);
        };
        if !task.is_planned_subtask() {
            return Ok(false);
        }
        let (Some(plan_id), Some(subtask_id)) = (task.parent_plan_id(), task.subtask_id()) else {
            return Ok(false);
        };
        let mut updates = HashMap::new();
        updates.insert(subtask_id.to_owned(), new_status.to_string());
        self.update_execution_plan_progress(&plan_id.to_owned(), &updates)
            .await
    }

    /// Completion metrics joined against live task rows.
    pub async fn get_plan_completion_status(&self, plan_id: &str) -> Result<PlanCompletion> {
        let plan = plan_db::get_execution_plan(&self.pool, plan_id)
            .await?
            .with_context(|| format!("plan {plan_id} not found"))?;

        let rows: Vec<(Option<String>, String)> = sqlx::query_as(
            "SELECT json_extract(payload, '$.subtask_id'), status \
             FROM tasks \
             WHERE task_type = 'planned_subtask' \
               AND json_extract(payload, '$.parent_plan_id') = ?",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        let actual: HashMap<String, String> = rows
            .into_iter()
            .filter_map(|(sub, status)| sub.map(|s| (s, status)))
            .collect();

        let sub_tasks = &plan.plan_data.0.sub_tasks;
        let total = sub_tasks.len();
        let status_of = |id: &str| actual.get(id).map(String::as_str);
        let completed = sub_tasks.iter().filter(|s| status_of(&s.id) == Some("completed")).count();
        let failed = sub_tasks.iter().filter(|s| status_of(&s.id) == Some("failed")).count();
        let in_progress = sub_tasks
            .iter()
            .filter(|s| matches!(status_of(&s.id), Some("assigned") | Some("in_progress")))
            .count();
        let queued = sub_tasks.iter().filter(|s| status_of(&s.id) == Some("queued")).count();

        let completion_percentage = if total > 0 {
            (completed as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(PlanCompletion {
            plan_id: plan_id.to_owned(),
            plan_status: plan.status,
            total,
            completed,
            failed,
            in_progress,
            queued,
            completion_percentage,
            is_complete: total > 0 && completed == total,
            has_failures: failed > 0,
        })
    }

    /// Materialize any missing subtasks and move the plan to `executing`.
    /// Idempotent: re-triggering an executing plan creates nothing new and
    /// still reports success.
    pub async fn trigger_plan_execution(&self, plan_id: &str) -> Result<bool> {
        let Some(status) = plan_db::get_execution_plan_status(&self.pool, plan_id).await? else {
            warn!(plan_id, "cannot trigger execution: plan not found");
            return Ok(false);
        };
        if status.is_terminal() || status == PlanStatus::Draft {
            warn!(plan_id, status = %status, "plan not in a triggerable state");
            return Ok(false);
        }

        let created = plan_db::create_planned_subtasks_from_plan(&self.pool, plan_id).await?;
        let started = plan_db::mark_plan_execution_started(&self.pool, plan_id).await?;
        self.invalidate_status_cache(plan_id);

        info!(plan_id, created, "plan execution triggered");
        Ok(started)
    }

    /// Delete old completed plans and their subtasks. Returns the number of
    /// plans removed.
    pub async fn cleanup_completed_plans(&self, max_age_days: i64) -> Result<u64> {
        Ok(plan_db::cleanup_completed_plans(&self.pool, max_age_days).await?)
    }
}
