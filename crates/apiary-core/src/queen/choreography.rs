//! Event-driven coordination: subscriptions that advance tasks when the
//! planner or reviewer reports in.
//!
//! Handlers must be side-effect isolated: they log failures and never
//! raise into the publisher. Each callback captures what it needs and
//! spawns its database work so bus publication is never blocked.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use apiary_db::models::{PlanStatus, TaskStatus};
use apiary_db::queries::plans as plan_db;
use apiary_db::queries::tasks as task_db;

use crate::bus::{Event, EventBus, EventCallback, types};
use crate::plan::PlanBridge;

use super::advance_task_phase;

/// Install the queen's standing subscriptions.
pub fn install(bus: &EventBus, pool: SqlitePool) {
    bus.subscribe(
        types::WORKFLOW_PLAN_GENERATED,
        plan_generated_handler(pool.clone()),
        "queen-plan-listener",
    );
    bus.subscribe(
        types::TASK_REVIEW_COMPLETED,
        review_completed_handler(pool.clone()),
        "queen-review-listener",
    );
    bus.subscribe(
        types::TASK_ESCALATED,
        escalated_handler(),
        "queen-escalation-listener",
    );
    bus.subscribe(
        types::TASK_COMPLETED,
        subtask_completion_handler(pool),
        "queen-planning-tracker",
    );
    info!("choreography subscriptions installed");
}

/// `workflow.plan_generated`: auto-queue the planner-owned task, and when
/// the event names a plan in a triggerable state, materialize it.
fn plan_generated_handler(pool: SqlitePool) -> EventCallback {
    Arc::new(move |event: &Event| {
        let pool = pool.clone();
        let task_id = event.task_id().map(str::to_owned);
        let plan_id = event.payload_str("plan_id").map(str::to_owned);

        tokio::spawn(async move {
            if let Some(task_id) = task_id {
                match task_db::queue_planned_task(&pool, &task_id).await {
                    Ok(true) => info!(task_id = %task_id, "auto-queued planned task"),
                    Ok(false) => debug!(task_id = %task_id, "planned task not in planned status"),
                    Err(e) => warn!(task_id = %task_id, error = %e, "auto-queue failed"),
                }
            }

            if let Some(plan_id) = plan_id {
                match plan_db::get_execution_plan_status(&pool, &plan_id).await {
                    Ok(Some(PlanStatus::Generated | PlanStatus::Approved)) => {
                        let bridge = PlanBridge::new(pool.clone());
                        match bridge.trigger_plan_execution(&plan_id).await {
                            Ok(true) => info!(plan_id = %plan_id, "auto-triggered plan execution"),
                            Ok(false) => warn!(plan_id = %plan_id, "plan execution not triggered"),
                            Err(e) => warn!(plan_id = %plan_id, error = %e, "plan trigger failed"),
                        }
                    }
                    Ok(other) => debug!(plan_id = %plan_id, status = ?other, "plan not triggerable"),
                    Err(e) => warn!(plan_id = %plan_id, error = %e, "plan status lookup failed"),
                }
            }
        });
        Ok(())
    })
}

/// `task.review_completed`: approve advances the task as if its phase
/// succeeded; reject/rework requeues it into the rework phase with the
/// reviewer's feedback attached.
fn review_completed_handler(pool: SqlitePool) -> EventCallback {
    Arc::new(move |event: &Event| {
        let Some(task_id) = event.task_id().map(str::to_owned) else {
            return Ok(());
        };
        let Some(decision) = event.payload_str("review_decision").map(str::to_owned) else {
            return Ok(());
        };
        let feedback = event.payload_str("review_summary").map(str::to_owned);
        let pool = pool.clone();

        tokio::spawn(async move {
            info!(task_id = %task_id, decision = %decision, "review decision received");
            match decision.as_str() {
                "approve" => match task_db::get_task(&pool, &task_id).await {
                    Ok(Some(task)) => {
                        if let Err(e) = advance_task_phase(&pool, &task, true).await {
                            warn!(task_id = %task_id, error = %format!("{e:#}"), "approve advancement failed");
                        }
                    }
                    Ok(None) => warn!(task_id = %task_id, "reviewed task not found"),
                    Err(e) => warn!(task_id = %task_id, error = %e, "reviewed task load failed"),
                },
                "reject" | "rework" => {
                    if let Err(e) =
                        task_db::requeue_for_rework(&pool, &task_id, feedback.as_deref()).await
                    {
                        warn!(task_id = %task_id, error = %e, "rework requeue failed");
                    }
                }
                other => debug!(task_id = %task_id, decision = %other, "ignoring unknown review decision"),
            }
        });
        Ok(())
    })
}

/// `task.escalated`: reserved for human/admin channels; log loudly, take
/// no automatic action.
fn escalated_handler() -> EventCallback {
    Arc::new(|event: &Event| {
        let task_id = event.task_id().unwrap_or("unknown");
        let reason = event.payload_str("escalation_reason").unwrap_or("unspecified");
        warn!(task_id, reason, "task escalated; human intervention required");
        Ok(())
    })
}

/// `task.completed`: propagate planned-subtask completion into the parent
/// plan's progress.
fn subtask_completion_handler(pool: SqlitePool) -> EventCallback {
    Arc::new(move |event: &Event| {
        let Some(task_id) = event.task_id().map(str::to_owned) else {
            return Ok(());
        };
        let pool = pool.clone();

        tokio::spawn(async move {
            let bridge = PlanBridge::new(pool.clone());
            match bridge
                .sync_subtask_status_to_plan(&task_id, TaskStatus::Completed)
                .await
            {
                Ok(true) => {
                    debug!(task_id = %task_id, "subtask completion synced to plan");
                    if let Ok(Some(task)) = task_db::get_task(&pool, &task_id).await {
                        if let Some(plan_id) = task.parent_plan_id() {
                            if let Ok(completion) = bridge.get_plan_completion_status(plan_id).await
                            {
                                if completion.is_complete {
                                    info!(
                                        plan_id,
                                        percent = completion.completion_percentage,
                                        "plan complete"
                                    );
                                }
                            }
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %task_id, error = %format!("{e:#}"), "plan sync failed"),
            }
        });
        Ok(())
    })
}
