//! Plan bridge integration tests: dependency gating, idempotent
//! triggering, and bidirectional progress sync.

use std::collections::HashMap;

use apiary_core::plan::PlanBridge;
use apiary_db::models::{PlanData, PlanStatus, PlanSubtask, TaskStatus};
use apiary_db::queries::plans as plan_db;
use apiary_db::queries::tasks as task_db;
use apiary_db::queries::tasks::TaskPatch;
use apiary_test_utils::create_test_db;

fn chain_plan() -> PlanData {
    let mut a = PlanSubtask::new("a");
    a.title = Some("design schema".into());
    a.assignee = Some("worker:backend".into());
    a.required_skills = vec!["sql".into()];
    a.deliverables = vec!["schema.sql".into()];
    a.workflow_phase = Some("design".into());
    let mut b = PlanSubtask::new("b");
    b.title = Some("build api".into());
    b.dependencies = vec!["a".into()];
    b.assignee = Some("worker:backend".into());
    PlanData {
        sub_tasks: vec![a, b],
        extra: Default::default(),
    }
}

async fn generated_plan(pool: &sqlx::SqlitePool, data: &PlanData) -> String {
    let req = plan_db::insert_planning_request(pool, "build it", 50, None, None)
        .await
        .unwrap();
    plan_db::create_execution_plan(pool, &req, data, PlanStatus::Generated)
        .await
        .unwrap()
}

#[tokio::test]
async fn dependency_gate_serializes_the_chain() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;

    assert!(bridge.trigger_plan_execution(&plan_id).await.unwrap());

    // Only the dependency-free subtask is ready.
    let ready = bridge.get_ready_planned_subtasks(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].planner_context.subtask_id.as_deref(), Some("a"));
    assert!(ready[0].dependencies_met);

    // Completing A opens B's gate.
    task_db::update_task_status(
        &db.pool,
        &format!("subtask_{plan_id}_a"),
        TaskStatus::Completed,
        TaskPatch::default(),
    )
    .await
    .unwrap();

    let ready = bridge.get_ready_planned_subtasks(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].planner_context.subtask_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn trigger_is_idempotent() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;

    assert!(bridge.trigger_plan_execution(&plan_id).await.unwrap());
    let first: Vec<String> =
        sqlx::query_scalar("SELECT id FROM tasks WHERE task_type = 'planned_subtask' ORDER BY id")
            .fetch_all(&db.pool)
            .await
            .unwrap();

    assert!(bridge.trigger_plan_execution(&plan_id).await.unwrap());
    let second: Vec<String> =
        sqlx::query_scalar("SELECT id FROM tasks WHERE task_type = 'planned_subtask' ORDER BY id")
            .fetch_all(&db.pool)
            .await
            .unwrap();

    // Same materialized set, plan still executing.
    assert_eq!(first, second);
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Executing)
    );
}

#[tokio::test]
async fn trigger_refuses_draft_plans() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let req = plan_db::insert_planning_request(&db.pool, "r", 50, None, None)
        .await
        .unwrap();
    let plan_id = plan_db::create_execution_plan(&db.pool, &req, &chain_plan(), PlanStatus::Draft)
        .await
        .unwrap();

    assert!(!bridge.trigger_plan_execution(&plan_id).await.unwrap());
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Draft)
    );
}

#[tokio::test]
async fn ready_subtasks_carry_planner_context() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;
    bridge.trigger_plan_execution(&plan_id).await.unwrap();

    let ready = bridge.get_ready_planned_subtasks(10).await.unwrap();
    let ctx = &ready[0].planner_context;
    assert_eq!(ctx.parent_plan_id.as_deref(), Some(plan_id.as_str()));
    assert_eq!(ctx.subtask_id.as_deref(), Some("a"));
    assert_eq!(ctx.workflow_phase.as_deref(), Some("design"));
    assert_eq!(ctx.required_skills, vec!["sql".to_string()]);
    assert_eq!(ctx.deliverables, vec!["schema.sql".to_string()]);
    assert_eq!(ctx.complexity, "medium");
    assert_eq!(ctx.assignee, "worker:backend");
}

#[tokio::test]
async fn progress_rules_drive_plan_status() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;
    bridge.trigger_plan_execution(&plan_id).await.unwrap();

    // One in progress -> executing.
    let mut updates = HashMap::new();
    updates.insert("a".to_owned(), "in_progress".to_owned());
    assert!(bridge.update_execution_plan_progress(&plan_id, &updates).await.unwrap());
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Executing)
    );

    // Any failed -> failed.
    let mut updates = HashMap::new();
    updates.insert("b".to_owned(), "failed".to_owned());
    bridge.update_execution_plan_progress(&plan_id, &updates).await.unwrap();
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Failed)
    );

    // All completed -> completed.
    let mut updates = HashMap::new();
    updates.insert("a".to_owned(), "completed".to_owned());
    updates.insert("b".to_owned(), "completed".to_owned());
    bridge.update_execution_plan_progress(&plan_id, &updates).await.unwrap();
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Completed)
    );
}

#[tokio::test]
async fn subtask_sync_reaches_the_parent_plan() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;
    bridge.trigger_plan_execution(&plan_id).await.unwrap();

    let a_id = format!("subtask_{plan_id}_a");
    task_db::update_task_status(&db.pool, &a_id, TaskStatus::Completed, TaskPatch::default())
        .await
        .unwrap();
    assert!(bridge.sync_subtask_status_to_plan(&a_id, TaskStatus::Completed).await.unwrap());

    let plan = plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().unwrap();
    let a = plan.plan_data.0.sub_tasks.iter().find(|s| s.id == "a").unwrap();
    assert_eq!(a.status.as_deref(), Some("completed"));

    // Non-subtask ids are ignored without error.
    let plain = task_db::create_task(&db.pool, "plain", "impl", "", None, None, 1, 3, &[], "start")
        .await
        .unwrap();
    assert!(!bridge.sync_subtask_status_to_plan(&plain, TaskStatus::Completed).await.unwrap());
}

#[tokio::test]
async fn completion_status_joins_live_task_rows() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;
    bridge.trigger_plan_execution(&plan_id).await.unwrap();

    let status = bridge.get_plan_completion_status(&plan_id).await.unwrap();
    assert_eq!(status.total, 2);
    assert_eq!(status.queued, 2);
    assert_eq!(status.completed, 0);
    assert!(!status.is_complete);

    task_db::update_task_status(
        &db.pool,
        &format!("subtask_{plan_id}_a"),
        TaskStatus::Completed,
        TaskPatch::default(),
    )
    .await
    .unwrap();

    let status = bridge.get_plan_completion_status(&plan_id).await.unwrap();
    assert_eq!(status.completed, 1);
    assert_eq!(status.completion_percentage, 50.0);
    assert!(!status.has_failures);

    task_db::update_task_status(
        &db.pool,
        &format!("subtask_{plan_id}_b"),
        TaskStatus::Completed,
        TaskPatch::default(),
    )
    .await
    .unwrap();

    let status = bridge.get_plan_completion_status(&plan_id).await.unwrap();
    assert!(status.is_complete);
    assert_eq!(status.completion_percentage, 100.0);
}

#[tokio::test]
async fn plan_status_reads_are_cached_until_invalidated() {
    let db = create_test_db().await;
    let bridge = PlanBridge::new(db.pool.clone());
    let plan_id = generated_plan(&db.pool, &chain_plan()).await;

    assert_eq!(
        bridge.get_execution_plan_status(&plan_id).await.unwrap(),
        Some(PlanStatus::Generated)
    );

    // Out-of-band status change is invisible within the cache TTL.
    sqlx::query("UPDATE execution_plans SET status = 'failed' WHERE id = ?")
        .bind(&plan_id)
        .execute(&db.pool)
        .await
        .unwrap();
    assert_eq!(
        bridge.get_execution_plan_status(&plan_id).await.unwrap(),
        Some(PlanStatus::Generated)
    );
}
