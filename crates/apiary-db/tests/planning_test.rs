//! Planning-table integration tests: materialization idempotency, plan
//! status transitions, and cleanup ordering.

use apiary_db::models::{PlanData, PlanStatus, PlanSubtask, TaskStatus};
use apiary_db::queries::plans as plan_db;
use apiary_db::queries::tasks as task_db;
use apiary_db::queries::tasks::TaskPatch;
use apiary_test_utils::create_test_db;

fn two_subtask_plan() -> PlanData {
    let mut a = PlanSubtask::new("a");
    a.title = Some("first".into());
    a.assignee = Some("worker:backend".into());
    let mut b = PlanSubtask::new("b");
    b.title = Some("second".into());
    b.dependencies = vec!["a".into()];
    b.assignee = Some("worker:frontend".into());
    PlanData {
        sub_tasks: vec![a, b],
        extra: Default::default(),
    }
}

async fn generated_plan(pool: &sqlx::SqlitePool, data: &PlanData) -> String {
    let req = plan_db::insert_planning_request(pool, "request", 50, None, None)
        .await
        .expect("request failed");
    plan_db::create_execution_plan(pool, &req, data, PlanStatus::Generated)
        .await
        .expect("plan failed")
}

#[tokio::test]
async fn plan_counts_derived_from_data() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;

    let plan = plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().unwrap();
    assert_eq!(plan.subtask_count, 2);
    assert_eq!(plan.dependency_count, 1);
    assert_eq!(plan.status, PlanStatus::Generated);
}

#[tokio::test]
async fn mark_execution_started_is_idempotent() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;

    assert!(plan_db::mark_plan_execution_started(&db.pool, &plan_id).await.unwrap());
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Executing)
    );
    // Second trigger: still true, still executing.
    assert!(plan_db::mark_plan_execution_started(&db.pool, &plan_id).await.unwrap());
    assert_eq!(
        plan_db::get_execution_plan_status(&db.pool, &plan_id).await.unwrap(),
        Some(PlanStatus::Executing)
    );
}

#[tokio::test]
async fn subtask_materialization_is_idempotent() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;

    let created = plan_db::create_planned_subtasks_from_plan(&db.pool, &plan_id)
        .await
        .unwrap();
    assert_eq!(created, 2);

    // Re-materializing creates nothing new.
    let created = plan_db::create_planned_subtasks_from_plan(&db.pool, &plan_id)
        .await
        .unwrap();
    assert_eq!(created, 0);

    let a = task_db::get_task(&db.pool, &format!("subtask_{plan_id}_a"))
        .await
        .unwrap()
        .expect("subtask a materialized");
    assert!(a.is_planned_subtask());
    assert_eq!(a.title, "first");
    assert_eq!(a.parent_plan_id(), Some(plan_id.as_str()));
    assert_eq!(a.subtask_id(), Some("a"));
    assert_eq!(a.payload_assignee_role(), Some("backend"));
    assert_eq!(a.priority, 50);

    let b = task_db::get_task(&db.pool, &format!("subtask_{plan_id}_b"))
        .await
        .unwrap()
        .expect("subtask b materialized");
    assert_eq!(b.dependencies(), vec!["a".to_string()]);
}

#[tokio::test]
async fn dependency_gate_opens_after_completion() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;
    plan_db::mark_plan_execution_started(&db.pool, &plan_id).await.unwrap();
    plan_db::create_planned_subtasks_from_plan(&db.pool, &plan_id).await.unwrap();

    let b_id = format!("subtask_{plan_id}_b");
    assert!(!task_db::check_subtask_dependencies(&db.pool, &b_id).await.unwrap());

    task_db::update_task_status(
        &db.pool,
        &format!("subtask_{plan_id}_a"),
        TaskStatus::Completed,
        TaskPatch::default(),
    )
    .await
    .unwrap();

    assert!(task_db::check_subtask_dependencies(&db.pool, &b_id).await.unwrap());
}

#[tokio::test]
async fn update_plan_data_preserves_extra_fields() {
    let db = create_test_db().await;
    let mut data = two_subtask_plan();
    data.extra.insert("planner_notes".into(), serde_json::json!("keep"));
    let plan_id = generated_plan(&db.pool, &data).await;

    let mut plan = plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().unwrap();
    plan.plan_data.0.sub_tasks[0].status = Some("completed".into());
    plan_db::update_plan_data(&db.pool, &plan_id, &plan.plan_data.0, PlanStatus::Executing)
        .await
        .unwrap();

    let reloaded = plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, PlanStatus::Executing);
    assert_eq!(reloaded.plan_data.0.sub_tasks[0].status.as_deref(), Some("completed"));
    assert_eq!(
        reloaded.plan_data.0.extra.get("planner_notes").and_then(|v| v.as_str()),
        Some("keep")
    );
}

#[tokio::test]
async fn cleanup_removes_old_completed_plans_and_their_subtasks() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;
    plan_db::create_planned_subtasks_from_plan(&db.pool, &plan_id).await.unwrap();

    // Age the plan into the cleanup window.
    sqlx::query(
        "UPDATE execution_plans SET status = 'completed', updated_at = ? WHERE id = ?",
    )
    .bind(chrono::Utc::now() - chrono::Duration::days(30))
    .bind(&plan_id)
    .execute(&db.pool)
    .await
    .unwrap();

    let deleted = plan_db::cleanup_completed_plans(&db.pool, 7).await.unwrap();
    assert_eq!(deleted, 1);

    assert!(plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().is_none());
    assert!(
        task_db::get_task(&db.pool, &format!("subtask_{plan_id}_a"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn cleanup_keeps_recent_plans() {
    let db = create_test_db().await;
    let plan_id = generated_plan(&db.pool, &two_subtask_plan()).await;
    sqlx::query("UPDATE execution_plans SET status = 'completed' WHERE id = ?")
        .bind(&plan_id)
        .execute(&db.pool)
        .await
        .unwrap();

    let deleted = plan_db::cleanup_completed_plans(&db.pool, 7).await.unwrap();
    assert_eq!(deleted, 0);
    assert!(plan_db::get_execution_plan(&db.pool, &plan_id).await.unwrap().is_some());
}

#[tokio::test]
async fn planning_queue_monitor_orders_by_priority() {
    let db = create_test_db().await;
    plan_db::insert_planning_request(&db.pool, "low", 10, None, None).await.unwrap();
    plan_db::insert_planning_request(&db.pool, "high", 90, Some("ops"), None)
        .await
        .unwrap();

    let pending = plan_db::monitor_planning_queue_changes(&db.pool).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].task_description, "high");
    assert_eq!(pending[0].requestor.as_deref(), Some("ops"));
}
