//! `apiary status`: task counts by status, per-task detail, and active
//! plan progress.

use anyhow::Result;
use sqlx::SqlitePool;

use apiary_core::plan::PlanBridge;
use apiary_db::queries::plans as plan_db;
use apiary_db::queries::tasks as task_db;

pub async fn run_status(pool: &SqlitePool, verbose: bool) -> Result<()> {
    let counts = task_db::count_tasks_by_status(pool).await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    println!("=== APIARY STATUS ===");
    println!("Total tasks: {total}");
    for (status, count) in &counts {
        println!("  {status:<15} {count}");
    }

    // Active plan progress, best-effort.
    if let Ok(plans) = plan_db::list_active_plans(pool).await {
        if !plans.is_empty() {
            let bridge = PlanBridge::new(pool.clone());
            println!("\nActive plans:");
            for plan in &plans {
                match bridge.get_plan_completion_status(&plan.id).await {
                    Ok(completion) => println!(
                        "  {} [{}] {:.1}% ({}/{} completed)",
                        plan.id,
                        plan.status,
                        completion.completion_percentage,
                        completion.completed,
                        completion.total,
                    ),
                    Err(_) => println!("  {} [{}]", plan.id, plan.status),
                }
            }
        }
    }

    if verbose {
        println!("\n=== TASK DETAILS ===");
        for task in task_db::list_tasks(pool).await? {
            let assignee = task.assignee.as_deref().unwrap_or("unassigned");
            println!(
                "  [{:<14}] {:<38} phase={:<10} retries={} ({})",
                task.status.to_string(),
                task.id,
                task.current_phase,
                task.retry_count,
                assignee,
            );
        }
    }

    Ok(())
}
