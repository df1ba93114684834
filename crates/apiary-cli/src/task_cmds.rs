//! Task management commands: create, queue, list, clear, reset.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use apiary_core::bus::{EventBus, task_event, types};
use apiary_core::paths::Layout;
use apiary_db::models::TaskStatus;
use apiary_db::queries::runs as run_db;
use apiary_db::queries::tasks as task_db;
use apiary_db::queries::tasks::TaskPatch;

#[allow(clippy::too_many_arguments)]
pub async fn run_create_task(
    pool: &SqlitePool,
    title: &str,
    description: &str,
    task_type: &str,
    priority: i64,
    max_retries: i64,
    tags: &[String],
    mode: &str,
) -> Result<()> {
    if mode != "fresh" && mode != "repo" {
        bail!("invalid mode {mode:?}: expected fresh or repo");
    }
    let payload = serde_json::json!({"workspace": mode});

    let task_id = task_db::create_task(
        pool,
        title,
        task_type,
        description,
        None,
        Some(&payload),
        priority,
        max_retries,
        tags,
        "start",
    )
    .await?;

    let bus = EventBus::new(pool.clone());
    let _ = bus
        .publish(
            task_event(types::TASK_CREATED, &task_id, "cli", Some("queued"), None, None),
            None,
        )
        .await;

    println!("Created task {task_id}");
    Ok(())
}

pub async fn run_queue(pool: &SqlitePool, task_id: &str) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status == TaskStatus::Queued {
        println!("Task {task_id} already queued");
        return Ok(());
    }

    task_db::update_task_status(pool, task_id, TaskStatus::Queued, TaskPatch::default()).await?;
    println!("Task {task_id} queued");
    Ok(())
}

pub async fn run_list(pool: &SqlitePool, status: Option<&str>) -> Result<()> {
    let tasks = match status {
        Some(status) => {
            let status: TaskStatus = status
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            task_db::get_tasks_by_status(pool, status).await?
        }
        None => task_db::list_tasks(pool).await?,
    };

    println!("=== TASKS ({} total) ===", tasks.len());
    for task in &tasks {
        println!(
            "  [{:<14}] {:<38} - {}",
            task.status.to_string(),
            task.id,
            task.title
        );
    }
    Ok(())
}

/// Remove a task's workspace, results, and logs, then reset it to queued.
pub async fn run_clear(pool: &SqlitePool, layout: &Layout, task_id: &str) -> Result<()> {
    task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    // Prefer the workspace recorded on the latest run result.
    let mut workspace = run_db::get_latest_run(pool, task_id)
        .await?
        .and_then(|run| {
            run.result_data
                .as_ref()?
                .0
                .get("workspace")?
                .as_str()
                .map(std::path::PathBuf::from)
        });
    if workspace.is_none() {
        // Fall back to the conventional per-role location.
        for role in ["backend", "frontend", "infra"] {
            let candidate = layout.workspace_dir(role, task_id);
            if candidate.exists() {
                workspace = Some(candidate);
                break;
            }
        }
    }

    if let Some(ws) = workspace {
        if ws.exists() {
            std::fs::remove_dir_all(&ws)
                .with_context(|| format!("failed to remove workspace {}", ws.display()))?;
            println!("Cleared workspace {}", ws.display());
        }
    }

    for dir in [
        layout.task_results_dir(task_id),
        layout.task_log_dir(task_id),
    ] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
            println!("Cleared {}", dir.display());
        }
    }

    task_db::reset_task(pool, task_id).await?;
    println!("Task {task_id} reset to queued");
    Ok(())
}

pub async fn run_reset(pool: &SqlitePool, task_id: &str) -> Result<()> {
    task_db::reset_task(pool, task_id).await?;
    println!("Task {task_id} reset to queued");
    Ok(())
}
