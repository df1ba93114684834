//! Reviewer-facing commands: fetch the next task awaiting review and
//! record a review decision.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use apiary_db::models::{Run, Task, TaskStatus};
use apiary_db::queries::runs as run_db;
use apiary_db::queries::tasks as task_db;

/// Emit the next `review_pending` task (FIFO among tasks that have runs).
pub async fn run_review_next_task(pool: &SqlitePool, format: &str) -> Result<()> {
    let candidates = task_db::get_tasks_by_status(pool, TaskStatus::ReviewPending).await?;

    let mut next: Option<(Task, Run)> = None;
    for candidate in candidates {
        let runs = run_db::get_task_runs(pool, &candidate.id).await?;
        if let Some(latest) = runs.into_iter().next_back() {
            next = Some((candidate, latest));
            break;
        }
    }

    let Some((task, latest_run)) = next else {
        println!("No tasks awaiting review");
        return Ok(());
    };

    let transcript_len = latest_run.transcript.as_deref().map(str::len).unwrap_or(0);
    let inspection_report = latest_run
        .result_data
        .as_ref()
        .and_then(|d| d.0.get("inspection_report").cloned());

    if format == "json" {
        let review = serde_json::json!({
            "task_id": task.id,
            "run_id": latest_run.id,
            "title": task.title,
            "description": task.description,
            "current_phase": task.current_phase,
            "workflow": task.workflow,
            "inspection_report": inspection_report,
            "transcript_available": transcript_len > 0,
            "transcript_length": transcript_len,
        });
        println!("{}", serde_json::to_string_pretty(&review)?);
        return Ok(());
    }

    println!("{}", "=".repeat(60));
    println!("TASK AWAITING REVIEW");
    println!("{}", "=".repeat(60));
    println!("Task ID: {}", task.id);
    println!("Title: {}", task.title);
    println!("Description: {}", task.description);
    println!("Current Phase: {}", task.current_phase);
    println!("Run ID: {}", latest_run.id);
    if transcript_len > 0 {
        println!("\nTranscript: {transcript_len} characters available");
        println!("Use `apiary get-transcript {}` to view it", latest_run.id);
    }
    println!("\nTo complete review, use:");
    println!(
        "  apiary complete-review {} --decision approve|reject|rework",
        task.id
    );
    println!("{}", "=".repeat(60));
    Ok(())
}

/// Record a review decision and transition the reviewed task.
pub async fn run_complete_review(
    pool: &SqlitePool,
    task_id: &str,
    decision: &str,
    reason: Option<&str>,
    next_phase_override: Option<&str>,
) -> Result<()> {
    if !matches!(decision, "approve" | "reject" | "rework") {
        bail!("invalid decision {decision:?}: expected approve, reject, or rework");
    }

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    if task.status != TaskStatus::ReviewPending {
        bail!(
            "task {task_id} is not awaiting review (status: {})",
            task.status
        );
    }

    let has_phase = |phase: &str| {
        task.workflow
            .as_ref()
            .map(|wf| wf.0.contains_key(phase))
            // No workflow table: the fixed apply -> test flow applies.
            .unwrap_or(matches!(phase, "apply" | "test"))
    };

    let next_phase = match next_phase_override {
        Some(phase) => phase.to_owned(),
        None => match decision {
            "approve" => {
                if has_phase("test") && task.current_phase != "test" {
                    "test".to_owned()
                } else {
                    "completed".to_owned()
                }
            }
            "reject" => "failed".to_owned(),
            // rework
            _ => {
                if has_phase("apply") {
                    "apply".to_owned()
                } else {
                    "start".to_owned()
                }
            }
        },
    };

    let new_status = match next_phase.as_str() {
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Queued,
    };

    task_db::record_review_decision(
        pool,
        task_id,
        new_status,
        &next_phase,
        decision,
        reason.unwrap_or("No reason provided"),
    )
    .await?;

    println!("Review completed");
    println!("Task ID: {task_id}");
    println!("Decision: {}", decision.to_uppercase());
    println!("New Phase: {next_phase}");
    println!("New Status: {new_status}");
    if let Some(reason) = reason {
        println!("Reason: {reason}");
    }
    Ok(())
}
