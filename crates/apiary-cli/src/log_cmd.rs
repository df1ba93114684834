//! `apiary logs` and `apiary get-transcript`: run log and transcript
//! retrieval.

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;

use apiary_core::paths::Layout;
use apiary_db::queries::runs as run_db;

pub fn run_logs(layout: &Layout, task_id: &str, latest: bool, tail: Option<usize>) -> Result<()> {
    let log_dir = layout.task_log_dir(task_id);
    if !log_dir.exists() {
        println!("No logs found for task {task_id}");
        return Ok(());
    }

    let mut log_files: Vec<_> = std::fs::read_dir(&log_dir)
        .with_context(|| format!("cannot read {}", log_dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    log_files.sort();

    if log_files.is_empty() {
        println!("No log files found for task {task_id}");
        return Ok(());
    }
    if latest {
        log_files = log_files.split_off(log_files.len() - 1);
    }

    for log_file in &log_files {
        println!("\n=== LOG: {} ===", log_file.display());
        let contents = std::fs::read_to_string(log_file)
            .with_context(|| format!("cannot read {}", log_file.display()))?;
        match tail {
            Some(n) => {
                let lines: Vec<&str> = contents.lines().collect();
                let start = lines.len().saturating_sub(n);
                for line in &lines[start..] {
                    println!("{line}");
                }
            }
            None => println!("{contents}"),
        }
    }
    Ok(())
}

pub async fn run_get_transcript(
    pool: &SqlitePool,
    layout: &Layout,
    run_id: &str,
) -> Result<()> {
    let Some(run) = run_db::get_run(pool, run_id).await? else {
        bail!("run {run_id} not found");
    };

    let Some(transcript) = run.run.transcript.as_deref().filter(|t| !t.is_empty()) else {
        println!("No transcript found for run {run_id}");
        let log_file = layout.log_path(&run.run.task_id, run_id);
        if log_file.exists() {
            println!("Log file exists at: {}", log_file.display());
            println!("Use `apiary logs {}` to view it", run.run.task_id);
        }
        return Ok(());
    };

    println!("=== Transcript for run {run_id} ===");
    println!("Task: {}", run.run.task_id);
    println!("Worker: {}", run.run.worker_id);
    println!("Status: {}", run.run.status);
    println!("Started: {}", run.run.started_at);
    if let Some(completed) = run.run.completed_at {
        println!("Completed: {completed}");
    }
    println!("\n=== Agent Conversation ===\n");
    println!("{transcript}");
    Ok(())
}
