//! Worker supervisor: executes one (task, phase) assignment in isolation
//! and reports a structured result through the run ledger.
//!
//! The worker never mutates task rows; the queen observes run records and
//! advances the task. If anything goes wrong internally, a best-effort
//! failure record is written so the run never dangles open.

pub mod agent;
pub mod prompt;
pub mod workspace;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use apiary_db::models::{RunStatus, WorkerRole};
use apiary_db::queries::runs as run_db;
use apiary_db::queries::tasks as task_db;
use apiary_db::queries::workers as worker_db;

use crate::paths::Layout;
use agent::{AgentConfig, AgentOutcome, LiveFormatter};
use workspace::{FileChanges, Workspace, WorkspaceMode};

/// One assignment handed to the worker process by the queen.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub role: String,
    pub task_id: String,
    pub run_id: String,
    pub phase: String,
    pub mode: WorkspaceMode,
    pub workspace_override: Option<PathBuf>,
    pub live_output: bool,
}

/// Worker process outcome, mapped to an exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Run succeeded.
    Success,
    /// Run completed with a failure result.
    Failure,
    /// Initialization failed before the agent could be invoked.
    InitFailure,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::InitFailure => 2,
        }
    }
}

/// Run one assignment to completion.
///
/// Any internal error that escapes the normal flow still produces a
/// best-effort failure record on the run before propagating.
pub async fn run_one_shot(
    pool: &SqlitePool,
    layout: &Layout,
    agent_config: &AgentConfig,
    debug_mode: bool,
    invocation: &WorkerInvocation,
) -> Result<WorkerExit> {
    match execute(pool, layout, agent_config, debug_mode, invocation).await {
        Ok(exit) => Ok(exit),
        Err(e) => {
            error!(
                task_id = %invocation.task_id,
                run_id = %invocation.run_id,
                error = %format!("{e:#}"),
                "worker failed internally"
            );
            let note = format!("worker internal error: {e:#}");
            if let Err(record_err) = run_db::update_run_status(
                pool,
                &invocation.run_id,
                RunStatus::Failure,
                Some(&invocation.phase),
                None,
                Some(&note),
                None,
                None,
            )
            .await
            {
                warn!(error = %record_err, "failed to write best-effort failure record");
            }
            Err(e)
        }
    }
}

async fn execute(
    pool: &SqlitePool,
    layout: &Layout,
    agent_config: &AgentConfig,
    debug_mode: bool,
    invocation: &WorkerInvocation,
) -> Result<WorkerExit> {
    let role = WorkerRole::coerce(&invocation.role);
    let _ = worker_db::register_worker(pool, &invocation.role, role, &[], None).await;

    let Some(task) = task_db::get_task(pool, &invocation.task_id).await? else {
        let note = format!("task {} not found", invocation.task_id);
        run_db::update_run_status(
            pool,
            &invocation.run_id,
            RunStatus::Failure,
            Some(&invocation.phase),
            None,
            Some(&note),
            None,
            None,
        )
        .await?;
        return Ok(WorkerExit::Failure);
    };

    // Workspace setup failures are init failures (exit 2): the agent never ran.
    let workspace_path = invocation
        .workspace_override
        .clone()
        .unwrap_or_else(|| layout.workspace_dir(&invocation.role, &invocation.task_id));
    let ws = match workspace::prepare_workspace(
        layout.root(),
        &workspace_path,
        &invocation.role,
        &invocation.task_id,
        &invocation.phase,
        invocation.mode,
    ) {
        Ok(ws) => ws,
        Err(e) => {
            let note = format!("workspace setup failed: {e}");
            run_db::update_run_status(
                pool,
                &invocation.run_id,
                RunStatus::Failure,
                Some(&invocation.phase),
                None,
                Some(&note),
                None,
                None,
            )
            .await?;
            return Ok(WorkerExit::InitFailure);
        }
    };

    if let Err(e) = std::env::set_current_dir(&ws.path) {
        warn!(error = %e, "could not chdir into workspace");
    }
    if let Err(e) = workspace::preflight_checks(&ws, debug_mode) {
        let note = format!("{e:#}");
        run_db::update_run_status(
            pool,
            &invocation.run_id,
            RunStatus::Failure,
            Some(&invocation.phase),
            None,
            Some(&note),
            None,
            None,
        )
        .await?;
        return Ok(WorkerExit::InitFailure);
    }

    info!(
        task_id = %invocation.task_id,
        run_id = %invocation.run_id,
        phase = %invocation.phase,
        mode = %invocation.mode,
        workspace = %ws.path.display(),
        "worker ready"
    );

    let context = prompt::load_task_context(layout, &task.context_from());
    let prompt_text = prompt::compose_prompt(&invocation.role, &invocation.phase, &task, &context);

    let Some(binary) = agent::find_agent_binary(agent_config.binary.as_deref()) else {
        // Not retryable by trying harder, but the retry policy applies.
        let note = "agent not available";
        let result_data = serde_json::json!({
            "status": "blocked",
            "notes": note,
            "workspace": ws.path.to_string_lossy(),
            "phase": invocation.phase,
        });
        run_db::update_run_status(
            pool,
            &invocation.run_id,
            RunStatus::Failure,
            Some(&invocation.phase),
            Some(&result_data),
            Some(note),
            None,
            None,
        )
        .await?;
        save_result_file(layout, invocation, &result_data);
        return Ok(WorkerExit::Failure);
    };

    let log_path = layout.log_path(&invocation.task_id, &invocation.run_id);
    let live = invocation
        .live_output
        .then(|| LiveFormatter::new(invocation.role.clone()));

    let outcome = agent::run_agent(
        &binary,
        &prompt_text,
        &ws.path,
        Some(&log_path),
        live.as_ref(),
        agent_config,
    )
    .await
    .context("agent invocation failed")?;

    let files = workspace::detect_file_changes(&ws);
    let (status, notes) = classify_outcome(&outcome, &files, agent_config);

    let result_data = build_result_data(invocation, &ws, &outcome, &files, status, &notes);
    let error_message = (status != RunStatus::Success).then_some(notes.as_str());

    run_db::update_run_status(
        pool,
        &invocation.run_id,
        status,
        Some(&invocation.phase),
        Some(&result_data),
        error_message,
        Some(&log_path.to_string_lossy()),
        Some(&outcome.transcript),
    )
    .await?;

    save_result_file(layout, invocation, &result_data);

    info!(
        task_id = %invocation.task_id,
        run_id = %invocation.run_id,
        status = %status,
        notes = %notes,
        "run recorded"
    );

    Ok(if status == RunStatus::Success {
        WorkerExit::Success
    } else {
        WorkerExit::Failure
    })
}

/// Classify an agent outcome into a run status.
///
/// Order matters: a clean exit with the completion terminator wins; a clean
/// exit without it still passes when the workspace shows new or modified
/// files; everything else fails.
fn classify_outcome(
    outcome: &AgentOutcome,
    files: &FileChanges,
    config: &AgentConfig,
) -> (RunStatus, String) {
    if outcome.timed_out {
        return (
            RunStatus::Timeout,
            format!(
                "agent timed out after {} seconds",
                config.timeout.as_secs()
            ),
        );
    }
    if outcome.exit_code == 0 {
        if outcome.completed {
            return (RunStatus::Success, "agent completed successfully".to_owned());
        }
        if !files.is_empty() {
            return (
                RunStatus::Success,
                format!(
                    "no completion signal; files present ({} created, {} modified)",
                    files.created.len(),
                    files.modified.len()
                ),
            );
        }
        return (
            RunStatus::Failure,
            "agent exited without producing output".to_owned(),
        );
    }
    (
        RunStatus::Failure,
        format!("agent exit code {}", outcome.exit_code),
    )
}

fn build_result_data(
    invocation: &WorkerInvocation,
    ws: &Workspace,
    outcome: &AgentOutcome,
    files: &FileChanges,
    status: RunStatus,
    notes: &str,
) -> serde_json::Value {
    serde_json::json!({
        "status": status.to_string(),
        "notes": notes,
        "workspace": ws.path.to_string_lossy(),
        "phase": invocation.phase,
        "files": {
            "created": files.created,
            "modified": files.modified,
        },
        "exit_code": outcome.exit_code,
        "output_lines": outcome.output_lines,
        "claude_completed": outcome.completed,
    })
}

/// Write the per-run result file used for cross-task context loading.
/// Atomic: temp file then rename. Failures are logged, never fatal.
fn save_result_file(layout: &Layout, invocation: &WorkerInvocation, result_data: &serde_json::Value) {
    let path = layout.result_path(&invocation.task_id, &invocation.run_id);
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(parent) {
        warn!(error = %e, "cannot create results directory");
        return;
    }

    let mut record = result_data.clone();
    if let Some(obj) = record.as_object_mut() {
        obj.insert("task_id".into(), invocation.task_id.clone().into());
        obj.insert("run_id".into(), invocation.run_id.clone().into());
        obj.insert("worker".into(), invocation.role.clone().into());
        obj.insert("timestamp".into(), Utc::now().to_rfc3339().into());
    }

    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        std::fs::write(&tmp, serde_json::to_string_pretty(&record).unwrap_or_default())?;
        std::fs::rename(&tmp, &path)
    };
    if let Err(e) = write() {
        warn!(path = %path.display(), error = %e, "failed to save result file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outcome(exit_code: i64, completed: bool, timed_out: bool) -> AgentOutcome {
        AgentOutcome {
            exit_code,
            completed,
            timed_out,
            output_lines: 0,
            transcript: String::new(),
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            binary: None,
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(30),
        }
    }

    #[test]
    fn clean_exit_with_terminator_is_success() {
        let (status, _) = classify_outcome(&outcome(0, true, false), &FileChanges::default(), &config());
        assert_eq!(status, RunStatus::Success);
    }

    #[test]
    fn clean_exit_with_files_is_success_with_note() {
        let files = FileChanges {
            created: vec!["a.rs".into()],
            modified: vec![],
        };
        let (status, notes) = classify_outcome(&outcome(0, false, false), &files, &config());
        assert_eq!(status, RunStatus::Success);
        assert!(notes.contains("no completion signal"));
    }

    #[test]
    fn clean_exit_without_output_fails() {
        let (status, notes) =
            classify_outcome(&outcome(0, false, false), &FileChanges::default(), &config());
        assert_eq!(status, RunStatus::Failure);
        assert!(notes.contains("without producing output"));
    }

    #[test]
    fn timeout_beats_everything() {
        let (status, notes) =
            classify_outcome(&outcome(-1, false, true), &FileChanges::default(), &config());
        assert_eq!(status, RunStatus::Timeout);
        assert!(notes.contains("timed out after 600 seconds"));
    }

    #[test]
    fn nonzero_exit_fails_with_code() {
        let (status, notes) =
            classify_outcome(&outcome(2, true, false), &FileChanges::default(), &config());
        assert_eq!(status, RunStatus::Failure);
        assert!(notes.contains("exit code 2"));
    }

    #[test]
    fn worker_exit_codes() {
        assert_eq!(WorkerExit::Success.code(), 0);
        assert_eq!(WorkerExit::Failure.code(), 1);
        assert_eq!(WorkerExit::InitFailure.code(), 2);
    }
}
