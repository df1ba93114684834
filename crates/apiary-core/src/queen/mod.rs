//! The queen: single owner of the scheduling loop on a host.
//!
//! Each tick admits queued tasks up to the free parallelism slots, spawns
//! one-shot worker subprocesses, monitors active children, advances phases
//! on success, applies the retry policy on failure, and silently recovers
//! zombie tasks left behind by dead workers.

pub mod choreography;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use apiary_db::models::{RunStatus, Task, TaskStatus, WorkerRole};
use apiary_db::queries::runs as run_db;
use apiary_db::queries::tasks as task_db;
use apiary_db::queries::tasks::TaskPatch;
use apiary_db::queries::workers as worker_db;

use crate::bus::{EventBus, task_event, types};
use crate::config::OrchestratorConfig;
use crate::paths::Layout;
use crate::plan::PlanBridge;

/// Worker-row id the queen registers for itself.
pub const QUEEN_WORKER_ID: &str = "queen-orchestrator";

/// Roles tasks can be scheduled onto.
const EXECUTOR_ROLES: &[&str] = &["backend", "frontend", "infra"];

/// How long shutdown waits for each terminated child.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Bookkeeping for one spawned worker subprocess.
struct ActiveWorker {
    child: Child,
    run_id: String,
    phase: String,
    role: String,
    started: Instant,
}

/// Where a successful phase advancement left the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advancement {
    /// Terminal success.
    Completed,
    /// Terminal failure (workflow routed there).
    Failed,
    /// Requeued into the named phase for a later tick.
    Requeued(String),
}

/// Advance a task as if its current phase finished.
///
/// With a workflow table, the current phase's successor decides; the
/// special values `completed` and `failed` terminate, anything else
/// requeues into that phase. Without a workflow the fixed
/// `apply -> test -> completed` flow applies (requeue-based; the queen's
/// monitor path spawns the test phase immediately instead).
pub async fn advance_task_phase(
    pool: &SqlitePool,
    task: &Task,
    success: bool,
) -> Result<Advancement> {
    let advancement = if task.workflow.is_some() {
        let step = task.workflow_step(&task.current_phase);
        let next = if success {
            step.and_then(|s| s.next_phase_on_success.clone())
        } else {
            step.and_then(|s| s.next_phase_on_failure.clone())
                .or_else(|| Some("failed".to_owned()))
        };
        match next.as_deref() {
            None | Some("completed") => Advancement::Completed,
            Some("failed") => Advancement::Failed,
            Some(phase) => Advancement::Requeued(phase.to_owned()),
        }
    } else if !success {
        Advancement::Failed
    } else if task.current_phase == "apply" {
        Advancement::Requeued("test".to_owned())
    } else {
        Advancement::Completed
    };

    match &advancement {
        Advancement::Completed => {
            task_db::update_task_status(pool, &task.id, TaskStatus::Completed, TaskPatch::default())
                .await?;
            info!(task_id = %task.id, "task completed");
        }
        Advancement::Failed => {
            task_db::update_task_status(pool, &task.id, TaskStatus::Failed, TaskPatch::default())
                .await?;
            info!(task_id = %task.id, "task failed by workflow routing");
        }
        Advancement::Requeued(phase) => {
            task_db::update_task_status(
                pool,
                &task.id,
                TaskStatus::Queued,
                TaskPatch::default().phase(phase.clone()).clear_assignment(),
            )
            .await?;
            info!(task_id = %task.id, phase = %phase, "task advanced to next phase");
        }
    }

    Ok(advancement)
}

/// Executor role for a candidate task.
///
/// Planned subtasks carry a `worker:<role>` payload assignee; plain tasks
/// use their first tag when it names a role. Anything else lands on
/// backend.
pub fn worker_role_for(task: &Task) -> String {
    if task.is_planned_subtask() {
        if let Some(role) = task.payload_assignee_role() {
            return coerce_executor_role(role);
        }
        return "backend".to_owned();
    }
    if let Some(tag) = task.tag_list().first() {
        return coerce_executor_role(tag);
    }
    "backend".to_owned()
}

fn coerce_executor_role(role: &str) -> String {
    if EXECUTOR_ROLES.contains(&role) {
        role.to_owned()
    } else {
        "backend".to_owned()
    }
}

/// Phase a queued task should be spawned into. Initial and recovery
/// phases map to `apply`; anything a workflow routed to is kept.
fn spawn_phase_for(task: &Task) -> String {
    match task.current_phase.as_str() {
        "" | "start" | "plan" => "apply".to_owned(),
        other => other.to_owned(),
    }
}

/// The orchestrator value. Owns the in-memory active-worker map; all task
/// state transitions for scheduling flow through here.
pub struct Queen {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    bridge: PlanBridge,
    config: OrchestratorConfig,
    layout: Layout,
    /// Override for the worker subprocess command (tests); empty means
    /// "this executable with the `worker` subcommand".
    worker_command: Vec<String>,
    live_output: bool,
    exit_when_idle: bool,
    active: HashMap<String, ActiveWorker>,
    completed_runs: u64,
    average_run_secs: f64,
}

impl Queen {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
        layout: Layout,
    ) -> Self {
        Self {
            bridge: PlanBridge::new(pool.clone()),
            pool,
            bus,
            config,
            layout,
            worker_command: Vec::new(),
            live_output: false,
            exit_when_idle: true,
            active: HashMap::new(),
            completed_runs: 0,
            average_run_secs: 0.0,
        }
    }

    /// Override the worker subprocess command line.
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = command;
        self
    }

    /// Stream child output to the terminal.
    pub fn with_live_output(mut self, live: bool) -> Self {
        self.live_output = live;
        self
    }

    /// Keep the loop alive even when every task has settled.
    pub fn run_forever(mut self) -> Self {
        self.exit_when_idle = false;
        self
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn bridge(&self) -> &PlanBridge {
        &self.bridge
    }

    /// Register the orchestrator worker row and install the choreography
    /// subscriptions.
    pub async fn startup(&self) -> Result<()> {
        task_db::ensure_task_columns(&self.pool).await?;
        worker_db::register_worker(
            &self.pool,
            QUEEN_WORKER_ID,
            WorkerRole::Orchestrator,
            &[
                "task_orchestration".to_owned(),
                "workflow_management".to_owned(),
                "worker_coordination".to_owned(),
            ],
            Some(&serde_json::json!({"type": "queen"})),
        )
        .await?;
        choreography::install(&self.bus, self.pool.clone());
        info!(worker_id = QUEEN_WORKER_ID, "queen registered");
        Ok(())
    }

    /// Run the scheduling loop until cancelled or (in standalone mode)
    /// until all work has settled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("queen scheduling loop starting");
        loop {
            if cancel.is_cancelled() {
                self.shutdown().await;
                return Ok(());
            }

            if let Err(e) = self.tick().await {
                // Recoverable: the next tick retries.
                error!(error = %format!("{e:#}"), "scheduling tick failed");
            }

            if self.exit_when_idle {
                match self.is_idle_and_done().await {
                    Ok(true) => {
                        info!("all tasks settled, queen exiting");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "idle check failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.status_refresh()) => {}
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// One scheduling tick: admit and spawn, monitor children, recover
    /// zombies.
    pub async fn tick(&mut self) -> Result<()> {
        self.spawn_ready_tasks().await?;
        self.monitor_active_workers().await?;
        self.recover_zombies().await?;
        self.monitor_planning_queue().await;
        let _ = worker_db::update_worker_heartbeat(&self.pool, QUEEN_WORKER_ID, None).await;
        self.log_status().await;
        Ok(())
    }

    /// Surface planning-queue entries awaiting the external planner.
    /// Observation only; the planner owns their lifecycle.
    async fn monitor_planning_queue(&self) {
        match self.bridge.monitor_planning_queue_changes().await {
            Ok(pending) if !pending.is_empty() => {
                info!(count = pending.len(), "planning queue has pending requests");
                for request in pending.iter().take(3) {
                    debug!(
                        request_id = %request.id,
                        priority = request.priority,
                        description = %request.task_description.chars().take(80).collect::<String>(),
                        "pending planning request"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "planning queue check failed"),
        }
    }

    async fn log_status(&self) {
        if let Ok(counts) = task_db::count_tasks_by_status(&self.pool).await {
            debug!(
                active = self.active.len(),
                counts = ?counts,
                avg_run_secs = self.average_run_secs,
                "tick status"
            );
        }
    }

    // -- Admission & spawn --------------------------------------------------

    async fn spawn_ready_tasks(&mut self) -> Result<()> {
        let slots_total = self.config.total_parallel_slots();
        let slots_free = slots_total.saturating_sub(self.active.len());
        if slots_free == 0 {
            return Ok(());
        }

        let candidates =
            task_db::get_queued_tasks_with_planning(&self.pool, slots_free as i64, None).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut active_per_role: HashMap<String, usize> = HashMap::new();
        for worker in self.active.values() {
            *active_per_role.entry(worker.role.clone()).or_default() += 1;
        }

        for candidate in candidates {
            if self.active.len() >= slots_total {
                break;
            }
            let task = candidate.task;

            // A task cannot be double-spawned while its worker lives.
            if self.active.contains_key(&task.id) {
                continue;
            }

            if task.is_planned_subtask() {
                if !candidate.dependencies_met {
                    debug!(task_id = %task.id, "skipping: dependencies not met");
                    continue;
                }
                // The store already resolved the gate; recheck conservatively.
                match task_db::check_subtask_dependencies(&self.pool, &task.id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = %task.id, "skipping: dependency recheck failed");
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "dependency recheck errored");
                        continue;
                    }
                }
            }

            let role = worker_role_for(&task);
            let used = active_per_role.get(&role).copied().unwrap_or(0);
            if used >= self.config.role_cap(&role) {
                debug!(task_id = %task.id, role = %role, "role at capacity");
                continue;
            }

            match self.spawn_task_worker(&task, &role).await {
                Ok(()) => {
                    *active_per_role.entry(role).or_default() += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %format!("{e:#}"), "failed to spawn worker");
                }
            }
        }

        Ok(())
    }

    /// Assign a task and spawn its worker subprocess. On spawn failure the
    /// task reverts to queued without consuming a retry.
    async fn spawn_task_worker(&mut self, task: &Task, role: &str) -> Result<()> {
        let phase = spawn_phase_for(task);
        let mode = task.workspace_mode().to_owned();

        // Worker registration must exist before the run row references it.
        worker_db::register_worker(&self.pool, role, WorkerRole::coerce(role), &[], None).await?;

        task_db::transition_task_status(
            &self.pool,
            &task.id,
            TaskStatus::Queued,
            TaskStatus::Assigned,
            {
                let mut patch = TaskPatch::default()
                    .assignee(role)
                    .assigned_now()
                    .phase(phase.clone());
                patch.worktree = Some(
                    self.layout
                        .workspace_dir(role, &task.id)
                        .to_string_lossy()
                        .into_owned(),
                );
                patch.workspace_type = Some(mode.clone());
                patch
            },
        )
        .await?;
        self.publish_task_event(types::TASK_ASSIGNED, &task.id, "assigned", Some(role), &phase)
            .await;

        let run_id = run_db::create_run(&self.pool, &task.id, role, &phase).await?;

        let child = match self.spawn_worker_process(&task.id, role, &phase, &run_id, &mode) {
            Ok(child) => child,
            Err(e) => {
                // Spawn attempts are not run attempts: revert, no retry tick.
                let _ = run_db::update_run_status(
                    &self.pool,
                    &run_id,
                    RunStatus::Cancelled,
                    None,
                    None,
                    Some("worker spawn failed"),
                    None,
                    None,
                )
                .await;
                let _ = task_db::transition_task_status(
                    &self.pool,
                    &task.id,
                    TaskStatus::Assigned,
                    TaskStatus::Queued,
                    TaskPatch::default().clear_assignment(),
                )
                .await;
                return Err(e);
            }
        };

        if let Err(e) = task_db::transition_task_status(
            &self.pool,
            &task.id,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskPatch::default().started_now(),
        )
        .await
        {
            warn!(task_id = %task.id, error = %e, "could not mark task in progress");
        }
        self.publish_task_event(types::TASK_STARTED, &task.id, "in_progress", Some(role), &phase)
            .await;

        info!(task_id = %task.id, role, phase = %phase, run_id = %run_id, "worker spawned");
        self.active.insert(
            task.id.clone(),
            ActiveWorker {
                child,
                run_id,
                phase,
                role: role.to_owned(),
                started: Instant::now(),
            },
        );
        Ok(())
    }

    fn spawn_worker_process(
        &self,
        task_id: &str,
        role: &str,
        phase: &str,
        run_id: &str,
        mode: &str,
    ) -> Result<Child> {
        let (program, base_args) = self.worker_program()?;

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .arg(role)
            .arg("--one-shot")
            .arg("--task-id")
            .arg(task_id)
            .arg("--run-id")
            .arg(run_id)
            .arg("--phase")
            .arg(phase)
            .arg("--mode")
            .arg(mode);
        if self.live_output {
            cmd.arg("--live");
        }

        cmd.env("APIARY_ROOT", self.layout.root());
        cmd.stdin(Stdio::null());
        if self.live_output {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        } else {
            // Unread pipes can deadlock a chatty child; workers report
            // through the run ledger, so their stdio is disposable here.
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        cmd.spawn().context("failed to spawn worker process")
    }

    fn worker_program(&self) -> Result<(PathBuf, Vec<String>)> {
        if let Some((first, rest)) = self.worker_command.split_first() {
            return Ok((PathBuf::from(first), rest.to_vec()));
        }
        let exe = std::env::current_exe().context("cannot locate own executable")?;
        Ok((exe, vec!["worker".to_owned()]))
    }

    // -- Monitoring ---------------------------------------------------------

    async fn monitor_active_workers(&mut self) -> Result<()> {
        let mut finished: Vec<(String, i32)> = Vec::new();
        for (task_id, worker) in self.active.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    finished.push((task_id.clone(), status.code().unwrap_or(-1)));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "failed to poll worker, treating as dead");
                    finished.push((task_id.clone(), -1));
                }
            }
        }

        for (task_id, exit_code) in finished {
            let Some(worker) = self.active.remove(&task_id) else {
                continue;
            };
            let elapsed = worker.started.elapsed();
            self.note_run_time(elapsed);
            info!(
                task_id = %task_id,
                exit_code,
                phase = %worker.phase,
                elapsed_secs = elapsed.as_secs(),
                "worker exited"
            );

            self.close_dangling_run(&worker.run_id, exit_code).await;

            let outcome = if exit_code == 0 {
                self.advance_after_success(&task_id, &worker.phase, &worker.role)
                    .await
            } else {
                self.apply_retry_policy(&task_id, exit_code).await
            };
            if let Err(e) = outcome {
                warn!(task_id = %task_id, error = %format!("{e:#}"), "post-exit handling failed");
            }
        }

        Ok(())
    }

    /// Workers normally close their own run; if this one died before doing
    /// so, close it here so the ledger never holds an open run for a
    /// finished process.
    async fn close_dangling_run(&self, run_id: &str, exit_code: i32) {
        match run_db::get_run(&self.pool, run_id).await {
            Ok(Some(run)) if !run.run.status.is_terminal() => {
                let status = if exit_code == 0 {
                    RunStatus::Success
                } else {
                    RunStatus::Failure
                };
                let _ = run_db::update_run_status(
                    &self.pool,
                    run_id,
                    status,
                    None,
                    None,
                    Some("worker exited without writing a result"),
                    None,
                    None,
                )
                .await;
                warn!(run_id, exit_code, "closed dangling run");
            }
            Ok(_) => {}
            Err(e) => warn!(run_id, error = %e, "could not inspect run after exit"),
        }
    }

    async fn advance_after_success(
        &mut self,
        task_id: &str,
        finished_phase: &str,
        role: &str,
    ) -> Result<()> {
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            warn!(task_id, "task vanished after worker success");
            return Ok(());
        };

        if task.workflow.is_some() {
            match advance_task_phase(&self.pool, &task, true).await? {
                Advancement::Completed => {
                    self.publish_task_event(types::TASK_COMPLETED, task_id, "completed", None, finished_phase)
                        .await;
                }
                Advancement::Failed => {
                    self.publish_task_event(types::TASK_FAILED, task_id, "failed", None, finished_phase)
                        .await;
                }
                Advancement::Requeued(_) => {}
            }
            return Ok(());
        }

        // Fixed flow: after apply, go straight into a test-phase worker.
        if finished_phase == "apply" {
            let run_id = run_db::create_run(&self.pool, task_id, role, "test").await?;
            match self.spawn_worker_process(task_id, role, "test", &run_id, task.workspace_mode()) {
                Ok(child) => {
                    if let Err(e) = task_db::update_task_status(
                        &self.pool,
                        task_id,
                        TaskStatus::InProgress,
                        TaskPatch::default().phase("test").started_now(),
                    )
                    .await
                    {
                        warn!(task_id, error = %e, "could not record test phase");
                    }
                    info!(task_id, run_id = %run_id, "test phase spawned");
                    self.active.insert(
                        task_id.to_owned(),
                        ActiveWorker {
                            child,
                            run_id,
                            phase: "test".to_owned(),
                            role: role.to_owned(),
                            started: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(task_id, error = %format!("{e:#}"), "failed to spawn test phase");
                    let _ = run_db::update_run_status(
                        &self.pool,
                        &run_id,
                        RunStatus::Cancelled,
                        None,
                        None,
                        Some("test phase spawn failed"),
                        None,
                        None,
                    )
                    .await;
                    task_db::update_task_status(
                        &self.pool,
                        task_id,
                        TaskStatus::Failed,
                        TaskPatch::default().failure_reason("failed to spawn test phase"),
                    )
                    .await?;
                    self.publish_task_event(types::TASK_FAILED, task_id, "failed", None, "test")
                        .await;
                }
            }
            return Ok(());
        }

        // Test phase (or a later custom phase) succeeded: terminal success.
        task_db::update_task_status(&self.pool, task_id, TaskStatus::Completed, TaskPatch::default())
            .await?;
        self.publish_task_event(types::TASK_COMPLETED, task_id, "completed", None, finished_phase)
            .await;
        Ok(())
    }

    async fn apply_retry_policy(&mut self, task_id: &str, exit_code: i32) -> Result<()> {
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            warn!(task_id, "task vanished after worker failure");
            return Ok(());
        };

        let max_retries = if task.max_retries > 0 {
            task.max_retries
        } else {
            self.config.task_retry_limit
        };

        if task.retry_count < max_retries {
            let next_retry = task.retry_count + 1;
            info!(task_id, attempt = next_retry, max_retries, "requeueing failed task for retry");
            task_db::update_task_status(
                &self.pool,
                task_id,
                TaskStatus::Queued,
                TaskPatch::default()
                    .retry_count(next_retry)
                    .clear_assignment(),
            )
            .await?;
        } else {
            let reason = format!("worker exit code {exit_code} after {} retries", task.retry_count);
            info!(task_id, %reason, "task failed permanently");
            task_db::update_task_status(
                &self.pool,
                task_id,
                TaskStatus::Failed,
                TaskPatch::default().failure_reason(reason),
            )
            .await?;
            self.publish_task_event(types::TASK_FAILED, task_id, "failed", None, &task.current_phase)
                .await;
        }
        Ok(())
    }

    // -- Zombie recovery ----------------------------------------------------

    /// Reset in-progress tasks with no supervising worker entry whose
    /// `started_at` is stale. Recovery is silent: no events.
    pub async fn recover_zombies(&mut self) -> Result<()> {
        let in_progress = task_db::get_tasks_by_status(&self.pool, TaskStatus::InProgress).await?;
        let threshold = self.config.zombie_detection();

        for task in in_progress {
            if self.active.contains_key(&task.id) {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };
            if Utc::now() - started_at < threshold {
                continue;
            }
            info!(task_id = %task.id, "recovering zombie task");
            if let Err(e) = task_db::update_task_status(
                &self.pool,
                &task.id,
                TaskStatus::Queued,
                TaskPatch::default().clear_assignment().phase("plan"),
            )
            .await
            {
                warn!(task_id = %task.id, error = %e, "zombie recovery failed");
            }
        }
        Ok(())
    }

    // -- Idle & shutdown ----------------------------------------------------

    /// Standalone-run exit condition: nothing active, nothing pending, and
    /// at least one task ever reached a terminal state.
    pub async fn is_idle_and_done(&self) -> Result<bool> {
        if !self.active.is_empty() {
            return Ok(false);
        }
        let counts = task_db::count_tasks_by_status(&self.pool).await?;
        let count = |status: &str| {
            counts
                .iter()
                .find(|(s, _)| s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        let open =
            count("queued") + count("assigned") + count("in_progress") + count("review_pending");
        let settled = count("completed") + count("failed");
        Ok(open == 0 && settled > 0)
    }

    async fn shutdown(&mut self) {
        info!(active = self.active.len(), "queen shutting down");
        for (task_id, mut worker) in self.active.drain() {
            info!(task_id = %task_id, "terminating worker");
            #[cfg(unix)]
            if let Some(pid) = worker.child.id() {
                // SAFETY: pid belongs to a child we spawned.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = worker.child.start_kill();
            }
            let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN, worker.child.wait()).await;
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn note_run_time(&mut self, elapsed: Duration) {
        self.completed_runs += 1;
        let secs = elapsed.as_secs_f64();
        self.average_run_secs += (secs - self.average_run_secs) / self.completed_runs as f64;
    }

    async fn publish_task_event(
        &self,
        event_type: &str,
        task_id: &str,
        status: &str,
        assignee: Option<&str>,
        phase: &str,
    ) {
        let event = task_event(event_type, task_id, "queen", Some(status), assignee, Some(phase));
        if let Err(e) = self.bus.publish(event, None).await {
            warn!(task_id, event_type, error = %e, "failed to publish task event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn task_with(
        task_type: &str,
        tags: Vec<String>,
        payload: Option<serde_json::Value>,
        phase: &str,
    ) -> Task {
        Task {
            id: "t1".into(),
            title: "t1".into(),
            description: String::new(),
            task_type: task_type.into(),
            priority: 1,
            status: TaskStatus::Queued,
            current_phase: phase.into(),
            workflow: None,
            payload: payload.map(Json),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            assigned_worker: None,
            due_date: None,
            max_retries: 3,
            tags: (!tags.is_empty()).then(|| Json(tags)),
            retry_count: 0,
            assignee: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            worktree: None,
            workspace_type: None,
            depends_on: None,
        }
    }

    #[test]
    fn role_from_planned_subtask_assignee() {
        let task = task_with(
            "planned_subtask",
            vec![],
            Some(serde_json::json!({"assignee": "worker:frontend"})),
            "start",
        );
        assert_eq!(worker_role_for(&task), "frontend");
    }

    #[test]
    fn unknown_assignee_role_coerces_to_backend() {
        let task = task_with(
            "planned_subtask",
            vec![],
            Some(serde_json::json!({"assignee": "worker:database"})),
            "start",
        );
        assert_eq!(worker_role_for(&task), "backend");
    }

    #[test]
    fn role_from_first_tag_or_default() {
        let tagged = task_with("impl", vec!["infra".into()], None, "start");
        assert_eq!(worker_role_for(&tagged), "infra");

        let odd_tag = task_with("impl", vec!["urgent".into()], None, "start");
        assert_eq!(worker_role_for(&odd_tag), "backend");

        let untagged = task_with("impl", vec![], None, "start");
        assert_eq!(worker_role_for(&untagged), "backend");
    }

    #[test]
    fn spawn_phase_maps_initial_phases_to_apply() {
        assert_eq!(spawn_phase_for(&task_with("impl", vec![], None, "start")), "apply");
        assert_eq!(spawn_phase_for(&task_with("impl", vec![], None, "plan")), "apply");
        assert_eq!(spawn_phase_for(&task_with("impl", vec![], None, "test")), "test");
        assert_eq!(spawn_phase_for(&task_with("impl", vec![], None, "rework")), "rework");
    }
}
