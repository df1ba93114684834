use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Task type value that triggers dependency gating.
pub const TASK_TYPE_PLANNED_SUBTASK: &str = "planned_subtask";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    InProgress,
    ReviewPending,
    Approved,
    Rejected,
    ReworkNeeded,
    Escalated,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `completed` and `failed` admit no further transitions except
    /// administrative reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::ReviewPending => "review_pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ReworkNeeded => "rework_needed",
            Self::Escalated => "escalated",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "review_pending" => Ok(Self::ReviewPending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "rework_needed" => Ok(Self::ReworkNeeded),
            "escalated" => Ok(Self::Escalated),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single run (one execution attempt of one phase of one task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Role a worker fills. The three executor roles map to prompt templates
/// and per-role parallelism caps; `orchestrator` is the queen itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Backend,
    Frontend,
    Infra,
    Orchestrator,
}

impl WorkerRole {
    /// Coerce a free-form role string; anything unrecognized becomes
    /// `backend`.
    pub fn coerce(s: &str) -> Self {
        s.parse().unwrap_or(Self::Backend)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Infra => "infra",
            Self::Orchestrator => "orchestrator",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerRole {
    type Err = WorkerRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "infra" => Ok(Self::Infra),
            "orchestrator" => Ok(Self::Orchestrator),
            other => Err(WorkerRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerRole`] string.
#[derive(Debug, Clone)]
pub struct WorkerRoleParseError(pub String);

impl fmt::Display for WorkerRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker role: {:?}", self.0)
    }
}

impl std::error::Error for WorkerRoleParseError {}

// ---------------------------------------------------------------------------

/// Registration status of a worker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Offline,
    Error,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Generated,
    Approved,
    Executing,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Generated => "generated",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "generated" => Ok(Self::Generated),
            "approved" => Ok(Self::Approved),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a planning-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanningStatus {
    Pending,
    Assigned,
    Planned,
    Failed,
}

impl fmt::Display for PlanningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Planned => "planned",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanningStatus {
    type Err = PlanningStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "planned" => Ok(Self::Planned),
            "failed" => Ok(Self::Failed),
            other => Err(PlanningStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanningStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanningStatusParseError(pub String);

impl fmt::Display for PlanningStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid planning status: {:?}", self.0)
    }
}

impl std::error::Error for PlanningStatusParseError {}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// One step of a task workflow state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase_on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase_on_failure: Option<String>,
}

/// Workflow definition: phase name -> successor mapping. Absent workflows
/// get the fixed `apply -> test -> completed` flow.
pub type Workflow = BTreeMap<String, WorkflowStep>;

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- a unit of work in the scheduler's queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub current_phase: String,
    pub workflow: Option<Json<Workflow>>,
    pub payload: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_worker: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub max_retries: i64,
    pub tags: Option<Json<Vec<String>>>,
    pub retry_count: i64,
    pub assignee: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub worktree: Option<String>,
    pub workspace_type: Option<String>,
    pub depends_on: Option<Json<Vec<String>>>,
}

impl Task {
    pub fn is_planned_subtask(&self) -> bool {
        self.task_type == TASK_TYPE_PLANNED_SUBTASK
    }

    pub fn tag_list(&self) -> &[String] {
        self.tags.as_ref().map(|t| t.0.as_slice()).unwrap_or(&[])
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.0.get(key)?.as_str()
    }

    fn payload_str_list(&self, key: &str) -> Vec<String> {
        self.payload
            .as_ref()
            .and_then(|p| p.0.get(key))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parent execution plan for planned subtasks.
    pub fn parent_plan_id(&self) -> Option<&str> {
        self.payload_str("parent_plan_id")
    }

    /// Plan-local subtask id for planned subtasks.
    pub fn subtask_id(&self) -> Option<&str> {
        self.payload_str("subtask_id")
    }

    /// Dependency subtask ids (plan-local ids or full task ids).
    pub fn dependencies(&self) -> Vec<String> {
        self.payload_str_list("dependencies")
    }

    /// Prior tasks whose results should be loaded as prompt context.
    pub fn context_from(&self) -> Vec<String> {
        self.payload_str_list("context_from")
    }

    /// Worker role parsed from a `worker:<role>` payload assignee.
    pub fn payload_assignee_role(&self) -> Option<&str> {
        self.payload_str("assignee")?.strip_prefix("worker:")
    }

    /// Workspace mode requested by the payload; defaults to `repo`.
    pub fn workspace_mode(&self) -> &str {
        self.payload_str("workspace").unwrap_or("repo")
    }

    /// Workflow step for the given phase, if a workflow is defined.
    pub fn workflow_step(&self, phase: &str) -> Option<&WorkflowStep> {
        self.workflow.as_ref()?.0.get(phase)
    }
}

/// A run -- one execution attempt of one phase of one task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub run_number: i64,
    pub status: RunStatus,
    pub phase: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<Json<serde_json::Value>>,
    pub error_message: Option<String>,
    pub output_log: Option<String>,
    pub transcript: Option<String>,
}

/// The `result` view synthesized on read for caller convenience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub data: serde_json::Value,
    pub error_message: Option<String>,
    pub output_log: Option<String>,
}

/// A run together with its synthesized [`RunResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWithResult {
    pub run: Run,
    pub result: RunResult,
}

impl From<Run> for RunWithResult {
    fn from(run: Run) -> Self {
        let result = RunResult {
            status: run.status,
            data: run
                .result_data
                .as_ref()
                .map(|j| j.0.clone())
                .unwrap_or(serde_json::Value::Object(Default::default())),
            error_message: run.error_message.clone(),
            output_log: run.output_log.clone(),
        };
        Self { run, result }
    }
}

/// A registered worker (registration row, not a live process).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerRecord {
    pub id: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: Option<Json<Vec<String>>>,
    pub current_task_id: Option<String>,
    pub metadata: Option<Json<serde_json::Value>>,
    pub registered_at: DateTime<Utc>,
}

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_agent: String,
    pub correlation_id: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// An incoming free-form request awaiting planning.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanningRequest {
    pub id: String,
    pub task_description: String,
    pub priority: i64,
    pub requestor: Option<String>,
    pub context_data: Option<Json<serde_json::Value>>,
    pub status: PlanningStatus,
    pub complexity_estimate: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_agent: Option<String>,
}

/// Planner output: a plan whose `plan_data` embeds the subtask list.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionPlan {
    pub id: String,
    pub planning_task_id: String,
    pub plan_data: Json<PlanData>,
    pub estimated_duration: Option<i64>,
    pub estimated_complexity: String,
    pub generated_workflow: Option<Json<serde_json::Value>>,
    pub subtask_count: i64,
    pub dependency_count: i64,
    pub generated_at: DateTime<Utc>,
    pub status: PlanStatus,
    pub updated_at: DateTime<Utc>,
}

/// Structured view of `execution_plans.plan_data`.
///
/// Unknown keys round-trip through `extra` so progress rewrites never drop
/// planner-supplied fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanData {
    #[serde(default)]
    pub sub_tasks: Vec<PlanSubtask>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One subtask entry inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSubtask {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub workflow_phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<i64>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PlanSubtask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            assignee: None,
            priority: None,
            dependencies: Vec::new(),
            workflow_phase: None,
            status: None,
            complexity: None,
            estimated_duration: None,
            required_skills: Vec::new(),
            deliverables: Vec::new(),
            updated_at: None,
            extra: Default::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::ReviewPending,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::ReworkNeeded,
            TaskStatus::Escalated,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::ReviewPending.is_terminal());
    }

    #[test]
    fn run_status_display_roundtrip() {
        let variants = [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_status_invalid() {
        assert!("nope".parse::<RunStatus>().is_err());
    }

    #[test]
    fn worker_role_roundtrip_and_coercion() {
        for v in [
            WorkerRole::Backend,
            WorkerRole::Frontend,
            WorkerRole::Infra,
            WorkerRole::Orchestrator,
        ] {
            let parsed: WorkerRole = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
        assert_eq!(WorkerRole::coerce("frontend"), WorkerRole::Frontend);
        assert_eq!(WorkerRole::coerce("database"), WorkerRole::Backend);
    }

    #[test]
    fn plan_status_display_roundtrip() {
        let variants = [
            PlanStatus::Draft,
            PlanStatus::Generated,
            PlanStatus::Approved,
            PlanStatus::Executing,
            PlanStatus::Completed,
            PlanStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PlanStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn planning_status_display_roundtrip() {
        let variants = [
            PlanningStatus::Pending,
            PlanningStatus::Assigned,
            PlanningStatus::Planned,
            PlanningStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PlanningStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn worker_status_invalid() {
        assert!("sleeping".parse::<WorkerStatus>().is_err());
    }

    fn minimal_task(payload: Option<serde_json::Value>) -> Task {
        Task {
            id: "t1".into(),
            title: "t1".into(),
            description: String::new(),
            task_type: TASK_TYPE_PLANNED_SUBTASK.into(),
            priority: 1,
            status: TaskStatus::Queued,
            current_phase: "start".into(),
            workflow: None,
            payload: payload.map(Json),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            assigned_worker: None,
            due_date: None,
            max_retries: 3,
            tags: None,
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
    fn payload_accessors() {
        let task = minimal_task(Some(serde_json::json!({
            "parent_plan_id": "plan-1",
            "subtask_id": "a",
            "dependencies": ["b", "c"],
            "assignee": "worker:frontend",
            "workspace": "fresh",
            "context_from": ["t0"],
        })));
        assert!(task.is_planned_subtask());
        assert_eq!(task.parent_plan_id(), Some("plan-1"));
        assert_eq!(task.subtask_id(), Some("a"));
        assert_eq!(task.dependencies(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(task.payload_assignee_role(), Some("frontend"));
        assert_eq!(task.workspace_mode(), "fresh");
        assert_eq!(task.context_from(), vec!["t0".to_string()]);
    }

    #[test]
    fn payload_accessors_default_when_absent() {
        let task = minimal_task(None);
        assert_eq!(task.parent_plan_id(), None);
        assert!(task.dependencies().is_empty());
        assert_eq!(task.workspace_mode(), "repo");
    }

    #[test]
    fn workflow_step_lookup() {
        let mut wf = Workflow::new();
        wf.insert(
            "apply".into(),
            WorkflowStep {
                next_phase_on_success: Some("test".into()),
                next_phase_on_failure: Some("failed".into()),
            },
        );
        let mut task = minimal_task(None);
        task.workflow = Some(Json(wf));
        let step = task.workflow_step("apply").expect("step");
        assert_eq!(step.next_phase_on_success.as_deref(), Some("test"));
        assert!(task.workflow_step("test").is_none());
    }

    #[test]
    fn plan_data_roundtrip_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "sub_tasks": [
                {"id": "a", "title": "A", "dependencies": [], "custom_field": 7}
            ],
            "planner_notes": "keep me",
        });
        let parsed: PlanData = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(parsed.sub_tasks.len(), 1);
        assert_eq!(parsed.sub_tasks[0].extra.get("custom_field").and_then(|v| v.as_i64()), Some(7));
        let back = serde_json::to_value(&parsed).expect("serialize");
        assert_eq!(back.get("planner_notes"), raw.get("planner_notes"));
    }

    #[test]
    fn run_with_result_synthesis() {
        let run = Run {
            id: "r1".into(),
            task_id: "t1".into(),
            worker_id: "backend".into(),
            run_number: 1,
            status: RunStatus::Success,
            phase: Some("apply".into()),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            result_data: Some(Json(serde_json::json!({"exit_code": 0}))),
            error_message: None,
            output_log: None,
            transcript: None,
        };
        let with_result = RunWithResult::from(run);
        assert_eq!(with_result.result.status, RunStatus::Success);
        assert_eq!(
            with_result.result.data.get("exit_code").and_then(|v| v.as_i64()),
            Some(0)
        );
    }
}
