//! Prompt composition for agent invocations.
//!
//! The prompt is a single string parameterized by role, phase, and task
//! fields, optionally prefixed with context loaded from the result files of
//! prior tasks named in `payload.context_from`.

use std::path::Path;

use apiary_db::models::Task;
use tracing::debug;

use crate::paths::Layout;

/// Human-readable role description used in the prompt header.
pub fn role_title(role: &str) -> String {
    match role {
        "backend" => "Backend Developer (APIs, services, data layers)".to_owned(),
        "frontend" => "Frontend Developer (UI components and client logic)".to_owned(),
        "infra" => "Infrastructure Engineer (build, deployment, CI)".to_owned(),
        other => {
            let mut chars = other.chars();
            let capitalized = match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            };
            format!("{capitalized} Developer")
        }
    }
}

/// Phase-specific guidance appended to the prompt.
pub fn phase_guidance(phase: &str) -> &'static str {
    match phase {
        "apply" => {
            "Focus on implementation. Create actual working code and configuration \
             with inline planning."
        }
        "test" => {
            "Focus on validation. Write comprehensive tests and verify the \
             implementation works correctly."
        }
        "plan" => "Produce a structured breakdown of the work before touching code.",
        _ => "Complete the requested task.",
    }
}

/// Load context from the most recent result file of each referenced task.
///
/// Extracts status, notes, created/modified file lists (capped at five
/// entries each), and any context hints. Missing results produce a
/// placeholder line rather than an error.
pub fn load_task_context(layout: &Layout, context_from: &[String]) -> String {
    if context_from.is_empty() {
        return String::new();
    }

    let mut sections = Vec::new();
    for prev_task_id in context_from {
        let results_dir = layout.task_results_dir(prev_task_id);
        match latest_result_file(&results_dir) {
            Some(path) => match read_result_context(prev_task_id, &path) {
                Ok(text) => sections.push(text),
                Err(e) => {
                    sections.push(format!("[Context from {prev_task_id}: error loading - {e}]"))
                }
            },
            None => sections.push(format!("[Context from {prev_task_id}: no results found]")),
        }
    }

    let mut out = sections.join("\n");
    out.push('\n');
    out
}

fn latest_result_file(results_dir: &Path) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(results_dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .max_by_key(|p| {
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        })
}

fn read_result_context(task_id: &str, path: &Path) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path)?;
    let result: serde_json::Value = serde_json::from_str(&contents)?;

    let mut text = format!("CONTEXT FROM TASK '{task_id}':\n");
    text.push_str(&format!(
        "- Status: {}\n",
        result.get("status").and_then(|v| v.as_str()).unwrap_or("unknown")
    ));
    text.push_str(&format!(
        "- Notes: {}\n",
        result.get("notes").and_then(|v| v.as_str()).unwrap_or("N/A")
    ));

    let files = result.get("files");
    for (label, key) in [("Files created", "created"), ("Files modified", "modified")] {
        let list: Vec<&str> = files
            .and_then(|f| f.get(key))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if list.is_empty() {
            continue;
        }
        let shown = list.iter().take(5).copied().collect::<Vec<_>>().join(", ");
        if list.len() > 5 {
            text.push_str(&format!("- {label}: {shown} (+{} more)\n", list.len() - 5));
        } else {
            text.push_str(&format!("- {label}: {shown}\n"));
        }
    }

    if let Some(hints) = result.get("context_hints").and_then(|v| v.as_str()) {
        text.push_str(&format!("- Key insights: {hints}\n"));
    }

    Ok(text)
}

/// Build the full execution prompt for one (task, phase) assignment.
pub fn compose_prompt(role: &str, phase: &str, task: &Task, context: &str) -> String {
    let acceptance = task
        .payload
        .as_ref()
        .and_then(|p| p.0.get("instruction"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let execution_steps = if phase == "apply" {
        "1. Create the implementation with proper structure and functionality\n\
         2. Focus on making it work correctly\n\
         3. Include basic validation and checks in the code"
    } else {
        "1. Write and run comprehensive tests for the implementation\n\
         2. Verify all functionality works as expected\n\
         3. Test edge cases and error conditions"
    };

    let prompt = format!(
        "EXECUTE TASK IMMEDIATELY: {title} (ID: {task_id})\n\
         \n\
         COMMAND MODE: Execute now, do not acknowledge or discuss\n\
         ROLE: {role_title}\n\
         WORKSPACE: Current directory\n\
         \n\
         DESCRIPTION: {description}\n\
         \n\
         {context}ACCEPTANCE CRITERIA:\n\
         {acceptance}\n\
         \n\
         PHASE: {phase_upper}\n\
         {phase_focus}\n\
         \n\
         EXECUTION REQUIREMENTS:\n\
         {execution_steps}\n\
         4. Run any tests to verify they pass\n\
         5. If tests fail, attempt ONE minimal fix\n\
         6. Keep changes focused and minimal\n\
         7. Commit with message including task ID: {task_id} and phase: {phase}\n\
         \n\
         CRITICAL PATH CONSTRAINT:\n\
         - You are running in an isolated workspace directory\n\
         - ONLY create files in the current directory (.) using relative paths\n\
         - DO NOT use absolute paths or ../../../ paths to access parent directories\n\
         - All file operations must be relative to your current working directory\n\
         - Do not navigate outside your workspace\n",
        title = task.title,
        task_id = task.id,
        role_title = role_title(role),
        description = task.description,
        context = context,
        acceptance = acceptance,
        phase_upper = phase.to_uppercase(),
        phase_focus = phase_guidance(phase),
        execution_steps = execution_steps,
        phase = phase,
    );

    debug!(task_id = %task.id, phase, prompt_len = prompt.len(), "prompt composed");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_db::models::TaskStatus;
    use chrono::Utc;
    use sqlx::types::Json;

    fn sample_task(payload: Option<serde_json::Value>) -> Task {
        Task {
            id: "t1".into(),
            title: "add login".into(),
            description: "add a login endpoint".into(),
            task_type: "impl".into(),
            priority: 1,
            status: TaskStatus::Queued,
            current_phase: "apply".into(),
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
    fn role_titles() {
        assert!(role_title("backend").starts_with("Backend Developer"));
        assert!(role_title("frontend").starts_with("Frontend Developer"));
        assert_eq!(role_title("qa"), "Qa Developer");
    }

    #[test]
    fn prompt_carries_task_fields_and_phase() {
        let task = sample_task(Some(serde_json::json!({"instruction": "must return 200"})));
        let prompt = compose_prompt("backend", "apply", &task, "");
        assert!(prompt.contains("add login"));
        assert!(prompt.contains("ID: t1"));
        assert!(prompt.contains("must return 200"));
        assert!(prompt.contains("PHASE: APPLY"));
        assert!(prompt.contains("Focus on implementation"));
    }

    #[test]
    fn test_phase_prompt_focuses_on_validation() {
        let task = sample_task(None);
        let prompt = compose_prompt("backend", "test", &task, "");
        assert!(prompt.contains("PHASE: TEST"));
        assert!(prompt.contains("comprehensive tests"));
    }

    #[test]
    fn context_loading_reads_latest_result() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        let dir = layout.task_results_dir("t0");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("r1.json"),
            serde_json::json!({
                "status": "success",
                "notes": "all good",
                "files": {"created": ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs"], "modified": []},
                "context_hints": "entry point is a.rs",
            })
            .to_string(),
        )
        .unwrap();

        let context = load_task_context(&layout, &["t0".into()]);
        assert!(context.contains("CONTEXT FROM TASK 't0'"));
        assert!(context.contains("Status: success"));
        assert!(context.contains("(+1 more)"));
        assert!(context.contains("entry point is a.rs"));
    }

    #[test]
    fn context_loading_reports_missing_results() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        let context = load_task_context(&layout, &["ghost".into()]);
        assert!(context.contains("[Context from ghost: no results found]"));
    }

    #[test]
    fn empty_context_list_yields_empty_string() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        assert_eq!(load_task_context(&layout, &[]), "");
    }
}
