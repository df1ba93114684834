//! Agent CLI invocation: binary discovery, subprocess launch with
//! environment containment, streaming output capture, and timeout
//! enforcement.
//!
//! The agent emits stream-json lines on stdout; we parse them to detect
//! assistant messages and the `result` terminator while mirroring every
//! line into the per-run log file and the in-memory transcript.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Agent invocation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Explicit path to the agent binary; discovery runs when absent.
    pub binary: Option<PathBuf>,
    /// Hard wall-clock limit for one invocation.
    pub timeout: Duration,
    /// Grace period between terminate and kill.
    pub kill_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(30),
        }
    }
}

/// What one agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// Process exit code; -1 is synthesized on timeout or kill.
    pub exit_code: i64,
    /// Whether the stream emitted its `result` terminator.
    pub completed: bool,
    /// Whether the wall-clock limit fired.
    pub timed_out: bool,
    /// Number of output lines captured.
    pub output_lines: usize,
    /// Full captured transcript, ending with an exit marker line.
    pub transcript: String,
}

/// Locate the agent binary: explicit config path, then common install
/// locations, then a `PATH` walk.
pub fn find_agent_binary(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            info!(path = %path.display(), "using configured agent binary");
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "configured agent binary does not exist");
    }

    if let Some(home) = dirs::home_dir() {
        let candidates = [
            home.join(".npm-global").join("bin").join("claude"),
            home.join(".npm-global").join("claude.cmd"),
            home.join(".local").join("bin").join("claude"),
        ];
        for candidate in candidates {
            if candidate.exists() {
                info!(path = %candidate.display(), "found agent binary in install path");
                return Some(candidate);
            }
        }
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("claude");
        if candidate.is_file() {
            info!(path = %candidate.display(), "found agent binary on PATH");
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let candidate = dir.join("claude.cmd");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    warn!("agent binary not found");
    None
}

// ---------------------------------------------------------------------------
// Stream-json parsing
// ---------------------------------------------------------------------------

/// Signals extracted from one stream-json line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamSignal {
    /// An assistant message block.
    Assistant,
    /// The final result message; `success` reflects `subtype`.
    Result { success: bool },
    /// Valid JSON of no scheduling interest, or a non-JSON line.
    Other,
}

pub(crate) fn parse_stream_line(line: &str) -> StreamSignal {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return StreamSignal::Other;
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => StreamSignal::Assistant,
        Some("result") => StreamSignal::Result {
            success: value.get("subtype").and_then(|s| s.as_str()) == Some("success"),
        },
        _ => StreamSignal::Other,
    }
}

// ---------------------------------------------------------------------------
// Live output formatting
// ---------------------------------------------------------------------------

/// Formats stream lines for live terminal output, color-coded per role.
#[derive(Debug, Clone)]
pub struct LiveFormatter {
    role: String,
}

impl LiveFormatter {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    fn prefix(&self) -> String {
        let color = match self.role.as_str() {
            "backend" => "\x1b[94m",
            "frontend" => "\x1b[92m",
            "infra" => "\x1b[93m",
            _ => "\x1b[97m",
        };
        format!("{color}[{}]\x1b[0m", self.role.to_uppercase())
    }

    /// Render one stream line for the terminal, or `None` when the line is
    /// noise (system chatter, empty blocks).
    pub fn format_line(&self, line: &str) -> Option<String> {
        let prefix = self.prefix();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            return Some(format!("{prefix} {trimmed}"));
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                let content = value.get("message")?.get("content")?.as_array()?;
                for block in content {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            let text = block.get("text")?.as_str()?.trim();
                            if !text.is_empty() {
                                return Some(format!("{prefix} {text}"));
                            }
                        }
                        Some("tool_use") => {
                            let tool = block.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                            let input = block.get("input");
                            return Some(match tool {
                                "Bash" => {
                                    let cmd = input
                                        .and_then(|i| i.get("command"))
                                        .and_then(|c| c.as_str())
                                        .unwrap_or("");
                                    format!("{prefix} $ {cmd}")
                                }
                                "Write" | "Edit" | "MultiEdit" | "Read" => {
                                    let file = input
                                        .and_then(|i| i.get("file_path"))
                                        .and_then(|f| f.as_str())
                                        .unwrap_or("");
                                    format!("{prefix} {tool} {file}")
                                }
                                other => format!("{prefix} {other}()"),
                            });
                        }
                        _ => {}
                    }
                }
                None
            }
            Some("result") => {
                let text = value.get("result").and_then(|r| r.as_str()).unwrap_or("done");
                Some(format!("{prefix} result: {text}"))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Run the agent once in `workspace` with the given prompt.
///
/// The child's cwd and workspace environment variables are pinned to the
/// workspace, with `GIT_CEILING_DIRECTORIES` set so the agent cannot
/// discover a parent repository. On Windows both output pipes are
/// discarded (streaming pipes deadlock the agent CLI there); elsewhere
/// stdout and stderr are captured and streamed into the log file, the
/// transcript, and the optional live formatter.
pub async fn run_agent(
    binary: &Path,
    prompt: &str,
    workspace: &Path,
    log_path: Option<&Path>,
    live: Option<&LiveFormatter>,
    config: &AgentConfig,
) -> Result<AgentOutcome> {
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let mut cmd = Command::new(binary);
    cmd.arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--add-dir")
        .arg(&workspace)
        .arg("--dangerously-skip-permissions")
        .arg("-p")
        .arg(prompt);

    cmd.current_dir(&workspace);
    cmd.env("CLAUDE_PROJECT_ROOT", &workspace)
        .env("CLAUDE_WORKSPACE_ROOT", &workspace)
        .env("PWD", &workspace)
        .env("WORKSPACE", &workspace)
        .env("GIT_CEILING_DIRECTORIES", &workspace)
        .env("PYTHONUNBUFFERED", "1");
    cmd.stdin(Stdio::null());

    debug!(
        binary = %binary.display(),
        workspace = %workspace.display(),
        prompt_len = prompt.len(),
        "launching agent"
    );

    #[cfg(windows)]
    {
        let _ = (log_path, live);
        run_detached(cmd, config).await
    }
    #[cfg(not(windows))]
    {
        run_piped(cmd, log_path, live, config).await
    }
}

/// Windows path: no pipes (they deadlock the agent CLI); only the exit
/// code is observed.
#[cfg(windows)]
async fn run_detached(mut cmd: Command, config: &AgentConfig) -> Result<AgentOutcome> {
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn agent binary")?;
    let mut outcome = AgentOutcome::default();

    match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("failed to wait on agent")?;
            outcome.exit_code = status.code().map(i64::from).unwrap_or(-1);
        }
        Err(_) => {
            warn!("agent timed out, terminating");
            terminate_child(&mut child, config.kill_grace).await;
            outcome.exit_code = -1;
            outcome.timed_out = true;
        }
    }

    outcome.transcript = format!("\n=== EXIT CODE: {} ===", outcome.exit_code);
    Ok(outcome)
}

/// Unix path: capture both pipes and stream them line by line.
#[cfg(not(windows))]
async fn run_piped(
    mut cmd: Command,
    log_path: Option<&Path>,
    live: Option<&LiveFormatter>,
    config: &AgentConfig,
) -> Result<AgentOutcome> {
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_stream::wrappers::LinesStream;

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn agent binary")?;
    let stdout = child.stdout.take().context("agent stdout not captured")?;
    let stderr = child.stderr.take().context("agent stderr not captured")?;

    let stdout_lines = LinesStream::new(BufReader::new(stdout).lines());
    let stderr_lines = LinesStream::new(BufReader::new(stderr).lines());
    let mut merged = futures::stream::select(stdout_lines, stderr_lines);

    let mut log_file = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create log dir {}", parent.display()))?;
            }
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("cannot open log file {}", path.display()))?,
            )
        }
        None => None,
    };

    let deadline = tokio::time::Instant::now() + config.timeout;
    let mut outcome = AgentOutcome::default();
    let mut transcript: Vec<String> = Vec::new();
    let mut timed_out = false;

    loop {
        tokio::select! {
            next = merged.next() => match next {
                Some(Ok(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    outcome.output_lines += 1;
                    transcript.push(line.to_owned());
                    if let Some(file) = &mut log_file {
                        let _ = writeln!(file, "{line}");
                    }
                    if let Some(formatter) = live {
                        if let Some(formatted) = formatter.format_line(line) {
                            println!("{formatted}");
                        }
                    }
                    match parse_stream_line(line) {
                        StreamSignal::Result { success } => {
                            outcome.completed = true;
                            if success {
                                info!("agent reported successful completion");
                            }
                        }
                        StreamSignal::Assistant | StreamSignal::Other => {}
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "error reading agent output");
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
        }
    }

    if timed_out {
        warn!(timeout_secs = config.timeout.as_secs(), "agent timed out, terminating");
        terminate_child(&mut child, config.kill_grace).await;
        outcome.exit_code = -1;
        outcome.timed_out = true;
    } else {
        // Pipes closed; the process should exit promptly.
        match tokio::time::timeout(Duration::from_secs(30), child.wait()).await {
            Ok(status) => {
                let status = status.context("failed to wait on agent")?;
                outcome.exit_code = status.code().map(i64::from).unwrap_or(-1);
            }
            Err(_) => {
                warn!("agent did not exit after closing its pipes, killing");
                let _ = child.kill().await;
                outcome.exit_code = -1;
            }
        }
    }

    let exit_marker = format!("\n=== EXIT CODE: {} ===", outcome.exit_code);
    if let Some(file) = &mut log_file {
        let _ = writeln!(file, "{exit_marker}");
    }
    transcript.push(exit_marker);
    outcome.transcript = transcript.join("\n");

    Ok(outcome)
}

/// Graceful terminate (SIGTERM on Unix), bounded wait, then hard kill.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to kill");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {
            debug!("agent exited after terminate");
        }
        _ => {
            debug!("agent did not exit in grace period, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_assistant_line() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        assert_eq!(parse_stream_line(line), StreamSignal::Assistant);
    }

    #[test]
    fn parse_result_success() {
        let line = r#"{"type":"result","subtype":"success","result":"Done."}"#;
        assert_eq!(parse_stream_line(line), StreamSignal::Result { success: true });
    }

    #[test]
    fn parse_result_error_subtype() {
        let line = r#"{"type":"result","subtype":"error_max_turns"}"#;
        assert_eq!(parse_stream_line(line), StreamSignal::Result { success: false });
    }

    #[test]
    fn parse_other_and_malformed() {
        assert_eq!(
            parse_stream_line(r#"{"type":"system","data":"warmup"}"#),
            StreamSignal::Other
        );
        assert_eq!(parse_stream_line("not json at all"), StreamSignal::Other);
    }

    #[test]
    fn find_agent_prefers_explicit_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let binary = tmp.path().join("claude");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        assert_eq!(find_agent_binary(Some(&binary)), Some(binary));
    }

    #[test]
    fn find_agent_ignores_missing_explicit_path() {
        // Falls through to discovery; may or may not find a real binary,
        // but must not return the bogus path.
        let bogus = Path::new("/definitely/not/here/claude");
        let found = find_agent_binary(Some(bogus));
        assert_ne!(found.as_deref(), Some(bogus));
    }

    #[test]
    fn live_formatter_renders_bash_and_text() {
        let formatter = LiveFormatter::new("backend");
        let tool = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let formatted = formatter.format_line(tool).unwrap();
        assert!(formatted.contains("$ ls"));
        assert!(formatted.contains("BACKEND"));

        let text = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}"#;
        assert!(formatter.format_line(text).unwrap().contains("working"));

        let system = r#"{"type":"system","subtype":"init"}"#;
        assert!(formatter.format_line(system).is_none());
    }
}
