//! Workspace lifecycle for worker runs.
//!
//! Two modes: `fresh` (scratch directory, purged on the apply phase and
//! reused on the test phase) and `repo` (a git worktree on a per-task
//! branch, sharing the main repository's object store). Repo mode captures
//! the HEAD commit at attach time as the baseline for later change
//! detection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

/// Errors from workspace preparation.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Unrecognized mode string.
    #[error("unknown workspace mode: {0:?}")]
    UnknownMode(String),

    /// A git command failed to execute at all.
    #[error("failed to run git {command}: {source}")]
    GitCommand {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree was created but its `.git` marker is missing.
    #[error("worktree created but missing .git marker: {0}")]
    MissingMarker(PathBuf),

    /// Filesystem failure while managing the workspace directory.
    #[error("workspace io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Workspace isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// Per-(role, task) scratch directory under the workspaces root.
    Fresh,
    /// Git worktree on an `agent/<role>/<task>` branch.
    Repo,
}

impl fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fresh => "fresh",
            Self::Repo => "repo",
        })
    }
}

impl FromStr for WorkspaceMode {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(Self::Fresh),
            "repo" => Ok(Self::Repo),
            other => Err(WorkspaceError::UnknownMode(other.to_owned())),
        }
    }
}

/// A prepared workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub mode: WorkspaceMode,
    /// Branch checked out in repo mode.
    pub branch: Option<String>,
    /// HEAD commit captured at attach time (repo mode).
    pub baseline: Option<String>,
}

/// Files touched during a run, relative to the workspace root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    pub created: Vec<String>,
    pub modified: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty()
    }
}

/// Branch-safe form of a task id: alphanumerics, `-`, and `_` survive,
/// everything else becomes `_`.
pub fn safe_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Conventional branch name for a (role, task) pair.
pub fn branch_name(role: &str, task_id: &str) -> String {
    format!("agent/{role}/{}", safe_task_id(task_id))
}

/// Prepare the workspace at `workspace_path` for one run.
///
/// Fresh mode purges an existing directory only on the `apply` phase so
/// the test phase sees the apply phase's artifacts. Repo mode attaches or
/// creates a worktree branch rooted at `repo_root`'s HEAD.
pub fn prepare_workspace(
    repo_root: &Path,
    workspace_path: &Path,
    role: &str,
    task_id: &str,
    phase: &str,
    mode: WorkspaceMode,
) -> Result<Workspace, WorkspaceError> {
    match mode {
        WorkspaceMode::Fresh => prepare_fresh(workspace_path, phase),
        WorkspaceMode::Repo => prepare_worktree(repo_root, workspace_path, role, task_id),
    }
}

fn prepare_fresh(workspace_path: &Path, phase: &str) -> Result<Workspace, WorkspaceError> {
    if phase == "apply" && workspace_path.exists() {
        // Windows file locking can make this fail; mkdir below copes.
        if let Err(e) = std::fs::remove_dir_all(workspace_path) {
            warn!(path = %workspace_path.display(), error = %e, "could not purge workspace, continuing");
        } else {
            info!(path = %workspace_path.display(), "purged workspace for apply phase");
        }
    }

    std::fs::create_dir_all(workspace_path).map_err(|e| WorkspaceError::Io {
        path: workspace_path.to_path_buf(),
        source: e,
    })?;

    let nonempty = std::fs::read_dir(workspace_path)
        .map(|mut d| d.next().is_some())
        .unwrap_or(false);
    if phase == "test" && nonempty {
        info!(path = %workspace_path.display(), "reusing workspace contents for test phase");
    }

    Ok(Workspace {
        path: workspace_path.to_path_buf(),
        mode: WorkspaceMode::Fresh,
        branch: None,
        baseline: None,
    })
}

fn prepare_worktree(
    repo_root: &Path,
    workspace_path: &Path,
    role: &str,
    task_id: &str,
) -> Result<Workspace, WorkspaceError> {
    let branch = branch_name(role, task_id);

    if workspace_path.exists() {
        if workspace_path.join(".git").exists() {
            info!(path = %workspace_path.display(), branch = %branch, "reusing existing worktree");
            let baseline = head_commit(workspace_path).ok();
            return Ok(Workspace {
                path: workspace_path.to_path_buf(),
                mode: WorkspaceMode::Repo,
                branch: Some(branch),
                baseline,
            });
        }
        // Directory exists but is not a worktree; clear it out.
        if let Err(e) = std::fs::remove_dir_all(workspace_path) {
            warn!(path = %workspace_path.display(), error = %e, "could not remove non-worktree directory, continuing");
        }
    }

    if let Some(parent) = workspace_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    // Stale registrations from removed directories break worktree add.
    let _ = run_git(repo_root, &["worktree", "prune"]);

    let branch_exists = run_git(
        repo_root,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
    .map(|out| out.status.success())
    .unwrap_or(false);

    let workspace_str = workspace_path.to_string_lossy();
    let output = if branch_exists {
        info!(branch = %branch, "attaching worktree to existing branch");
        run_git(repo_root, &["worktree", "add", &workspace_str, &branch])?
    } else {
        info!(branch = %branch, "creating worktree with new branch");
        run_git(
            repo_root,
            &["worktree", "add", "-b", &branch, &workspace_str, "HEAD"],
        )?
    };

    if !output.status.success() {
        return Err(WorkspaceError::GitExit {
            command: "worktree add".into(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    if !workspace_path.join(".git").exists() {
        return Err(WorkspaceError::MissingMarker(workspace_path.to_path_buf()));
    }

    let baseline = head_commit(workspace_path).ok();
    info!(path = %workspace_path.display(), branch = %branch, "worktree ready");

    Ok(Workspace {
        path: workspace_path.to_path_buf(),
        mode: WorkspaceMode::Repo,
        branch: Some(branch),
        baseline,
    })
}

/// Pre-flight isolation checks. Violations are fatal in debug mode and
/// warnings otherwise.
pub fn preflight_checks(workspace: &Workspace, debug_mode: bool) -> anyhow::Result<()> {
    let mut problems: Vec<String> = Vec::new();

    let resolved = workspace
        .path
        .canonicalize()
        .unwrap_or_else(|_| workspace.path.clone());
    match std::env::current_dir() {
        Ok(cwd) => {
            let cwd = cwd.canonicalize().unwrap_or(cwd);
            if cwd != resolved {
                problems.push(format!(
                    "process cwd {} does not match workspace {}",
                    cwd.display(),
                    resolved.display()
                ));
            }
        }
        Err(e) => problems.push(format!("cannot determine process cwd: {e}")),
    }

    if workspace.mode == WorkspaceMode::Repo {
        let ok = run_git(&workspace.path, &["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !ok {
            problems.push(format!(
                "git does not recognize a repository at {}",
                workspace.path.display()
            ));
        }
    }

    if problems.is_empty() {
        return Ok(());
    }
    if debug_mode {
        anyhow::bail!("workspace isolation check failed: {}", problems.join("; "));
    }
    for problem in &problems {
        warn!(%problem, "workspace isolation check");
    }
    Ok(())
}

/// Detect files created or modified during a run.
///
/// Repo mode: committed changes since the baseline plus untracked files.
/// Fresh mode: everything under the workspace counts as created. Git
/// failures degrade to warnings with partial results.
pub fn detect_file_changes(workspace: &Workspace) -> FileChanges {
    match workspace.mode {
        WorkspaceMode::Repo => {
            let mut changes = FileChanges::default();

            let diff_target = match &workspace.baseline {
                Some(baseline) => format!("{baseline}..HEAD"),
                None => "HEAD".to_owned(),
            };
            match run_git(&workspace.path, &["diff", "--name-only", &diff_target]) {
                Ok(out) if out.status.success() => {
                    changes.modified = lines(&out.stdout);
                }
                Ok(out) => {
                    warn!(
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "git diff failed during change detection"
                    );
                }
                Err(e) => warn!(error = %e, "git diff failed during change detection"),
            }

            match run_git(
                &workspace.path,
                &["ls-files", "--others", "--exclude-standard"],
            ) {
                Ok(out) if out.status.success() => {
                    changes.created = lines(&out.stdout);
                }
                Ok(out) => {
                    warn!(
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "git ls-files failed during change detection"
                    );
                }
                Err(e) => warn!(error = %e, "git ls-files failed during change detection"),
            }

            changes
        }
        WorkspaceMode::Fresh => {
            let mut created = Vec::new();
            collect_files(&workspace.path, &workspace.path, &mut created);
            created.sort();
            FileChanges {
                created,
                modified: Vec::new(),
            }
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}

fn head_commit(workspace: &Path) -> Result<String, WorkspaceError> {
    let out = run_git(workspace, &["rev-parse", "HEAD"])?;
    if !out.status.success() {
        return Err(WorkspaceError::GitExit {
            command: "rev-parse HEAD".into(),
            code: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<std::process::Output, WorkspaceError> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| WorkspaceError::GitCommand {
            command: args.join(" "),
            source: e,
        })
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a temporary git repository with an initial commit.
    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init"]);
        run(&["config", "user.email", "test@apiary.dev"]);
        run(&["config", "user.name", "Apiary Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    #[test]
    fn safe_task_id_replaces_punctuation() {
        assert_eq!(safe_task_id("fix bug #7"), "fix_bug__7");
        assert_eq!(safe_task_id("task-1_ok"), "task-1_ok");
    }

    #[test]
    fn branch_name_format() {
        assert_eq!(branch_name("backend", "t 1"), "agent/backend/t_1");
    }

    #[test]
    fn fresh_apply_purges_existing_contents() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("stale.txt"), "old").unwrap();

        let workspace =
            prepare_workspace(tmp.path(), &ws, "backend", "t1", "apply", WorkspaceMode::Fresh)
                .unwrap();

        assert!(workspace.path.is_dir());
        assert!(!workspace.path.join("stale.txt").exists());
        assert_eq!(workspace.mode, WorkspaceMode::Fresh);
        assert!(workspace.baseline.is_none());
    }

    #[test]
    fn fresh_test_phase_keeps_apply_artifacts() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("built.txt"), "artifact").unwrap();

        let workspace =
            prepare_workspace(tmp.path(), &ws, "backend", "t1", "test", WorkspaceMode::Fresh)
                .unwrap();

        assert!(workspace.path.join("built.txt").exists());
    }

    #[test]
    fn fresh_change_detection_lists_all_files() {
        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(ws.join("src")).unwrap();
        std::fs::write(ws.join("a.txt"), "a").unwrap();
        std::fs::write(ws.join("src/b.rs"), "b").unwrap();

        let workspace = Workspace {
            path: ws,
            mode: WorkspaceMode::Fresh,
            branch: None,
            baseline: None,
        };
        let changes = detect_file_changes(&workspace);
        assert_eq!(changes.created, vec!["a.txt".to_string(), "src/b.rs".to_string()]);
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn worktree_creation_and_reuse() {
        let (_dir, repo) = create_temp_repo();
        let ws_base = TempDir::new().unwrap();
        let ws = ws_base.path().join("backend").join("t1");

        let first =
            prepare_workspace(&repo, &ws, "backend", "t1", "apply", WorkspaceMode::Repo).unwrap();
        assert!(first.path.join(".git").exists());
        assert_eq!(first.branch.as_deref(), Some("agent/backend/t1"));
        assert!(first.baseline.is_some());
        assert!(first.path.join("README.md").exists());

        // Re-attaching is idempotent.
        let second =
            prepare_workspace(&repo, &ws, "backend", "t1", "test", WorkspaceMode::Repo).unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(second.branch, first.branch);
    }

    #[test]
    fn worktree_change_detection_sees_commits_and_untracked() {
        let (_dir, repo) = create_temp_repo();
        let ws_base = TempDir::new().unwrap();
        let ws = ws_base.path().join("backend").join("t2");

        let workspace =
            prepare_workspace(&repo, &ws, "backend", "t2", "apply", WorkspaceMode::Repo).unwrap();

        // One committed change, one untracked file.
        std::fs::write(workspace.path.join("feature.rs"), "fn f() {}\n").unwrap();
        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&workspace.path)
                .output()
                .unwrap();
            assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        };
        run(&["add", "feature.rs"]);
        run(&["commit", "-m", "add feature"]);
        std::fs::write(workspace.path.join("notes.txt"), "scratch\n").unwrap();

        let changes = detect_file_changes(&workspace);
        assert_eq!(changes.modified, vec!["feature.rs".to_string()]);
        assert_eq!(changes.created, vec!["notes.txt".to_string()]);
    }

    #[test]
    fn worktree_in_plain_directory_replaces_it() {
        let (_dir, repo) = create_temp_repo();
        let ws_base = TempDir::new().unwrap();
        let ws = ws_base.path().join("backend").join("t3");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("junk.txt"), "junk").unwrap();

        let workspace =
            prepare_workspace(&repo, &ws, "backend", "t3", "apply", WorkspaceMode::Repo).unwrap();
        assert!(workspace.path.join(".git").exists());
        assert!(!workspace.path.join("junk.txt").exists());
    }

    #[test]
    fn mode_parse_roundtrip() {
        assert_eq!("fresh".parse::<WorkspaceMode>().unwrap(), WorkspaceMode::Fresh);
        assert_eq!("repo".parse::<WorkspaceMode>().unwrap(), WorkspaceMode::Repo);
        assert!("container".parse::<WorkspaceMode>().is_err());
        assert_eq!(WorkspaceMode::Repo.to_string(), "repo");
    }

    #[test]
    fn preflight_warns_but_passes_outside_debug_mode() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace {
            path: tmp.path().join("elsewhere"),
            mode: WorkspaceMode::Fresh,
            branch: None,
            baseline: None,
        };
        // cwd is not the workspace: warning only.
        preflight_checks(&workspace, false).unwrap();
        // In debug mode the same violation is fatal.
        assert!(preflight_checks(&workspace, true).is_err());
    }
}
