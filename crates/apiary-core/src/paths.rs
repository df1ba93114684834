//! Filesystem layout for a project root: state database, per-run results
//! and logs, and worker workspaces.

use std::io;
use std::path::{Path, PathBuf};

/// Derived paths under one project root.
///
/// ```text
/// <root>/apiary.toml              operator config
/// <root>/.apiary/apiary.db        state database
/// <root>/.apiary/results/<task>/  per-run result JSON files
/// <root>/logs/<task>/             per-run agent logs
/// <root>/.workspaces/<role>/      worker workspaces (scratch or worktree)
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the project root: CLI flag > `APIARY_ROOT` env > cwd.
    pub fn discover(cli_root: Option<&Path>) -> Self {
        if let Some(root) = cli_root {
            return Self::new(root);
        }
        if let Ok(root) = std::env::var("APIARY_ROOT") {
            return Self::new(root);
        }
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("apiary.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".apiary")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("apiary.db")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.state_dir().join("results")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join(".workspaces")
    }

    pub fn task_results_dir(&self, task_id: &str) -> PathBuf {
        self.results_dir().join(slugify(task_id))
    }

    pub fn result_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.task_results_dir(task_id).join(format!("{run_id}.json"))
    }

    pub fn task_log_dir(&self, task_id: &str) -> PathBuf {
        self.logs_dir().join(slugify(task_id))
    }

    pub fn log_path(&self, task_id: &str, run_id: &str) -> PathBuf {
        self.task_log_dir(task_id).join(format!("{run_id}.log"))
    }

    /// Workspace directory for a (role, task) pair.
    pub fn workspace_dir(&self, role: &str, task_id: &str) -> PathBuf {
        self.workspaces_dir().join(role).join(slugify(task_id))
    }

    /// Create every directory the orchestrator writes into.
    pub fn ensure_directories(&self) -> io::Result<()> {
        for dir in [
            self.state_dir(),
            self.results_dir(),
            self.logs_dir(),
            self.workspaces_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Convert free-form text into a filesystem-safe slug.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
