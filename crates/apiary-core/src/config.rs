//! Orchestrator configuration.
//!
//! Loaded from an optional `apiary.toml` at the project root; every field
//! has a default so a missing or partial file still yields a working
//! configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency cap per worker role.
    pub max_parallel_per_role: BTreeMap<String, usize>,
    /// Global retry ceiling used when a task carries no usable limit.
    pub task_retry_limit: i64,
    /// Scheduling tick interval.
    pub status_refresh_seconds: u64,
    /// Age after which an unsupervised in-progress task is recovered.
    pub zombie_detection_minutes: u64,
    /// Hard wall-clock limit for one agent invocation.
    pub worker_timeout_secs: u64,
    /// Grace period between terminate and kill.
    pub graceful_kill_secs: u64,
    /// Explicit path to the agent CLI binary.
    pub agent_binary: Option<PathBuf>,
    /// Fail (rather than warn) on pre-flight isolation check violations.
    pub debug_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut max_parallel_per_role = BTreeMap::new();
        max_parallel_per_role.insert("backend".to_owned(), 2);
        max_parallel_per_role.insert("frontend".to_owned(), 2);
        max_parallel_per_role.insert("infra".to_owned(), 1);
        Self {
            max_parallel_per_role,
            task_retry_limit: 2,
            status_refresh_seconds: 10,
            zombie_detection_minutes: 5,
            worker_timeout_secs: 600,
            graceful_kill_secs: 30,
            agent_binary: None,
            debug_mode: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        Ok(config)
    }

    /// Total concurrency across all roles.
    pub fn total_parallel_slots(&self) -> usize {
        self.max_parallel_per_role.values().sum()
    }

    /// Cap for one role; roles absent from the table get 1 slot.
    pub fn role_cap(&self, role: &str) -> usize {
        self.max_parallel_per_role.get(role).copied().unwrap_or(1)
    }

    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status_refresh_seconds)
    }

    pub fn zombie_detection(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.zombie_detection_minutes as i64)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn graceful_kill(&self) -> Duration {
        Duration::from_secs(self.graceful_kill_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.role_cap("backend"), 2);
        assert_eq!(cfg.role_cap("frontend"), 2);
        assert_eq!(cfg.role_cap("infra"), 1);
        assert_eq!(cfg.role_cap("unknown"), 1);
        assert_eq!(cfg.total_parallel_slots(), 5);
        assert_eq!(cfg.task_retry_limit, 2);
        assert_eq!(cfg.status_refresh_seconds, 10);
        assert_eq!(cfg.zombie_detection_minutes, 5);
        assert_eq!(cfg.worker_timeout_secs, 600);
        assert!(!cfg.debug_mode);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("apiary.toml");
        std::fs::write(
            &path,
            "status_refresh_seconds = 1\n\
             [max_parallel_per_role]\n\
             backend = 4\n",
        )
        .unwrap();

        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.status_refresh_seconds, 1);
        assert_eq!(cfg.role_cap("backend"), 4);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.task_retry_limit, 2);
        // A partial role table replaces the default table entirely.
        assert_eq!(cfg.role_cap("frontend"), 1);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = OrchestratorConfig::load(Path::new("/nonexistent/apiary.toml")).unwrap();
        assert_eq!(cfg.status_refresh_seconds, 10);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("apiary.toml");
        std::fs::write(&path, "not toml [[[").unwrap();
        assert!(OrchestratorConfig::load(&path).is_err());
    }
}
