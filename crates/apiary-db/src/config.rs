use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Points at a single SQLite file. Reads from the `APIARY_DB_PATH`
/// environment variable, falling back to `.apiary/apiary.db` under the
/// current directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
}

impl DbConfig {
    /// Default relative database location.
    pub const DEFAULT_PATH: &str = ".apiary/apiary.db";

    /// Default pool ceiling.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Build a config from the environment.
    ///
    /// Priority: `APIARY_DB_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let db_path = std::env::var("APIARY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self {
            db_path,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Override the pool ceiling.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Directory containing the database file, if any.
    pub fn parent_dir(&self) -> Option<&Path> {
        self.db_path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path() {
        let cfg = DbConfig::new("/tmp/test.db");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(cfg.max_connections, DbConfig::DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn parent_dir_extraction() {
        let cfg = DbConfig::new("/var/lib/apiary/apiary.db");
        assert_eq!(cfg.parent_dir(), Some(Path::new("/var/lib/apiary")));
    }

    #[test]
    fn with_max_connections_override() {
        let cfg = DbConfig::new("x.db").with_max_connections(3);
        assert_eq!(cfg.max_connections, 3);
    }
}
