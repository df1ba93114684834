//! Shared test utilities for apiary integration tests.
//!
//! Each test gets its own SQLite database file inside a temp directory with
//! migrations applied. The backend is an embedded file database, so there is
//! no shared server to manage; dropping the returned [`TestDb`] removes the
//! directory and everything in it.

use sqlx::SqlitePool;
use tempfile::TempDir;

use apiary_db::config::DbConfig;
use apiary_db::pool;

/// A migrated scratch database. Keep the value alive for the duration of
/// the test; the temp directory is deleted on drop.
pub struct TestDb {
    pub pool: SqlitePool,
    dir: TempDir,
}

impl TestDb {
    /// Path to the temp directory backing this database. Handy when a test
    /// also needs scratch space for workspaces or result files.
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("apiary.db")).with_max_connections(5);

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb { pool, dir }
}
