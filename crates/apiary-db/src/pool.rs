use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::StoreResult;
use crate::config::DbConfig;
use crate::error::StoreError;

/// Create a connection pool over the SQLite file named in `config`.
///
/// The database is opened with WAL journaling, `synchronous=NORMAL`, a
/// memory-resident temp store, and foreign-key enforcement. Connections are
/// validated on checkout and checkout blocks for up to 30 seconds before
/// failing with [`StoreError::PoolExhausted`].
pub async fn create_pool(config: &DbConfig) -> StoreResult<SqlitePool> {
    if let Some(dir) = config.parent_dir() {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Schema(format!("cannot create {}: {e}", dir.display())))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .pragma("temp_store", "MEMORY")
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .min_connections(2)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run all pending migrations from the given directory against the pool.
///
/// Uses a runtime `Migrator` so that no database is required at compile
/// time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &Path) -> StoreResult<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .map_err(|e| {
            StoreError::Schema(format!(
                "failed to load migrations from {}: {e}",
                migrations_dir.display()
            ))
        })?;

    migrator.run(pool).await?;

    info!("migrations applied successfully");
    Ok(())
}

/// Return the row count for every user-defined table.
///
/// Useful for the `apiary init` success message.
pub async fn table_counts(pool: &SqlitePool) -> StoreResult<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut counts = Vec::with_capacity(rows.len());
    for row in &rows {
        let table_name: String = row.try_get("name").map_err(StoreError::from)?;
        // Table names come from sqlite_master so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: i64 = sqlx::query_scalar(&query).fetch_one(pool).await?;
        counts.push((table_name, count));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `apiary-db`.
///
/// At runtime this resolves relative to the `apiary-db` crate's source tree
/// via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
