//! Postgres connection pool and schema migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared Postgres pool handed to every store.
pub type DbPool = PgPool;

/// How long a caller waits for a free connection before the store call fails.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `database_url` with at most `max_connections` open connections.
///
/// Fails fast if the database is unreachable, so a misconfigured worker exits
/// at startup instead of erroring on its first job.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!(max_connections, "database pool ready");
    Ok(pool)
}

/// Apply the SQL files under the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    let migrator = sqlx::migrate!("../../migrations");
    info!(count = migrator.iter().count(), "applying migrations");
    migrator.run(pool).await?;
    Ok(())
}
