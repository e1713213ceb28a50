//! Postgres pool and migrations

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::SharedError;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool, SharedError> {
    create_pool_with(database_url, DEFAULT_MAX_CONNECTIONS).await
}

pub async fn create_pool_with(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, SharedError> {
    let pool = pool_options(max_connections).connect(database_url).await?;
    tracing::info!(max_connections = max_connections, "Database pool created");
    Ok(pool)
}

/// Apply the embedded billing migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), SharedError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
