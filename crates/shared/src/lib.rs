// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the CRM billing services
//!
//! Database pool creation, embedded migrations and tracing setup used by
//! both the API server and the worker.

pub mod db;
pub mod telemetry;

use thiserror::Error;

pub use db::{create_pool, create_pool_with, run_migrations, DEFAULT_MAX_CONNECTIONS};
pub use telemetry::{init_tracing, DEFAULT_LOG_FILTER};

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("tracing initialisation failed: {0}")]
    Tracing(String),
}
