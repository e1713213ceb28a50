//! Worker schedule configuration

use anyhow::Context;

/// Every 6 hours on the hour
pub const DEFAULT_BACKFILL_CRON: &str = "0 0 */6 * * *";
/// Every 15 minutes
pub const DEFAULT_INVARIANT_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub backfill_cron: String,
    pub invariant_cron: String,
    /// Run one full backfill before the first scheduled tick
    pub backfill_on_start: bool,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let backfill_on_start = std::env::var("BACKFILL_ON_START")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            backfill_cron: var_or("BACKFILL_CRON", DEFAULT_BACKFILL_CRON),
            invariant_cron: var_or("INVARIANT_CRON", DEFAULT_INVARIANT_CRON),
            backfill_on_start,
        })
    }
}
