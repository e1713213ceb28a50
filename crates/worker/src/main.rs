// Worker clippy configuration
#![allow(clippy::result_large_err)]
// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CRM Billing Background Worker
//!
//! Handles scheduled jobs:
//! - Drift-repair backfill from the payment gateway (every 6 hours by default)
//! - Billing invariant checks (every 15 minutes by default)
//! - Heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;

use crm_billing::{BillingConfig, BillingService, InvariantChecker};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::WorkerConfig;

const LOG_FILTER: &str = "info,crm_worker=debug,crm_billing=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    crm_shared::init_tracing(LOG_FILTER)?;

    info!("Starting CRM Billing Worker");

    let config = WorkerConfig::from_env()?;
    info!(
        backfill_cron = %config.backfill_cron,
        invariant_cron = %config.invariant_cron,
        backfill_on_start = config.backfill_on_start,
        "Worker configuration loaded"
    );

    let pool = crm_shared::create_pool(&config.database_url).await?;
    info!("Database pool created");

    let billing_config = BillingConfig::resolve(&pool).await?;
    let billing = Arc::new(BillingService::new(&billing_config, pool.clone())?);
    let checker = Arc::new(InvariantChecker::new(pool));

    if config.backfill_on_start {
        info!("Running startup backfill");
        jobs::run_backfill(&billing.sync).await;
    }

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Backfill from the gateway to repair drift from missed webhooks
    let backfill_service = billing.clone();
    scheduler
        .add(Job::new_async(
            config.backfill_cron.as_str(),
            move |_uuid, _l| {
                let service = backfill_service.clone();
                Box::pin(async move {
                    jobs::run_backfill(&service.sync).await;
                })
            },
        )?)
        .await?;
    info!(cron = %config.backfill_cron, "Scheduled: Billing backfill");

    // Job 2: Consistency checks over the local billing tables
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_cron.as_str(),
            move |_uuid, _l| {
                let checker = invariant_checker.clone();
                Box::pin(async move {
                    jobs::run_invariant_checks(&checker).await;
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Billing invariant checks");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker started, waiting for jobs...");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down worker");
    scheduler.shutdown().await?;
    Ok(())
}
