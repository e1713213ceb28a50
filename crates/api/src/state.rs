//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use crm_billing::{BillingConfig, BillingResult, BillingService, InvariantChecker};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    /// Absent when running without a database (tests)
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(
        config: Config,
        billing: Arc<BillingService>,
        invariants: Option<Arc<InvariantChecker>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            billing,
            invariants,
        }
    }

    /// Resolve billing configuration against the database and wire the
    /// production services
    pub async fn connect(config: Config, pool: PgPool) -> BillingResult<Self> {
        let billing_config = BillingConfig::resolve(&pool).await?;
        let billing = BillingService::new(&billing_config, pool.clone())?;

        if config.admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set, billing and admin routes are disabled");
        }

        Ok(Self::new(
            config,
            Arc::new(billing),
            Some(Arc::new(InvariantChecker::new(pool))),
        ))
    }
}
