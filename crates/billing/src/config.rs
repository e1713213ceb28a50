//! Billing configuration
//!
//! Resolved once at process start and injected into the gateway and the
//! engine. Secrets stored in `billing_settings` take precedence over the
//! environment so they can be rotated without a redeploy.

use std::time::Duration;

use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::gateway::retry::RetryPolicy;
use crate::gateway::signature::DEFAULT_TOLERANCE_SECS;
use crate::plans::PlanCatalog;

/// The client appends the `/v1` API root itself
pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

const SECRET_KEY_SETTING: &str = "stripe_secret_key";
const WEBHOOK_SECRET_SETTING: &str = "stripe_webhook_secret";

#[derive(Clone)]
pub struct BillingConfig {
    pub secret_key: String,
    /// Missing is tolerated at startup; every webhook is then rejected
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub webhook_tolerance_secs: i64,
    pub retry: RetryPolicy,
    pub backfill_page_size: u32,
    pub plans: PlanCatalog,
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("secret_key_configured", &!self.secret_key.is_empty())
            .field("webhook_secret_configured", &self.webhook_secret.is_some())
            .field("api_base", &self.api_base)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("retry", &self.retry)
            .field("backfill_page_size", &self.backfill_page_size)
            .field("plans", &self.plans.plans().len())
            .finish()
    }
}

impl BillingConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: None,
            api_base: DEFAULT_API_BASE.to_string(),
            webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            retry: RetryPolicy::default(),
            backfill_page_size: DEFAULT_PAGE_SIZE,
            plans: PlanCatalog::default(),
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_plans(mut self, plans: PlanCatalog) -> Self {
        self.plans = plans;
        self
    }

    /// Read configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = env_string("STRIPE_SECRET_KEY").unwrap_or_default();
        let webhook_secret = env_string("STRIPE_WEBHOOK_SECRET");

        let plans = match env_string("BILLING_PLANS") {
            Some(json) => PlanCatalog::from_json(&json)?,
            None => PlanCatalog::default(),
        };

        let max_retries = env_parse("GATEWAY_MAX_RETRIES", 3usize)?;
        let base_ms = env_parse("GATEWAY_RETRY_BASE_MS", 200u64)?;

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base: env_string("STRIPE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            webhook_tolerance_secs: env_parse("WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS)?,
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(base_ms),
                ..RetryPolicy::default()
            },
            backfill_page_size: env_parse("BACKFILL_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            plans,
        })
    }

    /// One-shot resolution: environment first, then database overrides.
    /// Fails if no secret key is available from either source.
    pub async fn resolve(pool: &PgPool) -> BillingResult<Self> {
        let mut config = Self::from_env()?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT key, value
            FROM billing_settings
            WHERE key = ANY($1)
            "#,
        )
        .bind(vec![SECRET_KEY_SETTING, WEBHOOK_SECRET_SETTING])
        .fetch_all(pool)
        .await?;

        config.apply_overrides(rows);
        config.validate()?;

        tracing::info!(
            webhook_secret_configured = config.webhook_secret.is_some(),
            plans = config.plans.plans().len(),
            "Billing configuration resolved"
        );

        Ok(config)
    }

    fn apply_overrides(&mut self, rows: Vec<(String, String)>) {
        for (key, value) in rows {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                SECRET_KEY_SETTING => self.secret_key = value,
                WEBHOOK_SECRET_SETTING => self.webhook_secret = Some(value),
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.secret_key.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY is not set and billing_settings has no override".to_string(),
            ));
        }
        if self.webhook_secret.is_none() {
            tracing::warn!("Webhook secret is not configured, all webhooks will be rejected");
        }
        if self.backfill_page_size == 0 || self.backfill_page_size > 100 {
            return Err(BillingError::Config(format!(
                "BACKFILL_PAGE_SIZE must be between 1 and 100, got {}",
                self.backfill_page_size
            )));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}
