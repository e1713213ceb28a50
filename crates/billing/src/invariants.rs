//! Billing invariants
//!
//! Read-only consistency checks over the local billing tables. The worker
//! runs them on a schedule; violations point at rows a backfill or a manual
//! replay should repair.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customers, users or events affected
    pub subjects: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customer may be billed twice or hold two plans
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn has_critical(&self) -> bool {
        self.violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Critical)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    billing_customer_id: String,
    sub_count: i64,
    subscription_ids: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLicensesRow {
    user_id: String,
    license_count: i64,
    plan_ids: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    id: Uuid,
    external_subscription_id: String,
    billing_customer_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RepeatedFailureRow {
    external_event_id: String,
    event_type: String,
    attempts: i32,
    last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnderpaidInvoiceRow {
    invoice_number: String,
    billing_customer_id: String,
    amount_due: i64,
    amount_paid: i64,
}

/// Events that failed at least this many times are reported
pub const FAILED_ATTEMPTS_THRESHOLD: i32 = 3;

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_single_active_license().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);
        violations.extend(self.check_repeated_webhook_failures().await?);
        violations.extend(self.check_paid_invoices_settled().await?);

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    /// At most one active or trialing subscription per customer
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT billing_customer_id,
                   COUNT(*) AS sub_count,
                   ARRAY_AGG(external_subscription_id ORDER BY external_created_at) AS subscription_ids
            FROM billing_subscriptions
            WHERE status IN ('ACTIVE', 'TRIALING')
            GROUP BY billing_customer_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                subjects: vec![row.billing_customer_id],
                description: format!(
                    "Customer has {} active subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscriptions": row.subscription_ids }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one ACTIVE license per user
    async fn check_single_active_license(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLicensesRow> = sqlx::query_as(
            r#"
            SELECT user_id,
                   COUNT(*) AS license_count,
                   ARRAY_AGG(plan_id ORDER BY plan_id) AS plan_ids
            FROM user_licenses
            WHERE status = 'ACTIVE'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_license".to_string(),
                subjects: vec![row.user_id],
                description: format!("User holds {} active licenses", row.license_count),
                context: serde_json::json!({ "plans": row.plan_ids }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_canceled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id, external_subscription_id, billing_customer_id
            FROM billing_subscriptions
            WHERE status = 'CANCELED' AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                subjects: vec![row.billing_customer_id],
                description: format!(
                    "Subscription {} is canceled without canceled_at",
                    row.external_subscription_id
                ),
                context: serde_json::json!({ "subscription_id": row.id }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Events the gateway keeps redelivering without success
    async fn check_repeated_webhook_failures(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RepeatedFailureRow> = sqlx::query_as(
            r#"
            SELECT external_event_id, event_type, attempts, last_error
            FROM billing_webhook_events
            WHERE processed = FALSE AND attempts >= $1
            ORDER BY received_at
            "#,
        )
        .bind(FAILED_ATTEMPTS_THRESHOLD)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "webhook_failures".to_string(),
                subjects: vec![row.external_event_id],
                description: format!(
                    "{} event failed {} times",
                    row.event_type, row.attempts
                ),
                context: serde_json::json!({ "last_error": row.last_error }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_paid_invoices_settled(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnderpaidInvoiceRow> = sqlx::query_as(
            r#"
            SELECT invoice_number, billing_customer_id, amount_due, amount_paid
            FROM billing_invoices
            WHERE status = 'PAID' AND amount_paid < amount_due
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoices_settled".to_string(),
                subjects: vec![row.billing_customer_id],
                description: format!(
                    "Invoice {} is PAID but only {} of {} was paid",
                    row.invoice_number, row.amount_paid, row.amount_due
                ),
                context: serde_json::json!({
                    "amount_due": row.amount_due,
                    "amount_paid": row.amount_paid,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "single_active_license" => self.check_single_active_license().await,
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            "webhook_failures" => self.check_repeated_webhook_failures().await,
            "paid_invoices_settled" => self.check_paid_invoices_settled().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "single_active_license",
            "canceled_has_timestamp",
            "webhook_failures",
            "paid_invoices_settled",
        ]
    }
}
