//! Local billing records
//!
//! These rows mirror gateway state. They are written only by the
//! reconciliation engine (webhooks and backfill share the same upserts) and
//! are retired by status rather than deleted, so invoices and payments keep
//! their references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Subscription state as the product sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    /// Translate a gateway status string.
    ///
    /// Unrecognised values map to `Active`: losing a paying customer's
    /// entitlement because the gateway grew a new status is worse than
    /// briefly over-granting.
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" | "unpaid" | "incomplete" => Self::PastDue,
            "paused" => Self::Paused,
            "canceled" | "incomplete_expired" => Self::Canceled,
            other => {
                tracing::warn!(
                    gateway_status = %other,
                    "Unrecognised subscription status, treating as active"
                );
                Self::Active
            }
        }
    }

    /// Active or trialing. At most one per customer.
    pub fn is_active_like(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "TRIALING",
            Self::Active => "ACTIVE",
            Self::PastDue => "PAST_DUE",
            Self::Paused => "PAUSED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIALING" => Ok(Self::Trialing),
            "ACTIVE" => Ok(Self::Active),
            "PAST_DUE" => Ok(Self::PastDue),
            "PAUSED" => Ok(Self::Paused),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(BillingError::Internal(format!(
                "unknown subscription status in storage: {other}"
            ))),
        }
    }
}

/// Recurring interval of a subscription's price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingCycle {
    /// Map a gateway `(interval, interval_count)` pair
    pub fn from_interval(interval: &str, count: u32) -> Self {
        match (interval, count) {
            ("day", _) => Self::Daily,
            ("week", _) => Self::Weekly,
            ("month", 3) => Self::Quarterly,
            ("month", 12) | ("year", _) => Self::Yearly,
            _ => Self::Monthly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            other => Err(BillingError::Internal(format!(
                "unknown billing cycle in storage: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn from_gateway(status: Option<&str>) -> Self {
        match status {
            Some("paid") => Self::Paid,
            Some("open") => Self::Open,
            Some("void") => Self::Void,
            Some("uncollectible") => Self::Uncollectible,
            _ => Self::Draft,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Void)
    }

    /// Combine the stored status with an incoming one. Terminal statuses
    /// survive late, non-terminal events.
    pub fn merge(current: Self, incoming: Self) -> Self {
        if current.is_terminal() && !incoming.is_terminal() {
            current
        } else {
            incoming
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Open => "OPEN",
            Self::Paid => "PAID",
            Self::Void => "VOID",
            Self::Uncollectible => "UNCOLLECTIBLE",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "OPEN" => Ok(Self::Open),
            "PAID" => Ok(Self::Paid),
            "VOID" => Ok(Self::Void),
            "UNCOLLECTIBLE" => Ok(Self::Uncollectible),
            other => Err(BillingError::Internal(format!(
                "unknown invoice status in storage: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Refunds are final, and a success is not undone by a late failure
    pub fn merge(current: Self, incoming: Self) -> Self {
        match (current, incoming) {
            (Self::Refunded, _) => Self::Refunded,
            (Self::Succeeded, Self::Failed | Self::Pending) => Self::Succeeded,
            (_, incoming) => incoming,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(BillingError::Internal(format!(
                "unknown payment status in storage: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LicenseStatus {
    Active,
    Cancelled,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(BillingError::Internal(format!(
                "unknown license status in storage: {other}"
            ))),
        }
    }
}

/// Local customer, keyed by the CRM's customer id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingCustomer {
    pub id: String,
    pub user_id: String,
    /// Null until the first successful link with the gateway
    pub external_customer_id: Option<String>,
    pub email: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub external_subscription_id: String,
    pub billing_customer_id: String,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub plan_id: Option<String>,
    pub price_id: Option<String>,
    pub unit_amount: i64,
    pub currency: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    /// Creation time at the gateway, used to pick the survivor among duplicates
    pub external_created_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// True when the two rows describe the same gateway state.
    /// Bookkeeping columns are ignored.
    pub fn same_state(&self, other: &Subscription) -> bool {
        self.external_subscription_id == other.external_subscription_id
            && self.billing_customer_id == other.billing_customer_id
            && self.status == other.status
            && self.billing_cycle == other.billing_cycle
            && self.plan_id == other.plan_id
            && self.price_id == other.price_id
            && self.unit_amount == other.unit_amount
            && self.currency == other.currency
            && self.current_period_start == other.current_period_start
            && self.current_period_end == other.current_period_end
            && self.cancel_at_period_end == other.cancel_at_period_end
            && self.canceled_at == other.canceled_at
            && self.cancellation_reason == other.cancellation_reason
            && self.external_created_at == other.external_created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub external_invoice_id: String,
    pub billing_customer_id: String,
    pub subscription_id: Option<Uuid>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub total: i64,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf_url: Option<String>,
    pub due_at: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Invoice {
    pub fn same_state(&self, other: &Invoice) -> bool {
        self.invoice_number == other.invoice_number
            && self.external_invoice_id == other.external_invoice_id
            && self.billing_customer_id == other.billing_customer_id
            && self.subscription_id == other.subscription_id
            && self.status == other.status
            && self.currency == other.currency
            && self.amount_due == other.amount_due
            && self.amount_paid == other.amount_paid
            && self.total == other.total
            && self.hosted_invoice_url == other.hosted_invoice_url
            && self.invoice_pdf_url == other.invoice_pdf_url
            && self.due_at == other.due_at
            && self.paid_at == other.paid_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub external_line_id: String,
    /// Order within the invoice, as delivered by the gateway
    pub position: i32,
    pub description: String,
    pub quantity: i64,
    pub unit_amount: i64,
    pub amount: i64,
    pub currency: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub proration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    /// Payment intent id, or the charge id for charges without one
    pub external_payment_id: String,
    pub billing_customer_id: String,
    pub invoice_id: Option<Uuid>,
    pub status: PaymentStatus,
    pub amount: i64,
    pub currency: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub refunded_amount: i64,
    pub refunded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn same_state(&self, other: &Payment) -> bool {
        self.external_payment_id == other.external_payment_id
            && self.billing_customer_id == other.billing_customer_id
            && self.invoice_id == other.invoice_id
            && self.status == other.status
            && self.amount == other.amount
            && self.currency == other.currency
            && self.failure_code == other.failure_code
            && self.failure_message == other.failure_message
            && self.refunded_amount == other.refunded_amount
            && self.refunded_at == other.refunded_at
    }
}

/// Stored webhook notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub payload: String,
    pub processed: bool,
    pub processed_at: Option<OffsetDateTime>,
    /// Set while a worker holds the processing claim
    pub processing_started_at: Option<OffsetDateTime>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: OffsetDateTime,
}

/// Entitlement row owned by the CRM, written through the license sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserLicense {
    pub user_id: String,
    pub plan_id: String,
    pub status: LicenseStatus,
    pub expires_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}
