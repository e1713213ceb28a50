//! Persistence seams
//!
//! [`BillingStore`] owns the local mirror of gateway state and the webhook
//! event log. [`LicenseSink`] and [`CustomerDirectory`] are the two narrow
//! interfaces into the rest of the CRM.

pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BillingCustomer, Invoice, InvoiceLineItem, Payment, Subscription, WebhookEventRecord,
};

pub use postgres::PgBillingStore;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBillingStore;

/// Local billing tables.
///
/// Upserts are keyed by external id: an existing row keeps its local id,
/// creation time and (for invoices) its invoice number.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Customers

    async fn insert_customer(&self, customer: &BillingCustomer) -> BillingResult<()>;

    async fn find_customer(&self, id: &str) -> BillingResult<Option<BillingCustomer>>;

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>>;

    /// Set the external id. Fails with `Validation` if another customer
    /// already owns it.
    async fn link_external_customer(
        &self,
        customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()>;

    // Subscriptions

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Subscriptions of a customer in an active-like status
    async fn list_active_subscriptions(&self, customer_id: &str)
        -> BillingResult<Vec<Subscription>>;

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    async fn mark_subscription_canceled(
        &self,
        id: Uuid,
        reason: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()>;

    // Invoices

    async fn find_invoice_by_external_id(
        &self,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>>;

    async fn upsert_invoice(&self, invoice: &Invoice) -> BillingResult<Invoice>;

    async fn replace_line_items(
        &self,
        invoice_id: Uuid,
        items: &[InvoiceLineItem],
    ) -> BillingResult<()>;

    async fn list_line_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceLineItem>>;

    /// Most recently created OPEN invoice of a customer
    async fn latest_open_invoice(&self, customer_id: &str) -> BillingResult<Option<Invoice>>;

    /// Next local invoice number, e.g. `INV-000042`
    async fn next_invoice_number(&self) -> BillingResult<String>;

    // Payments

    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Payment>>;

    async fn upsert_payment(&self, payment: &Payment) -> BillingResult<Payment>;

    // Webhook events

    async fn find_webhook_event(
        &self,
        external_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>>;

    /// Insert the raw event, or refresh the payload of an unprocessed one
    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<WebhookEventRecord>;

    /// Take the processing claim on an unprocessed event. A claim older
    /// than `stale_after` counts as abandoned. Returns false when the event
    /// is already processed or another worker holds a live claim.
    async fn claim_webhook_event(
        &self,
        external_event_id: &str,
        stale_after: Duration,
    ) -> BillingResult<bool>;

    /// Set the processed flag and release the claim
    async fn mark_webhook_processed(&self, external_event_id: &str) -> BillingResult<()>;

    /// Increment attempts, store the error and release the claim
    async fn record_webhook_failure(
        &self,
        external_event_id: &str,
        error: &str,
    ) -> BillingResult<()>;

    /// Unprocessed events that have failed at least once, oldest first
    async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}

/// Entitlement subsystem of the CRM
#[async_trait]
pub trait LicenseSink: Send + Sync {
    /// Idempotent: activating an already active license only refreshes the expiry
    async fn activate_license(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    async fn deactivate_license(&self, user_id: &str, plan_id: &str) -> BillingResult<()>;

    /// Activate `plan_id` and cancel every other active license of the user
    /// as one unit. Returns the plans that were cancelled.
    async fn activate_exclusive(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<String>>;

    /// Plans the user currently holds an ACTIVE license for
    async fn active_plans(&self, user_id: &str) -> BillingResult<Vec<String>>;
}

/// Lookup of CRM customers by gateway customer id
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn resolve_internal_customer_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<String>>;

    async fn link_external_customer_id(
        &self,
        internal_customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()>;
}
