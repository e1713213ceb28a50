//! Payment gateway abstraction
//!
//! The reconciliation engine, proration calculator and backfill sync depend
//! only on [`PaymentGateway`]. Each processor gets one implementation;
//! [`stripe::StripeGateway`] is the production one.

pub mod event;
pub mod retry;
pub mod signature;
pub mod stripe;
pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::BillingResult;

pub use event::{EventObject, EventType, GatewayEvent};
pub use types::{
    GatewayCharge, GatewayCheckoutSession, GatewayCoupon, GatewayCustomer, GatewayInvoice,
    GatewayLineItem, GatewayObject, GatewayPaymentIntent, GatewayPaymentMethod,
    GatewayPortalSession, GatewayPrice, GatewayRefund, GatewaySubscription, Page,
};

/// Client-supplied token that makes a create call safe to retry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key supplied by an upstream caller
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random key for a one-off operation
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Stable key for a logical operation. Retrying the same operation
    /// with the same parts reuses the key.
    pub fn derived(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Immediately,
    AtPeriodEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProrationBehavior {
    #[default]
    CreateProrations,
    AlwaysInvoice,
    None,
}

impl ProrationBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::AlwaysInvoice => "always_invoice",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateCustomerParams {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCustomerParams {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckoutSessionParams {
    pub customer: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Internal customer id, echoed back on `checkout.session.completed`
    pub client_reference_id: Option<String>,
    pub trial_days: Option<u32>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PortalSessionParams {
    pub customer: String,
    pub return_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSubscriptionParams {
    pub customer: String,
    pub price_id: String,
    pub trial_days: Option<u32>,
    pub default_payment_method: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Swap the price on one subscription item
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionParams {
    pub item_id: String,
    pub price_id: String,
    pub proration_behavior: ProrationBehavior,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentIntentParams {
    pub customer: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RefundParams {
    pub payment_intent: Option<String>,
    pub charge: Option<String>,
    /// Partial amount; full refund when unset
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CouponParams {
    pub name: Option<String>,
    pub percent_off: Option<f64>,
    pub amount_off: Option<i64>,
    pub currency: Option<String>,
    /// `once`, `repeating` or `forever`
    pub duration: String,
    pub duration_in_months: Option<u32>,
}

/// Preview of the invoice a price swap would produce
#[derive(Debug, Clone, Default)]
pub struct InvoicePreviewParams {
    pub customer: String,
    pub subscription: String,
    pub item_id: String,
    pub new_price_id: String,
    pub proration_date: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateInvoiceParams {
    pub customer: String,
    pub subscription: Option<String>,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Cursor pagination request
#[derive(Debug, Clone)]
pub struct ListParams {
    pub limit: u32,
    pub starting_after: Option<String>,
    pub customer: Option<String>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 100,
            starting_after: None,
            customer: None,
        }
    }
}

/// Uniform verb set over a payment processor.
///
/// Create operations take an [`IdempotencyKey`]; the implementation must
/// forward it so a retried call never creates a second external object.
/// Errors are classified as `Validation`, `Declined` or `Transient`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_customer(
        &self,
        params: &CreateCustomerParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCustomer>;

    async fn update_customer(
        &self,
        customer_id: &str,
        params: &UpdateCustomerParams,
    ) -> BillingResult<GatewayCustomer>;

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()>;

    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCheckoutSession>;

    async fn create_portal_session(
        &self,
        params: &PortalSessionParams,
    ) -> BillingResult<GatewayPortalSession>;

    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<GatewaySubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        mode: CancelMode,
    ) -> BillingResult<GatewaySubscription>;

    /// Undo a scheduled at-period-end cancellation
    async fn resume_subscription(&self, subscription_id: &str)
        -> BillingResult<GatewaySubscription>;

    async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayPaymentIntent>;

    async fn refund(&self, params: &RefundParams, key: &IdempotencyKey)
        -> BillingResult<GatewayRefund>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod>;

    async fn detach_payment_method(&self, payment_method_id: &str)
        -> BillingResult<GatewayPaymentMethod>;

    async fn list_payment_methods(&self, customer_id: &str)
        -> BillingResult<Vec<GatewayPaymentMethod>>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<GatewayCustomer>;

    async fn create_coupon(
        &self,
        params: &CouponParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCoupon>;

    async fn preview_invoice(&self, params: &InvoicePreviewParams) -> BillingResult<GatewayInvoice>;

    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayInvoice>;

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice>;

    async fn pay_invoice(&self, invoice_id: &str, key: &IdempotencyKey)
        -> BillingResult<GatewayInvoice>;

    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()>;

    async fn list_subscriptions(&self, params: &ListParams)
        -> BillingResult<Page<GatewaySubscription>>;

    async fn list_customers(&self, params: &ListParams) -> BillingResult<Page<GatewayCustomer>>;

    async fn list_invoices(&self, params: &ListParams) -> BillingResult<Page<GatewayInvoice>>;

    async fn list_charges(&self, params: &ListParams) -> BillingResult<Page<GatewayCharge>>;

    /// Verify the signature header and parse the event. Fails closed.
    fn verify_webhook(&self, payload: &str, signature: &str) -> BillingResult<GatewayEvent>;
}
