//! Test doubles
//!
//! [`MockGateway`] records every call and serves canned objects. Combined
//! with [`crate::store::MemoryBillingStore`] it runs the whole engine
//! without a database or network.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::signature;
use crate::gateway::types::{GatewayPrice, GatewayRecurring, GatewaySubscriptionItem};
use crate::gateway::{
    CancelMode, CheckoutSessionParams, CouponParams, CreateCustomerParams, CreateInvoiceParams,
    CreateSubscriptionParams, GatewayCharge, GatewayCheckoutSession, GatewayCoupon,
    GatewayCustomer, GatewayEvent, GatewayInvoice, GatewayObject, GatewayPaymentIntent,
    GatewayPaymentMethod, GatewayPortalSession, GatewayRefund, GatewaySubscription,
    IdempotencyKey, InvoicePreviewParams, ListParams, Page, PaymentGateway, PaymentIntentParams,
    PortalSessionParams, RefundParams, UpdateCustomerParams, UpdateSubscriptionParams,
};
use crate::plans::{CUSTOMER_ID_KEY, LICENSE_TYPE_KEY};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub method: &'static str,
    pub target: String,
    pub idempotency_key: Option<String>,
    pub detail: Option<String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<GatewayCall>,
    subscriptions: Vec<GatewaySubscription>,
    customers: Vec<GatewayCustomer>,
    invoices: Vec<GatewayInvoice>,
    charges: Vec<GatewayCharge>,
    prices: HashMap<String, GatewayPrice>,
    preview: Option<GatewayInvoice>,
    next_invoice: Option<GatewayInvoice>,
    decline: Option<(Option<String>, String)>,
    failing: HashSet<&'static str>,
    counter: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_mock_{}", self.counter)
    }
}

/// Recording [`PaymentGateway`]
pub struct MockGateway {
    state: Mutex<MockState>,
    webhook_secret: Option<String>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
        }
    }

    /// Gateway with no webhook secret; every verification fails
    pub fn without_webhook_secret() -> Self {
        Self {
            webhook_secret: None,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(
        &self,
        method: &'static str,
        target: impl Into<String>,
        key: Option<&IdempotencyKey>,
        detail: Option<String>,
    ) -> BillingResult<()> {
        let mut state = self.state();
        state.calls.push(GatewayCall {
            method,
            target: target.into(),
            idempotency_key: key.map(|k| k.as_str().to_string()),
            detail,
        });
        if state.failing.contains(method) {
            return Err(BillingError::Transient(format!("{method} unavailable")));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<GatewayCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn add_subscription(&self, subscription: GatewaySubscription) {
        let mut state = self.state();
        state.subscriptions.retain(|s| s.id != subscription.id);
        state.subscriptions.push(subscription);
    }

    pub fn add_customer(&self, customer: GatewayCustomer) {
        self.state().customers.push(customer);
    }

    pub fn add_invoice(&self, invoice: GatewayInvoice) {
        self.state().invoices.push(invoice);
    }

    pub fn add_charge(&self, charge: GatewayCharge) {
        self.state().charges.push(charge);
    }

    pub fn add_price(&self, price: GatewayPrice) {
        self.state().prices.insert(price.id.clone(), price);
    }

    pub fn set_preview(&self, invoice: GatewayInvoice) {
        self.state().preview = Some(invoice);
    }

    /// Invoice returned by the next `create_invoice`
    pub fn set_next_invoice(&self, invoice: GatewayInvoice) {
        self.state().next_invoice = Some(invoice);
    }

    pub fn decline_payments(&self, code: &str, message: &str) {
        self.state().decline = Some((Some(code.to_string()), message.to_string()));
    }

    /// Make every call to `method` fail with a transient error
    pub fn fail(&self, method: &'static str) {
        self.state().failing.insert(method);
    }

    pub fn recover(&self, method: &'static str) {
        self.state().failing.remove(method);
    }

    pub fn subscription(&self, id: &str) -> Option<GatewaySubscription> {
        self.state().subscriptions.iter().find(|s| s.id == id).cloned()
    }

    fn find_subscription(&self, id: &str) -> BillingResult<GatewaySubscription> {
        self.subscription(id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {id}")))
    }

    fn replace_subscription(&self, subscription: &GatewaySubscription) {
        self.add_subscription(subscription.clone());
    }
}

fn paginate<T: GatewayObject + Clone>(items: &[T], params: &ListParams) -> Page<T> {
    let start = match &params.starting_after {
        Some(cursor) => items
            .iter()
            .position(|i| i.gateway_id() == cursor)
            .map(|p| p + 1)
            .unwrap_or(items.len()),
        None => 0,
    };
    let end = (start + params.limit as usize).min(items.len());
    Page {
        data: items[start..end].to_vec(),
        has_more: end < items.len(),
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_customer(
        &self,
        params: &CreateCustomerParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCustomer> {
        self.record("create_customer", "", Some(key), params.email.clone())?;
        let id = self.state().next_id("cus");
        Ok(GatewayCustomer {
            id,
            email: params.email.clone(),
            name: params.name.clone(),
            metadata: params.metadata.clone(),
            deleted: false,
        })
    }

    async fn update_customer(
        &self,
        customer_id: &str,
        params: &UpdateCustomerParams,
    ) -> BillingResult<GatewayCustomer> {
        self.record("update_customer", customer_id, None, None)?;
        Ok(GatewayCustomer {
            id: customer_id.to_string(),
            email: params.email.clone(),
            name: params.name.clone(),
            metadata: params.metadata.clone(),
            deleted: false,
        })
    }

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()> {
        self.record("delete_customer", customer_id, None, None)
    }

    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCheckoutSession> {
        self.record(
            "create_checkout_session",
            &params.customer,
            Some(key),
            Some(params.price_id.clone()),
        )?;
        let id = self.state().next_id("cs");
        Ok(GatewayCheckoutSession {
            url: Some(format!("https://checkout.test/{id}")),
            id,
            customer: Some(params.customer.clone()),
            subscription: None,
            client_reference_id: params.client_reference_id.clone(),
            metadata: params.metadata.clone(),
        })
    }

    async fn create_portal_session(
        &self,
        params: &PortalSessionParams,
    ) -> BillingResult<GatewayPortalSession> {
        self.record("create_portal_session", &params.customer, None, None)?;
        let id = self.state().next_id("bps");
        Ok(GatewayPortalSession {
            url: format!("https://portal.test/{id}"),
            id,
        })
    }

    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription> {
        self.record(
            "create_subscription",
            &params.customer,
            Some(key),
            Some(params.price_id.clone()),
        )?;
        let (id, item_id, price) = {
            let mut state = self.state();
            let price = state
                .prices
                .get(&params.price_id)
                .cloned()
                .unwrap_or_else(|| GatewayPrice {
                    id: params.price_id.clone(),
                    ..Default::default()
                });
            (state.next_id("sub"), state.next_id("si"), price)
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let subscription = GatewaySubscription {
            id,
            customer: params.customer.clone(),
            status: if params.trial_days.is_some() {
                "trialing".to_string()
            } else {
                "active".to_string()
            },
            items: Page {
                data: vec![GatewaySubscriptionItem {
                    id: item_id,
                    price,
                    quantity: Some(1),
                }],
                has_more: false,
            },
            current_period_start: now,
            current_period_end: now + 30 * 86_400,
            created: now,
            metadata: params.metadata.clone(),
            ..Default::default()
        };
        self.add_subscription(subscription.clone());
        Ok(subscription)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        self.record("retrieve_subscription", subscription_id, None, None)?;
        self.find_subscription(subscription_id)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription> {
        self.record(
            "update_subscription",
            subscription_id,
            Some(key),
            Some(format!(
                "{}:{}",
                params.price_id,
                params.proration_behavior.as_str()
            )),
        )?;
        let mut subscription = self.find_subscription(subscription_id)?;
        let price = self
            .state()
            .prices
            .get(&params.price_id)
            .cloned()
            .unwrap_or_else(|| GatewayPrice {
                id: params.price_id.clone(),
                ..Default::default()
            });
        match subscription
            .items
            .data
            .iter_mut()
            .find(|item| item.id == params.item_id)
        {
            Some(item) => item.price = price,
            None => {
                return Err(BillingError::Validation(format!(
                    "no item {} on subscription {subscription_id}",
                    params.item_id
                )))
            }
        }
        subscription.metadata.extend(params.metadata.clone());
        self.replace_subscription(&subscription);
        Ok(subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        mode: CancelMode,
    ) -> BillingResult<GatewaySubscription> {
        let detail = match mode {
            CancelMode::Immediately => "immediately",
            CancelMode::AtPeriodEnd => "at_period_end",
        };
        self.record(
            "cancel_subscription",
            subscription_id,
            None,
            Some(detail.to_string()),
        )?;
        let mut subscription = self.subscription(subscription_id).unwrap_or_else(|| {
            GatewaySubscription {
                id: subscription_id.to_string(),
                status: "active".to_string(),
                ..Default::default()
            }
        });
        match mode {
            CancelMode::Immediately => {
                subscription.status = "canceled".to_string();
                subscription.canceled_at = Some(OffsetDateTime::now_utc().unix_timestamp());
            }
            CancelMode::AtPeriodEnd => subscription.cancel_at_period_end = true,
        }
        self.replace_subscription(&subscription);
        Ok(subscription)
    }

    async fn resume_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        self.record("resume_subscription", subscription_id, None, None)?;
        let mut subscription = self.find_subscription(subscription_id)?;
        subscription.cancel_at_period_end = false;
        self.replace_subscription(&subscription);
        Ok(subscription)
    }

    async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayPaymentIntent> {
        self.record(
            "create_payment_intent",
            &params.customer,
            Some(key),
            Some(params.amount.to_string()),
        )?;
        let id = self.state().next_id("pi");
        Ok(GatewayPaymentIntent {
            id,
            customer: Some(params.customer.clone()),
            amount: params.amount,
            currency: params.currency.clone(),
            status: "requires_confirmation".to_string(),
            metadata: params.metadata.clone(),
            ..Default::default()
        })
    }

    async fn refund(
        &self,
        params: &RefundParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayRefund> {
        let target = params
            .payment_intent
            .clone()
            .or_else(|| params.charge.clone())
            .unwrap_or_default();
        self.record("refund", &target, Some(key), None)?;
        let id = self.state().next_id("re");
        Ok(GatewayRefund {
            id,
            amount: params.amount.unwrap_or_default(),
            charge: params.charge.clone(),
            payment_intent: params.payment_intent.clone(),
            status: Some("succeeded".to_string()),
        })
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        self.record(
            "attach_payment_method",
            payment_method_id,
            None,
            Some(customer_id.to_string()),
        )?;
        Ok(GatewayPaymentMethod {
            id: payment_method_id.to_string(),
            kind: "card".to_string(),
            customer: Some(customer_id.to_string()),
            card: None,
        })
    }

    async fn detach_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        self.record("detach_payment_method", payment_method_id, None, None)?;
        Ok(GatewayPaymentMethod {
            id: payment_method_id.to_string(),
            kind: "card".to_string(),
            customer: None,
            card: None,
        })
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<GatewayPaymentMethod>> {
        self.record("list_payment_methods", customer_id, None, None)?;
        Ok(Vec::new())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<GatewayCustomer> {
        self.record(
            "set_default_payment_method",
            customer_id,
            None,
            Some(payment_method_id.to_string()),
        )?;
        Ok(GatewayCustomer {
            id: customer_id.to_string(),
            ..Default::default()
        })
    }

    async fn create_coupon(
        &self,
        params: &CouponParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCoupon> {
        self.record("create_coupon", "", Some(key), None)?;
        let id = self.state().next_id("co");
        Ok(GatewayCoupon {
            id,
            percent_off: params.percent_off,
            amount_off: params.amount_off,
            currency: params.currency.clone(),
            duration: params.duration.clone(),
        })
    }

    async fn preview_invoice(&self, params: &InvoicePreviewParams) -> BillingResult<GatewayInvoice> {
        self.record(
            "preview_invoice",
            &params.subscription,
            None,
            Some(params.new_price_id.clone()),
        )?;
        self.state()
            .preview
            .clone()
            .ok_or_else(|| BillingError::NotFound("preview".to_string()))
    }

    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayInvoice> {
        self.record("create_invoice", &params.customer, Some(key), None)?;
        let mut state = self.state();
        let mut invoice = state.next_invoice.take().unwrap_or_default();
        if invoice.id.is_none() {
            invoice.id = Some(state.next_id("in"));
        }
        invoice.customer = params.customer.clone();
        invoice.subscription = params.subscription.clone();
        invoice.status = Some("draft".to_string());
        state.invoices.push(invoice.clone());
        Ok(invoice)
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
        self.record("finalize_invoice", invoice_id, None, None)?;
        let mut state = self.state();
        let invoice = state
            .invoices
            .iter_mut()
            .find(|i| i.id.as_deref() == Some(invoice_id))
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.status = Some("open".to_string());
        invoice.status_transitions.finalized_at = Some(OffsetDateTime::now_utc().unix_timestamp());
        Ok(invoice.clone())
    }

    async fn pay_invoice(
        &self,
        invoice_id: &str,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayInvoice> {
        self.record("pay_invoice", invoice_id, Some(key), None)?;
        let mut state = self.state();
        if let Some((code, message)) = state.decline.clone() {
            return Err(BillingError::Declined { code, message });
        }
        let invoice = state
            .invoices
            .iter_mut()
            .find(|i| i.id.as_deref() == Some(invoice_id))
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.status = Some("paid".to_string());
        invoice.amount_paid = invoice.amount_due;
        invoice.status_transitions.paid_at = Some(OffsetDateTime::now_utc().unix_timestamp());
        Ok(invoice.clone())
    }

    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        self.record("delete_invoice", invoice_id, None, None)?;
        self.state()
            .invoices
            .retain(|i| i.id.as_deref() != Some(invoice_id));
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        params: &ListParams,
    ) -> BillingResult<Page<GatewaySubscription>> {
        self.record(
            "list_subscriptions",
            "",
            None,
            params.starting_after.clone(),
        )?;
        Ok(paginate(&self.state().subscriptions, params))
    }

    async fn list_customers(&self, params: &ListParams) -> BillingResult<Page<GatewayCustomer>> {
        self.record("list_customers", "", None, params.starting_after.clone())?;
        Ok(paginate(&self.state().customers, params))
    }

    async fn list_invoices(&self, params: &ListParams) -> BillingResult<Page<GatewayInvoice>> {
        self.record("list_invoices", "", None, params.starting_after.clone())?;
        Ok(paginate(&self.state().invoices, params))
    }

    async fn list_charges(&self, params: &ListParams) -> BillingResult<Page<GatewayCharge>> {
        self.record("list_charges", "", None, params.starting_after.clone())?;
        Ok(paginate(&self.state().charges, params))
    }

    fn verify_webhook(&self, payload: &str, signature_header: &str) -> BillingResult<GatewayEvent> {
        signature::verify(
            payload,
            signature_header,
            self.webhook_secret.as_deref().unwrap_or_default(),
            signature::DEFAULT_TOLERANCE_SECS,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        GatewayEvent::from_json(payload)
    }
}

// Fixtures

pub const DAY: i64 = 86_400;
pub const T0: i64 = 1_700_000_000;

/// Monthly price tagged with a license type
pub fn price(id: &str, plan: &str, unit_amount: i64) -> GatewayPrice {
    GatewayPrice {
        id: id.to_string(),
        unit_amount: Some(unit_amount),
        currency: "usd".to_string(),
        recurring: Some(GatewayRecurring {
            interval: "month".to_string(),
            interval_count: 1,
        }),
        nickname: None,
        metadata: HashMap::from([(LICENSE_TYPE_KEY.to_string(), plan.to_string())]),
    }
}

/// Subscription carrying the CRM metadata checkout attaches
pub fn subscription(
    id: &str,
    customer: &str,
    internal_customer_id: &str,
    status: &str,
    plan: &str,
    created: i64,
) -> GatewaySubscription {
    GatewaySubscription {
        id: id.to_string(),
        customer: customer.to_string(),
        status: status.to_string(),
        items: Page {
            data: vec![GatewaySubscriptionItem {
                id: format!("si_{id}"),
                price: price(&format!("price_{plan}"), plan, 4900),
                quantity: Some(1),
            }],
            has_more: false,
        },
        current_period_start: created,
        current_period_end: created + 30 * DAY,
        cancel_at_period_end: false,
        canceled_at: None,
        trial_end: None,
        created,
        metadata: HashMap::from([
            (CUSTOMER_ID_KEY.to_string(), internal_customer_id.to_string()),
            (LICENSE_TYPE_KEY.to_string(), plan.to_string()),
        ]),
    }
}

/// Wrap an object in a webhook envelope
pub fn event_json(id: &str, event_type: &str, object: &impl serde::Serialize) -> String {
    serde_json::json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": object },
    })
    .to_string()
}

/// Signature header valid right now for [`TEST_WEBHOOK_SECRET`]
pub fn sign(payload: &str) -> String {
    signature::sign(
        payload,
        TEST_WEBHOOK_SECRET,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
    .unwrap_or_default()
}
