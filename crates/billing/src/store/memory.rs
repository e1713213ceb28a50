//! In-memory store for tests
//!
//! Implements every store seam over one shared map set. Clones share state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingCustomer, Invoice, InvoiceLineItem, InvoiceStatus, LicenseStatus, Payment,
    Subscription, SubscriptionStatus, UserLicense, WebhookEventRecord,
};
use crate::store::{BillingStore, CustomerDirectory, LicenseSink};

#[derive(Default)]
struct State {
    customers: HashMap<String, BillingCustomer>,
    subscriptions: HashMap<String, Subscription>,
    invoices: HashMap<String, Invoice>,
    line_items: HashMap<Uuid, Vec<InvoiceLineItem>>,
    payments: HashMap<String, Payment>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    licenses: HashMap<(String, String), UserLicense>,
    /// CRM-side mapping, external customer id to internal id
    directory: HashMap<String, String>,
    invoice_seq: u64,
}

impl State {
    fn activate(&mut self, user_id: &str, plan_id: &str, expires_at: Option<OffsetDateTime>) {
        let now = OffsetDateTime::now_utc();
        let license = self
            .licenses
            .entry((user_id.to_string(), plan_id.to_string()))
            .or_insert_with(|| UserLicense {
                user_id: user_id.to_string(),
                plan_id: plan_id.to_string(),
                status: LicenseStatus::Active,
                expires_at,
                updated_at: now,
            });

        if license.status != LicenseStatus::Active || license.expires_at != expires_at {
            license.status = LicenseStatus::Active;
            license.expires_at = expires_at;
            license.updated_at = now;
        }
    }
}

/// Entity state without the event log, for before/after comparisons
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub customers: Vec<BillingCustomer>,
    pub subscriptions: Vec<Subscription>,
    pub invoices: Vec<Invoice>,
    pub line_items: Vec<InvoiceLineItem>,
    pub payments: Vec<Payment>,
    pub licenses: Vec<UserLicense>,
}

#[derive(Clone, Default)]
pub struct MemoryBillingStore {
    state: Arc<RwLock<State>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a customer owned by `user_id`, optionally already linked
    pub async fn seed_customer(
        &self,
        id: &str,
        user_id: &str,
        external_customer_id: Option<&str>,
    ) -> BillingResult<BillingCustomer> {
        let now = OffsetDateTime::now_utc();
        let customer = BillingCustomer {
            id: id.to_string(),
            user_id: user_id.to_string(),
            external_customer_id: external_customer_id.map(str::to_string),
            email: None,
            created_at: now,
            updated_at: now,
        };
        self.insert_customer(&customer).await?;
        Ok(customer)
    }

    /// Register a mapping the CRM directory knows but billing does not
    pub async fn seed_directory(&self, external_customer_id: &str, internal_customer_id: &str) {
        self.state.write().await.directory.insert(
            external_customer_id.to_string(),
            internal_customer_id.to_string(),
        );
    }

    pub async fn subscription(&self, external_subscription_id: &str) -> Option<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .get(external_subscription_id)
            .cloned()
    }

    pub async fn subscriptions_for(&self, customer_id: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .state
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.billing_customer_id == customer_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.external_created_at);
        subs
    }

    pub async fn invoice(&self, external_invoice_id: &str) -> Option<Invoice> {
        self.state
            .read()
            .await
            .invoices
            .get(external_invoice_id)
            .cloned()
    }

    pub async fn payment(&self, external_payment_id: &str) -> Option<Payment> {
        self.state
            .read()
            .await
            .payments
            .get(external_payment_id)
            .cloned()
    }

    pub async fn licenses_for(&self, user_id: &str) -> Vec<UserLicense> {
        let mut licenses: Vec<UserLicense> = self
            .state
            .read()
            .await
            .licenses
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        licenses.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        licenses
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;

        let mut customers: Vec<_> = state.customers.values().cloned().collect();
        customers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut subscriptions: Vec<_> = state.subscriptions.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.external_subscription_id.cmp(&b.external_subscription_id));
        let mut invoices: Vec<_> = state.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| a.external_invoice_id.cmp(&b.external_invoice_id));
        let mut line_items: Vec<_> = state.line_items.values().flatten().cloned().collect();
        line_items.sort_by_key(|l| (l.invoice_id, l.position));
        let mut payments: Vec<_> = state.payments.values().cloned().collect();
        payments.sort_by(|a, b| a.external_payment_id.cmp(&b.external_payment_id));
        let mut licenses: Vec<_> = state.licenses.values().cloned().collect();
        licenses.sort_by(|a, b| (&a.user_id, &a.plan_id).cmp(&(&b.user_id, &b.plan_id)));

        Snapshot {
            customers,
            subscriptions,
            invoices,
            line_items,
            payments,
            licenses,
        }
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn insert_customer(&self, customer: &BillingCustomer) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if state.customers.contains_key(&customer.id) {
            return Err(BillingError::Validation(format!(
                "billing customer {} already exists",
                customer.id
            )));
        }
        if let Some(external) = &customer.external_customer_id {
            if state
                .customers
                .values()
                .any(|c| c.external_customer_id.as_ref() == Some(external))
            {
                return Err(BillingError::Validation(format!(
                    "external customer {external} is linked to another customer"
                )));
            }
        }
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(())
    }

    async fn find_customer(&self, id: &str) -> BillingResult<Option<BillingCustomer>> {
        Ok(self.state.read().await.customers.get(id).cloned())
    }

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        Ok(self
            .state
            .read()
            .await
            .customers
            .values()
            .find(|c| c.external_customer_id.as_deref() == Some(external_customer_id))
            .cloned())
    }

    async fn link_external_customer(
        &self,
        customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;

        if state.customers.values().any(|c| {
            c.id != customer_id && c.external_customer_id.as_deref() == Some(external_customer_id)
        }) {
            return Err(BillingError::Validation(format!(
                "external customer {external_customer_id} is linked to another customer"
            )));
        }

        let customer = state
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| BillingError::NotFound(format!("billing customer {customer_id}")))?;

        if customer.external_customer_id.as_deref() != Some(external_customer_id) {
            customer.external_customer_id = Some(external_customer_id.to_string());
            customer.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.subscription(external_subscription_id).await)
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions_for(customer_id)
            .await
            .into_iter()
            .filter(|s| s.status.is_active_like())
            .collect();
        subs.reverse();
        Ok(subs)
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut state = self.state.write().await;
        let mut row = subscription.clone();
        if let Some(existing) = state
            .subscriptions
            .get(&subscription.external_subscription_id)
        {
            row.id = existing.id;
            row.created_at = existing.created_at;
        }
        state
            .subscriptions
            .insert(row.external_subscription_id.clone(), row.clone());
        Ok(row)
    }

    async fn mark_subscription_canceled(
        &self,
        id: Uuid,
        reason: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if let Some(sub) = state.subscriptions.values_mut().find(|s| s.id == id) {
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = sub.canceled_at.or(Some(canceled_at));
            sub.cancellation_reason = Some(reason.to_string());
            sub.cancel_at_period_end = false;
            sub.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn find_invoice_by_external_id(
        &self,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self.invoice(external_invoice_id).await)
    }

    async fn upsert_invoice(&self, invoice: &Invoice) -> BillingResult<Invoice> {
        let mut state = self.state.write().await;
        let mut row = invoice.clone();
        if let Some(existing) = state.invoices.get(&invoice.external_invoice_id) {
            row.id = existing.id;
            row.invoice_number = existing.invoice_number.clone();
            row.created_at = existing.created_at;
        }
        state
            .invoices
            .insert(row.external_invoice_id.clone(), row.clone());
        Ok(row)
    }

    async fn replace_line_items(
        &self,
        invoice_id: Uuid,
        items: &[InvoiceLineItem],
    ) -> BillingResult<()> {
        self.state
            .write()
            .await
            .line_items
            .insert(invoice_id, items.to_vec());
        Ok(())
    }

    async fn list_line_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceLineItem>> {
        let mut items = self
            .state
            .read()
            .await
            .line_items
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default();
        items.sort_by_key(|l| l.position);
        Ok(items)
    }

    async fn latest_open_invoice(&self, customer_id: &str) -> BillingResult<Option<Invoice>> {
        Ok(self
            .state
            .read()
            .await
            .invoices
            .values()
            .filter(|i| i.billing_customer_id == customer_id && i.status == InvoiceStatus::Open)
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn next_invoice_number(&self) -> BillingResult<String> {
        let mut state = self.state.write().await;
        state.invoice_seq += 1;
        Ok(format!("INV-{:06}", state.invoice_seq))
    }

    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        Ok(self.payment(external_payment_id).await)
    }

    async fn upsert_payment(&self, payment: &Payment) -> BillingResult<Payment> {
        let mut state = self.state.write().await;
        let mut row = payment.clone();
        if let Some(existing) = state.payments.get(&payment.external_payment_id) {
            row.id = existing.id;
            row.created_at = existing.created_at;
        }
        state
            .payments
            .insert(row.external_payment_id.clone(), row.clone());
        Ok(row)
    }

    async fn find_webhook_event(
        &self,
        external_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self
            .state
            .read()
            .await
            .webhook_events
            .get(external_event_id)
            .cloned())
    }

    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<WebhookEventRecord> {
        let mut state = self.state.write().await;
        let record = state
            .webhook_events
            .entry(external_event_id.to_string())
            .or_insert_with(|| WebhookEventRecord {
                id: Uuid::new_v4(),
                external_event_id: external_event_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.to_string(),
                processed: false,
                processed_at: None,
                processing_started_at: None,
                attempts: 0,
                last_error: None,
                received_at: OffsetDateTime::now_utc(),
            });
        if !record.processed {
            record.event_type = event_type.to_string();
            record.payload = payload.to_string();
        }
        Ok(record.clone())
    }

    async fn claim_webhook_event(
        &self,
        external_event_id: &str,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        let Some(record) = state.webhook_events.get_mut(external_event_id) else {
            return Ok(false);
        };
        let now = OffsetDateTime::now_utc();
        let free = record
            .processing_started_at
            .map_or(true, |started| started < now - stale_after);
        if record.processed || !free {
            return Ok(false);
        }
        record.processing_started_at = Some(now);
        Ok(true)
    }

    async fn mark_webhook_processed(&self, external_event_id: &str) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.webhook_events.get_mut(external_event_id) {
            record.processed = true;
            record.processed_at = Some(OffsetDateTime::now_utc());
            record.processing_started_at = None;
            record.last_error = None;
        }
        Ok(())
    }

    async fn record_webhook_failure(
        &self,
        external_event_id: &str,
        error: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.webhook_events.get_mut(external_event_id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.processing_started_at = None;
        }
        Ok(())
    }

    async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let mut failed: Vec<WebhookEventRecord> = self
            .state
            .read()
            .await
            .webhook_events
            .values()
            .filter(|e| !e.processed && e.attempts > 0)
            .cloned()
            .collect();
        failed.sort_by_key(|e| e.received_at);
        Ok(failed
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl LicenseSink for MemoryBillingStore {
    async fn activate_license(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;

        if state.licenses.values().any(|l| {
            l.user_id == user_id && l.plan_id != plan_id && l.status == LicenseStatus::Active
        }) {
            return Err(BillingError::Validation(format!(
                "user {user_id} already holds another active license"
            )));
        }

        state.activate(user_id, plan_id, expires_at);
        Ok(())
    }

    async fn activate_exclusive(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<String>> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        let mut replaced = Vec::new();
        for license in state.licenses.values_mut() {
            if license.user_id == user_id
                && license.plan_id != plan_id
                && license.status == LicenseStatus::Active
            {
                license.status = LicenseStatus::Cancelled;
                license.updated_at = now;
                replaced.push(license.plan_id.clone());
            }
        }

        state.activate(user_id, plan_id, expires_at);
        Ok(replaced)
    }

    async fn deactivate_license(&self, user_id: &str, plan_id: &str) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if let Some(license) = state
            .licenses
            .get_mut(&(user_id.to_string(), plan_id.to_string()))
        {
            if license.status == LicenseStatus::Active {
                license.status = LicenseStatus::Cancelled;
                license.updated_at = OffsetDateTime::now_utc();
            }
        }
        Ok(())
    }

    async fn active_plans(&self, user_id: &str) -> BillingResult<Vec<String>> {
        Ok(self
            .licenses_for(user_id)
            .await
            .into_iter()
            .filter(|l| l.status == LicenseStatus::Active)
            .map(|l| l.plan_id)
            .collect())
    }
}

#[async_trait]
impl CustomerDirectory for MemoryBillingStore {
    async fn resolve_internal_customer_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .directory
            .get(external_customer_id)
            .cloned())
    }

    async fn link_external_customer_id(
        &self,
        internal_customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()> {
        self.state.write().await.directory.insert(
            external_customer_id.to_string(),
            internal_customer_id.to_string(),
        );
        Ok(())
    }
}
