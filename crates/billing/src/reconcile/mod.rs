//! Reconciliation engine
//!
//! Maps verified gateway events onto the local billing tables. Webhook
//! ingestion and backfill sync both go through the `apply_*` methods here,
//! so a full sync that observes the same gateway state as an earlier
//! webhook writes nothing.

pub mod customers;
pub mod invoices;
pub mod payments;
pub mod subscriptions;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{EventObject, EventType, GatewayEvent, PaymentGateway};
use crate::models::{InvoiceStatus, PaymentStatus};
use crate::plans::PlanCatalog;
use crate::store::{BillingStore, CustomerDirectory, LicenseSink};

/// Cancellation reason recorded on the loser of duplicate suppression
pub const REPLACED_REASON: &str = "Replaced by new subscription";

/// Where a gateway object came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Created,
    Updated,
    Deleted,
    Backfill,
}

impl Origin {
    /// Origins that may leave a second active subscription in place.
    /// An update can move an incomplete or trialing subscription to active.
    pub(crate) fn checks_duplicates(&self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

/// Applies one verified event to local state
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &GatewayEvent) -> BillingResult<()>;
}

/// Async mutex per billing customer.
///
/// Serialises subscription reconciliation for one customer inside this
/// process. An entry lives while a guard or a waiter holds it; idle entries
/// are dropped the next time any customer is locked.
#[derive(Clone, Default)]
pub struct CustomerLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CustomerLocks {
    pub async fn lock(&self, customer_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // Only the map holds an idle entry
            map.retain(|_, entry| Arc::strong_count(entry) > 1);
            map.entry(customer_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of customers with a live entry
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

pub struct ReconciliationEngine {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    licenses: Arc<dyn LicenseSink>,
    directory: Arc<dyn CustomerDirectory>,
    plans: PlanCatalog,
    locks: CustomerLocks,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        licenses: Arc<dyn LicenseSink>,
        directory: Arc<dyn CustomerDirectory>,
        plans: PlanCatalog,
    ) -> Self {
        Self {
            gateway,
            store,
            licenses,
            directory,
            plans,
            locks: CustomerLocks::default(),
        }
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }
}

#[async_trait]
impl EventProcessor for ReconciliationEngine {
    async fn process(&self, event: &GatewayEvent) -> BillingResult<()> {
        match &event.event_type {
            EventType::CheckoutSessionCompleted => match &event.object {
                EventObject::CheckoutSession(session) => self.link_checkout_session(session).await,
                _ => Err(mismatch(event, "checkout session")),
            },
            EventType::CustomerCreated | EventType::CustomerUpdated => match &event.object {
                EventObject::Customer(customer) => self.link_customer(customer).await,
                _ => Err(mismatch(event, "customer")),
            },
            EventType::CustomerDeleted => {
                tracing::info!(
                    event_id = %event.id,
                    "Gateway customer deleted, keeping local customer"
                );
                Ok(())
            }
            EventType::SubscriptionCreated => {
                let sub = event.expect_subscription()?;
                self.apply_subscription(sub, Origin::Created).await.map(drop)
            }
            EventType::SubscriptionUpdated => {
                let sub = event.expect_subscription()?;
                self.apply_subscription(sub, Origin::Updated).await.map(drop)
            }
            EventType::SubscriptionDeleted => {
                let sub = event.expect_subscription()?;
                self.apply_subscription(sub, Origin::Deleted).await.map(drop)
            }
            EventType::InvoiceCreated => {
                let invoice = event.expect_invoice()?;
                self.apply_invoice(invoice, None).await.map(drop)
            }
            EventType::InvoiceFinalized | EventType::InvoicePaymentFailed => {
                let invoice = event.expect_invoice()?;
                self.apply_invoice(invoice, Some(InvoiceStatus::Open))
                    .await
                    .map(drop)
            }
            EventType::InvoicePaid => {
                let invoice = event.expect_invoice()?;
                self.apply_invoice(invoice, Some(InvoiceStatus::Paid))
                    .await
                    .map(drop)
            }
            EventType::PaymentIntentSucceeded => {
                let intent = event.expect_payment_intent()?;
                self.apply_payment_intent(intent, PaymentStatus::Succeeded)
                    .await
                    .map(drop)
            }
            EventType::PaymentIntentFailed => {
                let intent = event.expect_payment_intent()?;
                self.apply_payment_intent(intent, PaymentStatus::Failed)
                    .await
                    .map(drop)
            }
            EventType::ChargeRefunded => {
                let charge = event.expect_charge()?;
                self.apply_charge(charge, true).await.map(drop)
            }
            EventType::Unknown(event_type) => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Unhandled event type acknowledged"
                );
                Ok(())
            }
        }
    }
}

fn mismatch(event: &GatewayEvent, expected: &str) -> BillingError {
    BillingError::MalformedPayload(format!(
        "event {} of type {} does not carry a {expected}",
        event.id, event.event_type
    ))
}

/// Gateway unix timestamp to a local time
pub(crate) fn timestamp(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::MalformedPayload(format!("timestamp {secs}: {e}")))
}

pub(crate) fn optional_timestamp(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(timestamp).transpose()
}
