//! Backfill sync
//!
//! Pages through the gateway's customers, subscriptions, invoices and
//! charges and feeds every object through the same reconciliation methods
//! the webhook path uses. Run on a fresh environment to import state, or on
//! a schedule to repair drift.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayObject, ListParams, Page, PaymentGateway};
use crate::reconcile::{Origin, ReconciliationEngine};

/// Fetch every page of a cursor-paginated list.
///
/// Stops when the gateway reports no further pages, returns an empty page,
/// or hands back a cursor it already returned.
pub async fn collect_pages<T, F, Fut>(
    page_size: u32,
    customer: Option<&str>,
    mut fetch: F,
) -> BillingResult<Vec<T>>
where
    T: GatewayObject,
    F: FnMut(ListParams) -> Fut,
    Fut: Future<Output = BillingResult<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = fetch(ListParams {
            limit: page_size,
            starting_after: cursor.clone(),
            customer: customer.map(str::to_string),
        })
        .await?;

        let Some(last) = page.data.last().map(|item| item.gateway_id().to_string()) else {
            break;
        };
        let has_more = page.has_more;
        items.extend(page.data);

        if !has_more {
            break;
        }
        if cursor.as_deref() == Some(last.as_str()) {
            tracing::warn!(cursor = %last, "Gateway repeated a pagination cursor, stopping");
            break;
        }
        cursor = Some(last);
    }

    Ok(items)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjectCounts {
    pub seen: usize,
    pub applied: usize,
    /// Objects whose customer does not resolve locally
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub object: &'static str,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub customers: ObjectCounts,
    pub subscriptions: ObjectCounts,
    pub invoices: ObjectCounts,
    pub charges: ObjectCounts,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<T>(
        &mut self,
        object: &'static str,
        id: &str,
        result: BillingResult<T>,
    ) {
        let counts = match object {
            "customer" => &mut self.customers,
            "subscription" => &mut self.subscriptions,
            "invoice" => &mut self.invoices,
            _ => &mut self.charges,
        };
        counts.seen += 1;

        match result {
            Ok(_) => counts.applied += 1,
            Err(BillingError::UnresolvableCustomer(_)) => counts.skipped += 1,
            Err(e) => {
                tracing::error!(object = object, id = %id, error = %e, "Backfill failed for object");
                self.failures.push(SyncFailure {
                    object,
                    id: id.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn list_failed(&mut self, object: &'static str, error: BillingError) {
        tracing::error!(object = object, error = %error, "Backfill listing failed");
        self.failures.push(SyncFailure {
            object,
            id: String::new(),
            error: error.to_string(),
        });
    }
}

pub struct BackfillSync {
    gateway: Arc<dyn PaymentGateway>,
    engine: Arc<ReconciliationEngine>,
    page_size: u32,
}

impl BackfillSync {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        engine: Arc<ReconciliationEngine>,
        page_size: u32,
    ) -> Self {
        Self {
            gateway,
            engine,
            page_size: page_size.clamp(1, 100),
        }
    }

    /// Full sync, or only the objects of one gateway customer
    pub async fn run(&self, customer: Option<&str>) -> SyncReport {
        let mut report = SyncReport::default();
        let gateway = &self.gateway;
        let size = self.page_size;

        tracing::info!(customer = ?customer, page_size = size, "Backfill started");

        // The customers list cannot be narrowed to one customer
        if customer.is_none() {
            match collect_pages(size, None, |p| async move { gateway.list_customers(&p).await })
                .await
            {
                Ok(customers) => {
                    for c in &customers {
                        report.record("customer", &c.id, self.engine.link_customer(c).await);
                    }
                }
                Err(e) => report.list_failed("customer", e),
            }
        }

        match collect_pages(size, customer, |p| async move {
            gateway.list_subscriptions(&p).await
        })
        .await
        {
            Ok(subscriptions) => {
                for s in &subscriptions {
                    let result = self.engine.apply_subscription(s, Origin::Backfill).await;
                    report.record("subscription", &s.id, result);
                }
            }
            Err(e) => report.list_failed("subscription", e),
        }

        match collect_pages(size, customer, |p| async move { gateway.list_invoices(&p).await })
            .await
        {
            Ok(invoices) => {
                for i in &invoices {
                    let result = self.engine.apply_invoice(i, None).await;
                    report.record("invoice", i.gateway_id(), result);
                }
            }
            Err(e) => report.list_failed("invoice", e),
        }

        match collect_pages(size, customer, |p| async move { gateway.list_charges(&p).await })
            .await
        {
            Ok(charges) => {
                for c in &charges {
                    let result = self.engine.apply_charge(c, false).await;
                    report.record("charge", &c.id, result);
                }
            }
            Err(e) => report.list_failed("charge", e),
        }

        tracing::info!(
            subscriptions = report.subscriptions.applied,
            invoices = report.invoices.applied,
            charges = report.charges.applied,
            skipped = report.subscriptions.skipped
                + report.invoices.skipped
                + report.charges.skipped,
            failures = report.failures.len(),
            "Backfill finished"
        );
        report
    }
}
