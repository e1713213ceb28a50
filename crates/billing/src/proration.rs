//! Plan-change proration
//!
//! `create_prorations` on its own only stages line items for the next
//! invoice. A committed plan change therefore materialises an invoice right
//! away: a positive amount is finalized and charged, a zero amount (pure
//! credit) leaves no draft behind.
//!
//! Each change carries a caller-supplied request id. Gateway keys derive
//! from it, and it is stamped on the subscription so a retry after a
//! partial failure resumes at the invoice instead of failing on "already
//! on plan".

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CreateInvoiceParams, GatewayInvoice, GatewaySubscription, IdempotencyKey,
    InvoicePreviewParams, PaymentGateway, ProrationBehavior, UpdateSubscriptionParams,
};
use crate::models::{BillingCycle, InvoiceStatus, Subscription};
use crate::plans::LICENSE_TYPE_KEY;
use crate::reconcile::{Origin, ReconciliationEngine};

/// One preview line shown to the user before confirming
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationLine {
    pub description: String,
    pub amount: i64,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    pub proration: bool,
}

/// Net effect of a plan change on the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationSummary {
    pub currency: String,
    /// Sum of positive current-period lines, in cents
    pub amount_due: i64,
    /// Sum of negative current-period lines as a positive number
    pub credit: i64,
    /// `max(0, amount_due - credit)`
    pub net_amount_due: i64,
    pub lines: Vec<ProrationLine>,
}

/// What happened to the proration invoice of a committed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProrationSettlement {
    /// Finalized and paid
    Charged { invoice_id: String, amount: i64 },
    /// Nothing to charge, the draft was deleted
    NoCharge { invoice_id: String },
    /// Left as the gateway returned it
    Open { invoice_id: String, amount: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub subscription: Subscription,
    pub settlement: ProrationSettlement,
}

/// Reduce a preview invoice to the lines of the current period.
///
/// Lines whose period starts at or after `current_period_end` belong to the
/// next cycle's regular charge and are excluded. Lines without a period
/// are one-off items billed now and are kept.
pub fn summarize(invoice: &GatewayInvoice, current_period_end: i64) -> ProrationSummary {
    let lines: Vec<ProrationLine> = invoice
        .lines
        .data
        .iter()
        .filter(|line| line.period.start.map_or(true, |start| start < current_period_end))
        .map(|line| ProrationLine {
            description: line.description.clone().unwrap_or_default(),
            amount: line.amount,
            period_start: line.period.start,
            period_end: line.period.end,
            proration: line.proration,
        })
        .collect();

    let amount_due: i64 = lines.iter().map(|l| l.amount).filter(|a| *a > 0).sum();
    let credit: i64 = lines
        .iter()
        .map(|l| l.amount)
        .filter(|a| *a < 0)
        .map(i64::abs)
        .sum();

    ProrationSummary {
        currency: invoice.currency.to_lowercase(),
        amount_due,
        credit,
        net_amount_due: (amount_due - credit).max(0),
        lines,
    }
}

/// Subscription metadata naming the request that last changed the plan
pub const PLAN_CHANGE_REQUEST_KEY: &str = "planChangeRequest";

/// Key of one gateway call within a plan change. Retrying the same request
/// reuses it.
fn step_key(scope: &[&str], step: &str) -> IdempotencyKey {
    let mut parts = scope.to_vec();
    parts.push(step);
    IdempotencyKey::derived(&parts)
}

pub struct ProrationCalculator {
    gateway: Arc<dyn PaymentGateway>,
    engine: Arc<ReconciliationEngine>,
}

/// Subscription, item and target price of a requested change
struct ChangeTarget {
    subscription: GatewaySubscription,
    item_id: String,
    price_id: String,
    current_price_id: String,
}

impl ChangeTarget {
    fn already_on_target(&self) -> bool {
        self.price_id == self.current_price_id
    }

    /// Whether `request_id` is the change that put the subscription on
    /// the target price
    fn applied_by(&self, request_id: &str) -> bool {
        self.already_on_target()
            && self
                .subscription
                .metadata
                .get(PLAN_CHANGE_REQUEST_KEY)
                .is_some_and(|applied| applied == request_id)
    }
}

fn already_on_plan(plan_id: &str) -> BillingError {
    BillingError::Validation(format!("subscription is already on plan {plan_id}"))
}

impl ProrationCalculator {
    pub fn new(gateway: Arc<dyn PaymentGateway>, engine: Arc<ReconciliationEngine>) -> Self {
        Self { gateway, engine }
    }

    async fn target(&self, subscription_id: &str, plan_id: &str) -> BillingResult<ChangeTarget> {
        let subscription = self.gateway.retrieve_subscription(subscription_id).await?;
        let item = subscription.primary_item().ok_or_else(|| {
            BillingError::Validation(format!("subscription {subscription_id} has no items"))
        })?;

        let cycle = item
            .price
            .recurring
            .as_ref()
            .map(|r| BillingCycle::from_interval(&r.interval, r.interval_count))
            .unwrap_or(BillingCycle::Monthly);
        let price_id = self
            .engine
            .plans()
            .price_for(plan_id, cycle)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))?
            .to_string();

        Ok(ChangeTarget {
            item_id: item.id.clone(),
            current_price_id: item.price.id.clone(),
            price_id,
            subscription,
        })
    }

    /// Preview the current-period effect of moving to `plan_id`
    pub async fn preview(&self, subscription_id: &str, plan_id: &str) -> BillingResult<ProrationSummary> {
        let target = self.target(subscription_id, plan_id).await?;
        if target.already_on_target() {
            return Err(already_on_plan(plan_id));
        }
        let preview = self
            .gateway
            .preview_invoice(&InvoicePreviewParams {
                customer: target.subscription.customer.clone(),
                subscription: target.subscription.id.clone(),
                item_id: target.item_id.clone(),
                new_price_id: target.price_id.clone(),
                proration_date: Some(OffsetDateTime::now_utc().unix_timestamp()),
            })
            .await?;

        let summary = summarize(&preview, target.subscription.current_period_end);
        tracing::info!(
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            amount_due = summary.amount_due,
            credit = summary.credit,
            net_amount_due = summary.net_amount_due,
            "Previewed plan change proration"
        );
        Ok(summary)
    }

    /// Move the subscription to `plan_id` and settle the proration now.
    ///
    /// `request_id` identifies this change: retrying with the same id never
    /// double-charges, and a retry after the plan switch already went
    /// through picks up at the invoice. A different id is a different change.
    ///
    /// A card decline comes back as `Validation` with the gateway's reason;
    /// the subscription keeps the new plan and the invoice stays open.
    pub async fn change_plan(
        &self,
        subscription_id: &str,
        plan_id: &str,
        request_id: &str,
    ) -> BillingResult<PlanChangeOutcome> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return Err(BillingError::Validation(
                "plan change request id is required".to_string(),
            ));
        }

        let target = self.target(subscription_id, plan_id).await?;
        let sub = &target.subscription;
        let scope = ["plan_change", sub.id.as_str(), plan_id, request_id];

        let updated = if target.applied_by(request_id) {
            tracing::info!(
                subscription_id = %subscription_id,
                plan_id = %plan_id,
                request_id = %request_id,
                "Plan already switched by this request, resuming at the invoice"
            );
            target.subscription.clone()
        } else if target.already_on_target() {
            return Err(already_on_plan(plan_id));
        } else {
            self.gateway
                .update_subscription(
                    &sub.id,
                    &UpdateSubscriptionParams {
                        item_id: target.item_id.clone(),
                        price_id: target.price_id.clone(),
                        proration_behavior: ProrationBehavior::CreateProrations,
                        metadata: HashMap::from([
                            (LICENSE_TYPE_KEY.to_string(), plan_id.to_string()),
                            (PLAN_CHANGE_REQUEST_KEY.to_string(), request_id.to_string()),
                        ]),
                    },
                    &step_key(&scope, "update"),
                )
                .await?
        };

        let subscription = self
            .engine
            .apply_subscription(&updated, Origin::Updated)
            .await?;

        let invoice = self
            .gateway
            .create_invoice(
                &CreateInvoiceParams {
                    customer: sub.customer.clone(),
                    subscription: Some(sub.id.clone()),
                    description: Some(format!("Plan change to {plan_id}")),
                    metadata: HashMap::new(),
                },
                &step_key(&scope, "invoice"),
            )
            .await?;
        let invoice_id = invoice.id.clone().ok_or_else(|| {
            BillingError::Internal("gateway returned an invoice without id".to_string())
        })?;

        let settlement = self.settle(invoice, &invoice_id, &scope).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            request_id = %request_id,
            settlement = ?settlement,
            "Plan changed"
        );

        Ok(PlanChangeOutcome {
            subscription,
            settlement,
        })
    }

    async fn settle(
        &self,
        invoice: GatewayInvoice,
        invoice_id: &str,
        scope: &[&str],
    ) -> BillingResult<ProrationSettlement> {
        let status = InvoiceStatus::from_gateway(invoice.status.as_deref());

        if invoice.amount_due == 0 {
            if status == InvoiceStatus::Draft {
                self.gateway.delete_invoice(invoice_id).await?;
                tracing::info!(invoice_id = %invoice_id, "Deleted zero-amount proration draft");
            }
            return Ok(ProrationSettlement::NoCharge {
                invoice_id: invoice_id.to_string(),
            });
        }

        let open = match status {
            InvoiceStatus::Draft => self.gateway.finalize_invoice(invoice_id).await?,
            InvoiceStatus::Open => invoice,
            _ => {
                return Ok(ProrationSettlement::Open {
                    invoice_id: invoice_id.to_string(),
                    amount: invoice.amount_due,
                })
            }
        };

        let paid = match self
            .gateway
            .pay_invoice(invoice_id, &step_key(scope, "pay"))
            .await
        {
            Ok(paid) => paid,
            Err(BillingError::Declined { code, message }) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    decline_code = ?code,
                    "Proration charge declined"
                );
                self.record_locally(&open, InvoiceStatus::Open).await;
                return Err(BillingError::Validation(format!(
                    "Your card was declined: {message}"
                )));
            }
            Err(e) => return Err(e),
        };

        self.record_locally(&paid, InvoiceStatus::Paid).await;
        Ok(ProrationSettlement::Charged {
            invoice_id: invoice_id.to_string(),
            amount: paid.amount_paid.max(paid.amount_due),
        })
    }

    /// Mirror the invoice now rather than waiting for its webhook.
    /// Failure here is not fatal: the webhook carries the same state.
    async fn record_locally(&self, invoice: &GatewayInvoice, status: InvoiceStatus) {
        if let Err(e) = self.engine.apply_invoice(invoice, Some(status)).await {
            tracing::warn!(
                invoice_id = ?invoice.id,
                error = %e,
                "Could not record proration invoice locally"
            );
        }
    }
}
