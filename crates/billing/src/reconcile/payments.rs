//! Payment handlers
//!
//! Payments are keyed by payment intent id, or by charge id for charges
//! created without an intent. When the gateway does not echo the invoice,
//! the payment is attached to the customer's most recent OPEN invoice. That
//! correlation is best effort and can pick the wrong invoice when a
//! customer has several open at once.

use std::collections::HashMap;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::{GatewayCharge, GatewayPaymentIntent};
use crate::models::{BillingCustomer, Payment, PaymentStatus};

use super::ReconciliationEngine;

impl ReconciliationEngine {
    /// `payment_intent.succeeded` / `payment_intent.payment_failed`
    pub async fn apply_payment_intent(
        &self,
        intent: &GatewayPaymentIntent,
        status: PaymentStatus,
    ) -> BillingResult<Payment> {
        let existing = self.store.find_payment_by_external_id(&intent.id).await?;
        let customer = self
            .payment_owner(
                existing.as_ref(),
                intent.customer.as_deref(),
                &intent.metadata,
            )
            .await?;

        let invoice_id = self
            .correlate_invoice(&customer, intent.invoice.as_deref(), existing.as_ref())
            .await?;

        let new_status = existing
            .as_ref()
            .map_or(status, |p| PaymentStatus::merge(p.status, status));

        let (failure_code, failure_message) = match new_status {
            PaymentStatus::Failed => {
                let error = intent.last_payment_error.as_ref();
                (
                    error.and_then(|e| e.decline_code.clone().or_else(|| e.code.clone())),
                    error.and_then(|e| e.message.clone()),
                )
            }
            PaymentStatus::Succeeded => (None, None),
            _ => existing
                .as_ref()
                .map(|p| (p.failure_code.clone(), p.failure_message.clone()))
                .unwrap_or_default(),
        };

        let now = OffsetDateTime::now_utc();
        let incoming = Payment {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |p| p.id),
            external_payment_id: intent.id.clone(),
            billing_customer_id: customer.id.clone(),
            invoice_id,
            status: new_status,
            amount: intent.amount,
            currency: intent.currency.to_lowercase(),
            failure_code,
            failure_message,
            refunded_amount: existing.as_ref().map_or(0, |p| p.refunded_amount),
            refunded_at: existing.as_ref().and_then(|p| p.refunded_at),
            created_at: existing.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
        };

        self.save_payment(existing.as_ref(), incoming).await
    }

    /// `charge.refunded` when `refund` is set, otherwise a listed charge
    /// from backfill
    pub async fn apply_charge(&self, charge: &GatewayCharge, refund: bool) -> BillingResult<Payment> {
        let key = charge.payment_key();
        let existing = self.store.find_payment_by_external_id(key).await?;
        let customer = self
            .payment_owner(
                existing.as_ref(),
                charge.customer.as_deref(),
                &HashMap::new(),
            )
            .await?;

        let invoice_id = self
            .correlate_invoice(&customer, charge.invoice.as_deref(), existing.as_ref())
            .await?;

        let observed = if refund || charge.refunded || charge.amount_refunded > 0 {
            PaymentStatus::Refunded
        } else {
            match charge.status.as_str() {
                "succeeded" => PaymentStatus::Succeeded,
                "failed" => PaymentStatus::Failed,
                _ => PaymentStatus::Pending,
            }
        };
        let new_status = existing
            .as_ref()
            .map_or(observed, |p| PaymentStatus::merge(p.status, observed));

        let now = OffsetDateTime::now_utc();
        let refunded_amount = charge
            .amount_refunded
            .max(existing.as_ref().map_or(0, |p| p.refunded_amount));
        let refunded_at = match existing.as_ref() {
            Some(p) if p.refunded_amount == refunded_amount && p.refunded_at.is_some() => {
                p.refunded_at
            }
            _ if new_status == PaymentStatus::Refunded => Some(now),
            Some(p) => p.refunded_at,
            None => None,
        };

        let incoming = Payment {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |p| p.id),
            external_payment_id: key.to_string(),
            billing_customer_id: customer.id.clone(),
            invoice_id,
            status: new_status,
            amount: existing.as_ref().map_or(charge.amount, |p| p.amount),
            currency: existing
                .as_ref()
                .map_or_else(|| charge.currency.to_lowercase(), |p| p.currency.clone()),
            failure_code: charge
                .failure_code
                .clone()
                .or_else(|| existing.as_ref().and_then(|p| p.failure_code.clone())),
            failure_message: charge
                .failure_message
                .clone()
                .or_else(|| existing.as_ref().and_then(|p| p.failure_message.clone())),
            refunded_amount,
            refunded_at,
            created_at: existing.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
        };

        self.save_payment(existing.as_ref(), incoming).await
    }

    async fn save_payment(
        &self,
        existing: Option<&Payment>,
        incoming: Payment,
    ) -> BillingResult<Payment> {
        if let Some(current) = existing {
            if current.same_state(&incoming) {
                return Ok(current.clone());
            }
        }

        let saved = self.store.upsert_payment(&incoming).await?;
        tracing::info!(
            payment_id = %saved.external_payment_id,
            customer_id = %saved.billing_customer_id,
            invoice_id = ?saved.invoice_id,
            status = %saved.status.as_str(),
            amount = saved.amount,
            refunded_amount = saved.refunded_amount,
            "Payment reconciled"
        );
        Ok(saved)
    }

    async fn payment_owner(
        &self,
        existing: Option<&Payment>,
        external_customer_id: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<BillingCustomer> {
        if let Some(current) = existing {
            if let Some(customer) = self.store.find_customer(&current.billing_customer_id).await? {
                return Ok(customer);
            }
        }
        self.resolve_customer(external_customer_id.unwrap_or_default(), metadata)
            .await
    }

    /// Echoed invoice, then the stored link, then the latest OPEN invoice
    async fn correlate_invoice(
        &self,
        customer: &BillingCustomer,
        external_invoice_id: Option<&str>,
        existing: Option<&Payment>,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(external_invoice_id) = external_invoice_id {
            if let Some(invoice) = self
                .store
                .find_invoice_by_external_id(external_invoice_id)
                .await?
            {
                return Ok(Some(invoice.id));
            }
        }

        if let Some(invoice_id) = existing.and_then(|p| p.invoice_id) {
            return Ok(Some(invoice_id));
        }

        Ok(self
            .store
            .latest_open_invoice(&customer.id)
            .await?
            .map(|invoice| invoice.id))
    }
}
