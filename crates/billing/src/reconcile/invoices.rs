//! Invoice handlers
//!
//! One upsert serves `invoice.created`, `.finalized`, `.paid`,
//! `.payment_failed` and backfill. PAID and VOID are terminal: a late
//! non-terminal event for such an invoice changes nothing.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayInvoice, GatewayLineItem};
use crate::models::{BillingCustomer, Invoice, InvoiceLineItem, InvoiceStatus};

use super::{optional_timestamp, ReconciliationEngine};

impl ReconciliationEngine {
    /// Upsert an invoice and its line items.
    ///
    /// `status` overrides the gateway's status string for events that imply
    /// one (`invoice.paid` is PAID even if the embedded object lags).
    pub async fn apply_invoice(
        &self,
        invoice: &GatewayInvoice,
        status: Option<InvoiceStatus>,
    ) -> BillingResult<Invoice> {
        let external_id = invoice
            .id
            .as_deref()
            .ok_or_else(|| BillingError::MalformedPayload("invoice without id".to_string()))?;
        let incoming_status =
            status.unwrap_or_else(|| InvoiceStatus::from_gateway(invoice.status.as_deref()));

        let existing = self.store.find_invoice_by_external_id(external_id).await?;
        if let Some(current) = existing.as_ref() {
            if current.status.is_terminal() && !incoming_status.is_terminal() {
                tracing::debug!(
                    invoice_id = %external_id,
                    status = %current.status.as_str(),
                    incoming = %incoming_status.as_str(),
                    "Stale invoice event ignored"
                );
                return Ok(current.clone());
            }
        }

        let customer = self.invoice_owner(invoice, existing.as_ref()).await?;

        let subscription_id = match invoice.subscription.as_deref() {
            Some(sub) => self
                .store
                .find_subscription_by_external_id(sub)
                .await?
                .map(|s| s.id),
            None => None,
        }
        .or_else(|| existing.as_ref().and_then(|i| i.subscription_id));

        let new_status = existing
            .as_ref()
            .map_or(incoming_status, |i| InvoiceStatus::merge(i.status, incoming_status));

        let now = OffsetDateTime::now_utc();
        let paid_at = if new_status == InvoiceStatus::Paid {
            Some(
                optional_timestamp(invoice.status_transitions.paid_at)?
                    .or_else(|| existing.as_ref().and_then(|i| i.paid_at))
                    .unwrap_or(now),
            )
        } else {
            existing.as_ref().and_then(|i| i.paid_at)
        };

        let invoice_number = match existing.as_ref() {
            Some(current) => current.invoice_number.clone(),
            None => self.store.next_invoice_number().await?,
        };

        let incoming = Invoice {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |i| i.id),
            invoice_number,
            external_invoice_id: external_id.to_string(),
            billing_customer_id: customer.id.clone(),
            subscription_id,
            status: new_status,
            currency: invoice.currency.to_lowercase(),
            amount_due: invoice.amount_due,
            amount_paid: invoice.amount_paid,
            total: invoice.total,
            hosted_invoice_url: invoice
                .hosted_invoice_url
                .clone()
                .or_else(|| existing.as_ref().and_then(|i| i.hosted_invoice_url.clone())),
            invoice_pdf_url: invoice
                .invoice_pdf
                .clone()
                .or_else(|| existing.as_ref().and_then(|i| i.invoice_pdf_url.clone())),
            due_at: optional_timestamp(invoice.due_date)?,
            paid_at,
            created_at: existing.as_ref().map_or(now, |i| i.created_at),
            updated_at: now,
        };

        let saved = match existing.as_ref() {
            Some(current) if current.same_state(&incoming) => current.clone(),
            _ => {
                let saved = self.store.upsert_invoice(&incoming).await?;
                tracing::info!(
                    invoice_id = %external_id,
                    invoice_number = %saved.invoice_number,
                    customer_id = %customer.id,
                    status = %saved.status.as_str(),
                    amount_due = saved.amount_due,
                    "Invoice reconciled"
                );
                saved
            }
        };

        self.sync_line_items(&saved, invoice).await?;
        Ok(saved)
    }

    async fn invoice_owner(
        &self,
        invoice: &GatewayInvoice,
        existing: Option<&Invoice>,
    ) -> BillingResult<BillingCustomer> {
        if let Some(current) = existing {
            if let Some(customer) = self.store.find_customer(&current.billing_customer_id).await? {
                return Ok(customer);
            }
        }
        if let Some(sub) = invoice.subscription.as_deref() {
            if let Some(local) = self.store.find_subscription_by_external_id(sub).await? {
                if let Some(customer) = self.store.find_customer(&local.billing_customer_id).await? {
                    return Ok(customer);
                }
            }
        }
        self.resolve_customer(&invoice.customer, &invoice.metadata)
            .await
    }

    /// Replace the stored lines when the gateway's list differs.
    /// Events without lines leave the stored ones alone.
    async fn sync_line_items(&self, saved: &Invoice, invoice: &GatewayInvoice) -> BillingResult<()> {
        if invoice.lines.data.is_empty() {
            return Ok(());
        }

        let incoming = invoice
            .lines
            .data
            .iter()
            .enumerate()
            .map(|(position, line)| to_line_item(saved, position, line))
            .collect::<BillingResult<Vec<_>>>()?;

        let current = self.store.list_line_items(saved.id).await?;
        if same_lines(&current, &incoming) {
            return Ok(());
        }

        self.store.replace_line_items(saved.id, &incoming).await?;
        tracing::debug!(
            invoice_id = %saved.external_invoice_id,
            lines = incoming.len(),
            "Invoice line items replaced"
        );
        Ok(())
    }
}

fn to_line_item(
    invoice: &Invoice,
    position: usize,
    line: &GatewayLineItem,
) -> BillingResult<InvoiceLineItem> {
    let quantity = line.quantity.unwrap_or(1).max(1);
    let unit_amount = line
        .price
        .as_ref()
        .and_then(|p| p.unit_amount)
        .unwrap_or(line.amount / quantity);
    let currency = if line.currency.is_empty() {
        invoice.currency.clone()
    } else {
        line.currency.to_lowercase()
    };

    Ok(InvoiceLineItem {
        id: Uuid::new_v4(),
        invoice_id: invoice.id,
        external_line_id: line.id.clone(),
        position: i32::try_from(position)
            .map_err(|_| BillingError::MalformedPayload("too many invoice lines".to_string()))?,
        description: line.description.clone().unwrap_or_default(),
        quantity,
        unit_amount,
        amount: line.amount,
        currency,
        period_start: optional_timestamp(line.period.start)?,
        period_end: optional_timestamp(line.period.end)?,
        proration: line.proration,
    })
}

/// Compare line lists ignoring local ids
fn same_lines(a: &[InvoiceLineItem], b: &[InvoiceLineItem]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.external_line_id == y.external_line_id
                && x.position == y.position
                && x.description == y.description
                && x.quantity == y.quantity
                && x.unit_amount == y.unit_amount
                && x.amount == y.amount
                && x.currency == y.currency
                && x.period_start == y.period_start
                && x.period_end == y.period_end
                && x.proration == y.proration
        })
}
