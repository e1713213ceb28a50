//! PostgreSQL store

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingCustomer, Invoice, InvoiceLineItem, Payment, Subscription, WebhookEventRecord,
};
use crate::store::{BillingStore, CustomerDirectory, LicenseSink};

const CUSTOMER_COLUMNS: &str =
    "id, user_id, external_customer_id, email, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, external_subscription_id, billing_customer_id, status, \
     billing_cycle, plan_id, price_id, unit_amount, currency, current_period_start, \
     current_period_end, cancel_at_period_end, canceled_at, cancellation_reason, \
     external_created_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, invoice_number, external_invoice_id, billing_customer_id, \
     subscription_id, status, currency, amount_due, amount_paid, total, hosted_invoice_url, \
     invoice_pdf_url, due_at, paid_at, created_at, updated_at";

const LINE_ITEM_COLUMNS: &str = "id, invoice_id, external_line_id, position, description, \
     quantity, unit_amount, amount, currency, period_start, period_end, proration";

const PAYMENT_COLUMNS: &str = "id, external_payment_id, billing_customer_id, invoice_id, status, \
     amount, currency, failure_code, failure_message, refunded_amount, refunded_at, created_at, \
     updated_at";

const WEBHOOK_COLUMNS: &str = "id, external_event_id, event_type, payload, processed, \
     processed_at, processing_started_at, attempts, last_error, received_at";

/// Idempotent: an active license with the same expiry is left untouched
const ACTIVATE_LICENSE_SQL: &str = r#"
    INSERT INTO user_licenses (user_id, plan_id, status, expires_at, updated_at)
    VALUES ($1, $2, 'ACTIVE', $3, NOW())
    ON CONFLICT (user_id, plan_id) DO UPDATE SET
        status = 'ACTIVE',
        expires_at = EXCLUDED.expires_at,
        updated_at = NOW()
    WHERE user_licenses.status <> 'ACTIVE'
       OR user_licenses.expires_at IS DISTINCT FROM EXCLUDED.expires_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: String,
    user_id: String,
    external_customer_id: Option<String>,
    email: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<CustomerRow> for BillingCustomer {
    fn from(row: CustomerRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            external_customer_id: row.external_customer_id,
            email: row.email,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    external_subscription_id: String,
    billing_customer_id: String,
    status: String,
    billing_cycle: String,
    plan_id: Option<String>,
    price_id: Option<String>,
    unit_amount: i64,
    currency: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    external_created_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            external_subscription_id: row.external_subscription_id,
            billing_customer_id: row.billing_customer_id,
            status: row.status.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            plan_id: row.plan_id,
            price_id: row.price_id,
            unit_amount: row.unit_amount,
            currency: row.currency,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            cancellation_reason: row.cancellation_reason,
            external_created_at: row.external_created_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    external_invoice_id: String,
    billing_customer_id: String,
    subscription_id: Option<Uuid>,
    status: String,
    currency: String,
    amount_due: i64,
    amount_paid: i64,
    total: i64,
    hosted_invoice_url: Option<String>,
    invoice_pdf_url: Option<String>,
    due_at: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            invoice_number: row.invoice_number,
            external_invoice_id: row.external_invoice_id,
            billing_customer_id: row.billing_customer_id,
            subscription_id: row.subscription_id,
            status: row.status.parse()?,
            currency: row.currency,
            amount_due: row.amount_due,
            amount_paid: row.amount_paid,
            total: row.total,
            hosted_invoice_url: row.hosted_invoice_url,
            invoice_pdf_url: row.invoice_pdf_url,
            due_at: row.due_at,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LineItemRow {
    id: Uuid,
    invoice_id: Uuid,
    external_line_id: String,
    position: i32,
    description: String,
    quantity: i64,
    unit_amount: i64,
    amount: i64,
    currency: String,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    proration: bool,
}

impl From<LineItemRow> for InvoiceLineItem {
    fn from(row: LineItemRow) -> Self {
        Self {
            id: row.id,
            invoice_id: row.invoice_id,
            external_line_id: row.external_line_id,
            position: row.position,
            description: row.description,
            quantity: row.quantity,
            unit_amount: row.unit_amount,
            amount: row.amount,
            currency: row.currency,
            period_start: row.period_start,
            period_end: row.period_end,
            proration: row.proration,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    external_payment_id: String,
    billing_customer_id: String,
    invoice_id: Option<Uuid>,
    status: String,
    amount: i64,
    currency: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    refunded_amount: i64,
    refunded_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            external_payment_id: row.external_payment_id,
            billing_customer_id: row.billing_customer_id,
            invoice_id: row.invoice_id,
            status: row.status.parse()?,
            amount: row.amount,
            currency: row.currency,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            refunded_amount: row.refunded_amount,
            refunded_at: row.refunded_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    payload: String,
    processed: bool,
    processed_at: Option<OffsetDateTime>,
    processing_started_at: Option<OffsetDateTime>,
    attempts: i32,
    last_error: Option<String>,
    received_at: OffsetDateTime,
}

impl From<WebhookEventRow> for WebhookEventRecord {
    fn from(row: WebhookEventRow) -> Self {
        Self {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            payload: row.payload,
            processed: row.processed,
            processed_at: row.processed_at,
            processing_started_at: row.processing_started_at,
            attempts: row.attempts,
            last_error: row.last_error,
            received_at: row.received_at,
        }
    }
}

/// Billing tables, license rows and the default customer directory, all
/// on one pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_unique_violation(e: sqlx::Error, message: impl FnOnce() -> String) -> BillingError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BillingError::Validation(message())
        }
        _ => e.into(),
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_customer(&self, customer: &BillingCustomer) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers
                (id, user_id, external_customer_id, email, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.user_id)
        .bind(&customer.external_customer_id)
        .bind(&customer.email)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!("billing customer {} or its external id already exists", customer.id)
            })
        })?;
        Ok(())
    }

    async fn find_customer(&self, id: &str) -> BillingResult<Option<BillingCustomer>> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM billing_customers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<BillingCustomer>> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM billing_customers WHERE external_customer_id = $1"
        ))
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn link_external_customer(
        &self,
        customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_customers
            SET external_customer_id = $2, updated_at = NOW()
            WHERE id = $1
              AND external_customer_id IS DISTINCT FROM $2
            "#,
        )
        .bind(customer_id)
        .bind(external_customer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!("external customer {external_customer_id} is linked to another customer")
            })
        })?;

        if result.rows_affected() == 0 && self.find_customer(customer_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "billing customer {customer_id}"
            )));
        }
        Ok(())
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE external_subscription_id = $1"
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE billing_customer_id = $1 AND status IN ('ACTIVE', 'TRIALING') \
             ORDER BY external_created_at DESC"
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn upsert_subscription(&self, s: &Subscription) -> BillingResult<Subscription> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_subscriptions ({SUBSCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (external_subscription_id) DO UPDATE SET
                billing_customer_id = EXCLUDED.billing_customer_id,
                status = EXCLUDED.status,
                billing_cycle = EXCLUDED.billing_cycle,
                plan_id = EXCLUDED.plan_id,
                price_id = EXCLUDED.price_id,
                unit_amount = EXCLUDED.unit_amount,
                currency = EXCLUDED.currency,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                cancellation_reason = EXCLUDED.cancellation_reason,
                external_created_at = EXCLUDED.external_created_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(s.id)
        .bind(&s.external_subscription_id)
        .bind(&s.billing_customer_id)
        .bind(s.status.as_str())
        .bind(s.billing_cycle.as_str())
        .bind(&s.plan_id)
        .bind(&s.price_id)
        .bind(s.unit_amount)
        .bind(&s.currency)
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.cancel_at_period_end)
        .bind(s.canceled_at)
        .bind(&s.cancellation_reason)
        .bind(s.external_created_at)
        .bind(s.created_at)
        .bind(s.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn mark_subscription_canceled(
        &self,
        id: Uuid,
        reason: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_subscriptions
            SET status = 'CANCELED',
                canceled_at = COALESCE(canceled_at, $3),
                cancellation_reason = $2,
                cancel_at_period_end = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_invoice_by_external_id(
        &self,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices WHERE external_invoice_id = $1"
        ))
        .bind(external_invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert_invoice(&self, i: &Invoice) -> BillingResult<Invoice> {
        // invoice_number and created_at are kept from the first insert
        let row: InvoiceRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_invoices ({INVOICE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (external_invoice_id) DO UPDATE SET
                billing_customer_id = EXCLUDED.billing_customer_id,
                subscription_id = EXCLUDED.subscription_id,
                status = EXCLUDED.status,
                currency = EXCLUDED.currency,
                amount_due = EXCLUDED.amount_due,
                amount_paid = EXCLUDED.amount_paid,
                total = EXCLUDED.total,
                hosted_invoice_url = EXCLUDED.hosted_invoice_url,
                invoice_pdf_url = EXCLUDED.invoice_pdf_url,
                due_at = EXCLUDED.due_at,
                paid_at = EXCLUDED.paid_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(i.id)
        .bind(&i.invoice_number)
        .bind(&i.external_invoice_id)
        .bind(&i.billing_customer_id)
        .bind(i.subscription_id)
        .bind(i.status.as_str())
        .bind(&i.currency)
        .bind(i.amount_due)
        .bind(i.amount_paid)
        .bind(i.total)
        .bind(&i.hosted_invoice_url)
        .bind(&i.invoice_pdf_url)
        .bind(i.due_at)
        .bind(i.paid_at)
        .bind(i.created_at)
        .bind(i.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn replace_line_items(
        &self,
        invoice_id: Uuid,
        items: &[InvoiceLineItem],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM billing_invoice_line_items WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            sqlx::query(&format!(
                r#"
                INSERT INTO billing_invoice_line_items ({LINE_ITEM_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#
            ))
            .bind(item.id)
            .bind(invoice_id)
            .bind(&item.external_line_id)
            .bind(item.position)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_amount)
            .bind(item.amount)
            .bind(&item.currency)
            .bind(item.period_start)
            .bind(item.period_end)
            .bind(item.proration)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_line_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceLineItem>> {
        let rows: Vec<LineItemRow> = sqlx::query_as(&format!(
            "SELECT {LINE_ITEM_COLUMNS} FROM billing_invoice_line_items \
             WHERE invoice_id = $1 ORDER BY position"
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn latest_open_invoice(&self, customer_id: &str) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM billing_invoices \
             WHERE billing_customer_id = $1 AND status = 'OPEN' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn next_invoice_number(&self) -> BillingResult<String> {
        let (next,): (i64,) = sqlx::query_as("SELECT nextval('billing_invoice_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(format!("INV-{next:06}"))
    }

    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM billing_payments WHERE external_payment_id = $1"
        ))
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert_payment(&self, p: &Payment) -> BillingResult<Payment> {
        let row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_payments ({PAYMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (external_payment_id) DO UPDATE SET
                billing_customer_id = EXCLUDED.billing_customer_id,
                invoice_id = EXCLUDED.invoice_id,
                status = EXCLUDED.status,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                failure_code = EXCLUDED.failure_code,
                failure_message = EXCLUDED.failure_message,
                refunded_amount = EXCLUDED.refunded_amount,
                refunded_at = EXCLUDED.refunded_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(p.id)
        .bind(&p.external_payment_id)
        .bind(&p.billing_customer_id)
        .bind(p.invoice_id)
        .bind(p.status.as_str())
        .bind(p.amount)
        .bind(&p.currency)
        .bind(&p.failure_code)
        .bind(&p.failure_message)
        .bind(p.refunded_amount)
        .bind(p.refunded_at)
        .bind(p.created_at)
        .bind(p.updated_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn find_webhook_event(
        &self,
        external_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM billing_webhook_events WHERE external_event_id = $1"
        ))
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<WebhookEventRecord> {
        // Processed events are never touched again
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO billing_webhook_events (id, external_event_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_event_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                payload = EXCLUDED.payload
            WHERE billing_webhook_events.processed = FALSE
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self
                .find_webhook_event(external_event_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("webhook event {external_event_id}"))),
        }
    }

    async fn claim_webhook_event(
        &self,
        external_event_id: &str,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        // Single conditional UPDATE: only one concurrent caller gets the row back
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE billing_webhook_events
            SET processing_started_at = NOW()
            WHERE external_event_id = $1
              AND processed = FALSE
              AND (processing_started_at IS NULL
                   OR processing_started_at < NOW() - make_interval(secs => $2))
            RETURNING id
            "#,
        )
        .bind(external_event_id)
        .bind(stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn mark_webhook_processed(&self, external_event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processed = TRUE, processed_at = NOW(), processing_started_at = NULL,
                last_error = NULL
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_webhook_failure(
        &self,
        external_event_id: &str,
        error: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET attempts = attempts + 1, last_error = $2, processing_started_at = NULL
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM billing_webhook_events \
             WHERE processed = FALSE AND attempts > 0 \
             ORDER BY received_at ASC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl LicenseSink for PgBillingStore {
    async fn activate_license(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(ACTIVATE_LICENSE_SQL)
            .bind(user_id)
            .bind(plan_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, || {
                    format!("user {user_id} already holds another active license")
                })
            })?;
        Ok(())
    }

    async fn deactivate_license(&self, user_id: &str, plan_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_licenses
            SET status = 'CANCELLED', updated_at = NOW()
            WHERE user_id = $1 AND plan_id = $2 AND status = 'ACTIVE'
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate_exclusive(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let replaced: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE user_licenses
            SET status = 'CANCELLED', updated_at = NOW()
            WHERE user_id = $1 AND plan_id <> $2 AND status = 'ACTIVE'
            RETURNING plan_id
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(ACTIVATE_LICENSE_SQL)
            .bind(user_id)
            .bind(plan_id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_unique_violation(e, || {
                    format!("user {user_id} gained another active license concurrently")
                })
            })?;

        tx.commit().await?;
        Ok(replaced.into_iter().map(|(plan,)| plan).collect())
    }

    async fn active_plans(&self, user_id: &str) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT plan_id FROM user_licenses WHERE user_id = $1 AND status = 'ACTIVE'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(plan,)| plan).collect())
    }
}

/// Directory backed by `billing_customers`, for deployments where the CRM
/// keeps no separate mapping
#[async_trait]
impl CustomerDirectory for PgBillingStore {
    async fn resolve_internal_customer_id(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<String>> {
        Ok(self
            .find_customer_by_external_id(external_customer_id)
            .await?
            .map(|c| c.id))
    }

    async fn link_external_customer_id(
        &self,
        internal_customer_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()> {
        self.link_external_customer(internal_customer_id, external_customer_id)
            .await
    }
}
