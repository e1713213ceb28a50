//! Stripe adapter on `async-stripe`
//!
//! Uses the crate's typed resource calls, plus the raw client for the two
//! invoice endpoints it does not model (preview and pay). Create calls run on
//! a client switched to [`RequestStrategy::Idempotent`] with the caller's key.
//! Every call goes through [`with_retry`], so only transient failures are
//! repeated.

use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use ::stripe::{
    AttachPaymentMethod, BillingPortalSession, CancelSubscription, ChargeId, CheckoutSession,
    CheckoutSessionMode, Client, Coupon, CreateBillingPortalSession, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCoupon,
    CreateCustomer, CreateInvoice, CreatePaymentIntent, CreateRefund, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, CustomerInvoiceSettings, ErrorType, Invoice,
    InvoiceId, ListCharges, ListCustomers, ListInvoices, ListPaymentMethods, ListSubscriptions,
    PaymentIntent, PaymentIntentId, PaymentMethod, PaymentMethodId, PaymentMethodTypeFilter,
    Refund, RequestStrategy, StripeError, Subscription, SubscriptionId, SubscriptionStatusFilter,
    UpdateCustomer, UpdateSubscription, UpdateSubscriptionItems,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, instrument};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::retry::{with_retry, RetryPolicy};
use crate::gateway::signature;
use crate::gateway::{
    CancelMode, CheckoutSessionParams, CouponParams, CreateCustomerParams, CreateInvoiceParams,
    CreateSubscriptionParams, GatewayCharge, GatewayCheckoutSession, GatewayCoupon,
    GatewayCustomer, GatewayEvent, GatewayInvoice, GatewayPaymentIntent, GatewayPaymentMethod,
    GatewayPortalSession, GatewayRefund, GatewaySubscription, IdempotencyKey,
    InvoicePreviewParams, ListParams, Page, PaymentGateway, PaymentIntentParams,
    PortalSessionParams, RefundParams, UpdateCustomerParams, UpdateSubscriptionParams,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn parse_id<I>(value: &str, what: &str) -> BillingResult<I>
where
    I: FromStr,
    I::Err: Display,
{
    value
        .parse::<I>()
        .map_err(|e| BillingError::Validation(format!("invalid {what} id '{value}': {e}")))
}

fn parse_optional_id<I>(value: Option<&str>, what: &str) -> BillingResult<Option<I>>
where
    I: FromStr,
    I::Err: Display,
{
    value.map(|v| parse_id(v, what)).transpose()
}

/// Decode a Stripe enum from its wire name
fn wire<T: DeserializeOwned>(value: &str, what: &str) -> BillingResult<T> {
    serde_json::from_value(Value::String(value.to_string()))
        .map_err(|_| BillingError::Validation(format!("unsupported {what} '{value}'")))
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Re-read a typed Stripe object as its gateway-neutral shape.
///
/// Both follow the wire format. Nulls are dropped first so the neutral
/// types' field defaults apply.
pub(crate) fn into_gateway<S: Serialize, T: DeserializeOwned>(object: &S) -> BillingResult<T> {
    let mut value = serde_json::to_value(object)
        .map_err(|e| BillingError::Internal(format!("failed to encode gateway object: {e}")))?;
    strip_nulls(&mut value);
    serde_json::from_value(value)
        .map_err(|e| BillingError::Internal(format!("unexpected gateway object shape: {e}")))
}

/// Map a client failure onto the error taxonomy
pub(crate) fn map_stripe_error(err: StripeError, operation: &str) -> BillingError {
    match err {
        StripeError::Stripe(request) => {
            let status = request.http_status;
            let message = request
                .message
                .clone()
                .unwrap_or_else(|| format!("gateway returned {status}"));

            if status == 429 || status >= 500 {
                return BillingError::Transient(message);
            }

            if matches!(request.error_type, ErrorType::Card) || status == 402 {
                let code = request
                    .decline_code
                    .clone()
                    .or_else(|| request.code.as_ref().map(|c| format!("{c:?}")));
                return BillingError::Declined { code, message };
            }

            match status {
                404 => BillingError::NotFound(message),
                401 | 403 => BillingError::Config(format!("gateway rejected credentials: {message}")),
                _ => BillingError::Validation(message),
            }
        }
        StripeError::Timeout => BillingError::Transient(format!("{operation} timed out")),
        StripeError::ClientError(msg) => BillingError::Transient(msg),
        StripeError::QueryStringSerialize(e) => {
            BillingError::Internal(format!("failed to encode {operation} request: {e}"))
        }
        StripeError::JSONSerialize(e) => {
            BillingError::Internal(format!("unparseable gateway response: {e}"))
        }
        StripeError::UnsupportedVersion => {
            BillingError::Config("unsupported gateway API version".to_string())
        }
    }
}

#[derive(Serialize)]
struct NoParams {}

#[derive(Serialize)]
struct PreviewItem<'a> {
    id: &'a str,
    price: &'a str,
}

#[derive(Serialize)]
struct PreviewDetails<'a> {
    items: Vec<PreviewItem<'a>>,
    proration_behavior: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    proration_date: Option<i64>,
}

#[derive(Serialize)]
struct PreviewForm<'a> {
    customer: &'a str,
    subscription: &'a str,
    subscription_details: PreviewDetails<'a>,
}

/// Stripe implementation of [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    webhook_secret: Option<String>,
    api_base: String,
    tolerance_secs: i64,
    retry: RetryPolicy,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("api_base", &self.api_base)
            .field("webhook_secret_configured", &self.webhook_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl StripeGateway {
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        if config.secret_key.is_empty() {
            return Err(BillingError::Config(
                "gateway secret key is not configured".to_string(),
            ));
        }
        if !(config.api_base.starts_with("https://") || config.api_base.starts_with("http://")) {
            return Err(BillingError::Config(format!(
                "gateway API base '{}' is not an http(s) URL",
                config.api_base
            )));
        }

        let client = Client::from_url(config.api_base.as_str(), config.secret_key.clone())
            .with_app_info(
                "crm-billing".to_string(),
                Some(env!("CARGO_PKG_VERSION").to_string()),
                None,
            );

        Ok(Self {
            client,
            webhook_secret: config.webhook_secret.clone(),
            api_base: config.api_base.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
            retry: config.retry,
        })
    }

    /// Client that sends `key` as the request's Idempotency-Key
    fn idempotent(&self, key: &IdempotencyKey) -> Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }

    async fn send<S, F, Fut>(&self, operation: &str, mut request: F) -> BillingResult<S>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S, StripeError>>,
    {
        with_retry(&self.retry, operation, || {
            let pending = request();
            async move {
                let result = match tokio::time::timeout(REQUEST_TIMEOUT, pending).await {
                    Ok(result) => result.map_err(|e| map_stripe_error(e, operation)),
                    Err(_) => Err(BillingError::Transient(format!("{operation} timed out"))),
                };
                if let Err(err) = &result {
                    error!(operation = %operation, error = %err, "Gateway API error");
                }
                result
            }
        })
        .await
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, params, key))]
    async fn create_customer(
        &self,
        params: &CreateCustomerParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCustomer> {
        let client = self.idempotent(key);
        let mut create = CreateCustomer::new();
        create.email = params.email.as_deref();
        create.name = params.name.as_deref();
        create.metadata = Some(params.metadata.clone());

        let customer = self
            .send("create_customer", || Customer::create(&client, create.clone()))
            .await?;
        into_gateway(&customer)
    }

    #[instrument(skip(self, params))]
    async fn update_customer(
        &self,
        customer_id: &str,
        params: &UpdateCustomerParams,
    ) -> BillingResult<GatewayCustomer> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let mut update = UpdateCustomer::new();
        update.email = params.email.as_deref();
        update.name = params.name.as_deref();
        update.metadata = Some(params.metadata.clone());

        let customer = self
            .send("update_customer", || {
                Customer::update(&self.client, &id, update.clone())
            })
            .await?;
        into_gateway(&customer)
    }

    #[instrument(skip(self))]
    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        self.send("delete_customer", || Customer::delete(&self.client, &id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, params, key))]
    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCheckoutSession> {
        let client = self.idempotent(key);
        let mut create = CreateCheckoutSession::new();
        create.customer = Some(parse_id(&params.customer, "customer")?);
        create.mode = Some(CheckoutSessionMode::Subscription);
        create.success_url = Some(&params.success_url);
        create.cancel_url = Some(&params.cancel_url);
        create.client_reference_id = params.client_reference_id.as_deref();
        create.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(params.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        create.metadata = Some(params.metadata.clone());
        create.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            trial_period_days: params.trial_days,
            metadata: Some(params.metadata.clone()),
            ..Default::default()
        });

        let session = self
            .send("create_checkout_session", || {
                CheckoutSession::create(&client, create.clone())
            })
            .await?;
        into_gateway(&session)
    }

    #[instrument(skip(self, params))]
    async fn create_portal_session(
        &self,
        params: &PortalSessionParams,
    ) -> BillingResult<GatewayPortalSession> {
        let mut create = CreateBillingPortalSession::new(parse_id(&params.customer, "customer")?);
        create.return_url = Some(&params.return_url);

        let session = self
            .send("create_portal_session", || {
                BillingPortalSession::create(&self.client, create.clone())
            })
            .await?;
        into_gateway(&session)
    }

    #[instrument(skip(self, params, key))]
    async fn create_subscription(
        &self,
        params: &CreateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription> {
        let client = self.idempotent(key);
        let mut create = CreateSubscription::new(parse_id(&params.customer, "customer")?);
        create.items = Some(vec![CreateSubscriptionItems {
            price: Some(params.price_id.clone()),
            ..Default::default()
        }]);
        create.trial_period_days = params.trial_days;
        create.default_payment_method = params.default_payment_method.as_deref();
        create.metadata = Some(params.metadata.clone());

        let subscription = self
            .send("create_subscription", || {
                Subscription::create(&client, create.clone())
            })
            .await?;
        into_gateway(&subscription)
    }

    #[instrument(skip(self))]
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        debug!(subscription_id = %subscription_id, "Retrieving subscription");
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let subscription = self
            .send("retrieve_subscription", || {
                Subscription::retrieve(&self.client, &id, &[])
            })
            .await?;
        into_gateway(&subscription)
    }

    #[instrument(skip(self, params, key))]
    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: &UpdateSubscriptionParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewaySubscription> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let client = self.idempotent(key);
        let mut update = UpdateSubscription::new();
        update.items = Some(vec![UpdateSubscriptionItems {
            id: Some(params.item_id.clone()),
            price: Some(params.price_id.clone()),
            ..Default::default()
        }]);
        update.proration_behavior = Some(wire(
            params.proration_behavior.as_str(),
            "proration behavior",
        )?);
        update.metadata = Some(params.metadata.clone());

        let subscription = self
            .send("update_subscription", || {
                Subscription::update(&client, &id, update.clone())
            })
            .await?;
        into_gateway(&subscription)
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        mode: CancelMode,
    ) -> BillingResult<GatewaySubscription> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let subscription = match mode {
            CancelMode::Immediately => {
                self.send("cancel_subscription", || {
                    Subscription::cancel(&self.client, &id, CancelSubscription::default())
                })
                .await?
            }
            CancelMode::AtPeriodEnd => {
                let mut update = UpdateSubscription::new();
                update.cancel_at_period_end = Some(true);
                self.send("cancel_subscription", || {
                    Subscription::update(&self.client, &id, update.clone())
                })
                .await?
            }
        };
        into_gateway(&subscription)
    }

    #[instrument(skip(self))]
    async fn resume_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let mut update = UpdateSubscription::new();
        update.cancel_at_period_end = Some(false);

        let subscription = self
            .send("resume_subscription", || {
                Subscription::update(&self.client, &id, update.clone())
            })
            .await?;
        into_gateway(&subscription)
    }

    #[instrument(skip(self, params, key))]
    async fn create_payment_intent(
        &self,
        params: &PaymentIntentParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayPaymentIntent> {
        let client = self.idempotent(key);
        let currency = wire(&params.currency.to_lowercase(), "currency")?;
        let mut create = CreatePaymentIntent::new(params.amount, currency);
        create.customer = Some(parse_id(&params.customer, "customer")?);
        create.description = params.description.as_deref();
        create.metadata = Some(params.metadata.clone());

        let intent = self
            .send("create_payment_intent", || {
                PaymentIntent::create(&client, create.clone())
            })
            .await?;
        into_gateway(&intent)
    }

    #[instrument(skip(self, params, key))]
    async fn refund(
        &self,
        params: &RefundParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayRefund> {
        if params.payment_intent.is_none() && params.charge.is_none() {
            return Err(BillingError::Validation(
                "refund needs a payment intent or a charge".to_string(),
            ));
        }

        let client = self.idempotent(key);
        let mut create = CreateRefund::new();
        create.payment_intent = parse_optional_id::<PaymentIntentId>(
            params.payment_intent.as_deref(),
            "payment intent",
        )?;
        create.charge = parse_optional_id::<ChargeId>(params.charge.as_deref(), "charge")?;
        create.amount = params.amount;
        create.reason = params
            .reason
            .as_deref()
            .map(|reason| wire(reason, "refund reason"))
            .transpose()?;

        let refund = self
            .send("refund", || Refund::create(&client, create.clone()))
            .await?;
        into_gateway(&refund)
    }

    #[instrument(skip(self))]
    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        let id: PaymentMethodId = parse_id(payment_method_id, "payment method")?;
        let customer: CustomerId = parse_id(customer_id, "customer")?;

        let method = self
            .send("attach_payment_method", || {
                PaymentMethod::attach(
                    &self.client,
                    &id,
                    AttachPaymentMethod {
                        customer: customer.clone(),
                    },
                )
            })
            .await?;
        into_gateway(&method)
    }

    #[instrument(skip(self))]
    async fn detach_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        let id: PaymentMethodId = parse_id(payment_method_id, "payment method")?;
        let method = self
            .send("detach_payment_method", || {
                PaymentMethod::detach(&self.client, &id)
            })
            .await?;
        into_gateway(&method)
    }

    #[instrument(skip(self))]
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<GatewayPaymentMethod>> {
        let mut list = ListPaymentMethods::new();
        list.customer = Some(parse_id(customer_id, "customer")?);
        list.type_ = Some(PaymentMethodTypeFilter::Card);

        let methods = self
            .send("list_payment_methods", || {
                PaymentMethod::list(&self.client, &list)
            })
            .await?;
        let page: Page<GatewayPaymentMethod> = into_gateway(&methods)?;
        Ok(page.data)
    }

    #[instrument(skip(self))]
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<GatewayCustomer> {
        let id: CustomerId = parse_id(customer_id, "customer")?;
        let method: PaymentMethodId = parse_id(payment_method_id, "payment method")?;
        let mut update = UpdateCustomer::new();
        update.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(method.to_string()),
            ..Default::default()
        });

        let customer = self
            .send("set_default_payment_method", || {
                Customer::update(&self.client, &id, update.clone())
            })
            .await?;
        into_gateway(&customer)
    }

    #[instrument(skip(self, params, key))]
    async fn create_coupon(
        &self,
        params: &CouponParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayCoupon> {
        if params.percent_off.is_none() == params.amount_off.is_none() {
            return Err(BillingError::Validation(
                "coupon needs exactly one of percent_off or amount_off".to_string(),
            ));
        }

        let client = self.idempotent(key);
        let mut create = CreateCoupon::new();
        create.name = params.name.as_deref();
        create.percent_off = params.percent_off;
        create.amount_off = params.amount_off;
        create.currency = params
            .currency
            .as_deref()
            .map(|currency| wire(&currency.to_lowercase(), "currency"))
            .transpose()?;
        create.duration = Some(wire(&params.duration, "coupon duration")?);
        create.duration_in_months = params.duration_in_months.map(i64::from);

        let coupon = self
            .send("create_coupon", || Coupon::create(&client, create.clone()))
            .await?;
        into_gateway(&coupon)
    }

    #[instrument(skip(self, params))]
    async fn preview_invoice(&self, params: &InvoicePreviewParams) -> BillingResult<GatewayInvoice> {
        debug!(
            customer = %params.customer,
            subscription = %params.subscription,
            new_price_id = %params.new_price_id,
            "Requesting proration preview"
        );

        let form = PreviewForm {
            customer: &params.customer,
            subscription: &params.subscription,
            subscription_details: PreviewDetails {
                items: vec![PreviewItem {
                    id: &params.item_id,
                    price: &params.new_price_id,
                }],
                proration_behavior: "create_prorations",
                proration_date: params.proration_date,
            },
        };

        self.send("preview_invoice", || {
            self.client
                .post_form::<GatewayInvoice, _>("/invoices/create_preview", &form)
        })
        .await
    }

    #[instrument(skip(self, params, key))]
    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayInvoice> {
        let client = self.idempotent(key);
        let mut create = CreateInvoice::new();
        create.customer = Some(parse_id(&params.customer, "customer")?);
        create.subscription =
            parse_optional_id::<SubscriptionId>(params.subscription.as_deref(), "subscription")?;
        create.pending_invoice_items_behavior = Some(wire("include", "pending item behavior")?);
        create.auto_advance = Some(false);
        create.description = params.description.as_deref();
        create.metadata = Some(params.metadata.clone());

        let invoice = self
            .send("create_invoice", || Invoice::create(&client, create.clone()))
            .await?;
        into_gateway(&invoice)
    }

    #[instrument(skip(self))]
    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
        let id: InvoiceId = parse_id(invoice_id, "invoice")?;
        let invoice = self
            .send("finalize_invoice", || {
                Invoice::finalize(&self.client, &id, Default::default())
            })
            .await?;
        into_gateway(&invoice)
    }

    #[instrument(skip(self, key))]
    async fn pay_invoice(
        &self,
        invoice_id: &str,
        key: &IdempotencyKey,
    ) -> BillingResult<GatewayInvoice> {
        let id: InvoiceId = parse_id(invoice_id, "invoice")?;
        let client = self.idempotent(key);
        let path = format!("/invoices/{id}/pay");

        self.send("pay_invoice", || {
            client.post_form::<GatewayInvoice, _>(&path, NoParams {})
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        let id: InvoiceId = parse_id(invoice_id, "invoice")?;
        self.send("delete_invoice", || Invoice::delete(&self.client, &id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_subscriptions(
        &self,
        params: &ListParams,
    ) -> BillingResult<Page<GatewaySubscription>> {
        let mut list = ListSubscriptions::new();
        list.limit = Some(u64::from(params.limit));
        list.customer = parse_optional_id(params.customer.as_deref(), "customer")?;
        list.starting_after = parse_optional_id(params.starting_after.as_deref(), "subscription")?;
        list.status = Some(SubscriptionStatusFilter::All);

        let page = self
            .send("list_subscriptions", || Subscription::list(&self.client, &list))
            .await?;
        into_gateway(&page)
    }

    #[instrument(skip(self))]
    async fn list_customers(&self, params: &ListParams) -> BillingResult<Page<GatewayCustomer>> {
        let mut list = ListCustomers::new();
        list.limit = Some(u64::from(params.limit));
        list.starting_after = parse_optional_id(params.starting_after.as_deref(), "customer")?;

        let page = self
            .send("list_customers", || Customer::list(&self.client, &list))
            .await?;
        into_gateway(&page)
    }

    #[instrument(skip(self))]
    async fn list_invoices(&self, params: &ListParams) -> BillingResult<Page<GatewayInvoice>> {
        let mut list = ListInvoices::new();
        list.limit = Some(u64::from(params.limit));
        list.customer = parse_optional_id(params.customer.as_deref(), "customer")?;
        list.starting_after = parse_optional_id(params.starting_after.as_deref(), "invoice")?;

        let page = self
            .send("list_invoices", || Invoice::list(&self.client, &list))
            .await?;
        into_gateway(&page)
    }

    #[instrument(skip(self))]
    async fn list_charges(&self, params: &ListParams) -> BillingResult<Page<GatewayCharge>> {
        let mut list = ListCharges::new();
        list.limit = Some(u64::from(params.limit));
        list.customer = parse_optional_id(params.customer.as_deref(), "customer")?;
        list.starting_after = parse_optional_id(params.starting_after.as_deref(), "charge")?;

        let page = self
            .send("list_charges", || ::stripe::Charge::list(&self.client, &list))
            .await?;
        into_gateway(&page)
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> BillingResult<GatewayEvent> {
        signature::verify(
            payload,
            signature,
            self.webhook_secret.as_deref().unwrap_or_default(),
            self.tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        GatewayEvent::from_json(payload)
    }
}
