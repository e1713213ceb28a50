//! Gateway objects
//!
//! Processor-neutral shapes for the objects the reconciler consumes. Field
//! names follow the Stripe wire format, so webhook payloads and the Stripe
//! client's typed objects both deserialize into them.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Reference that may arrive as a bare id or as the expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpandableRef {
    Id(String),
    Object { id: String },
}

pub(crate) fn expandable_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ExpandableRef::deserialize(deserializer)? {
        ExpandableRef::Id(id) | ExpandableRef::Object { id } => id,
    })
}

pub(crate) fn optional_expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<ExpandableRef>::deserialize(deserializer)?.map(|r| match r {
            ExpandableRef::Id(id) | ExpandableRef::Object { id } => id,
        }),
    )
}

/// Objects listed by cursor pagination expose their id as the cursor
pub trait GatewayObject {
    fn gateway_id(&self) -> &str;
}

/// One page of a cursor-paginated list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayRecurring {
    pub interval: String,
    #[serde(default = "one")]
    pub interval_count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPrice {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub recurring: Option<GatewayRecurring>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySubscriptionItem {
    pub id: String,
    pub price: GatewayPrice,
    #[serde(default)]
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub items: Page<GatewaySubscriptionItem>,
    #[serde(default)]
    pub current_period_start: i64,
    #[serde(default)]
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewaySubscription {
    /// The first item carries the plan's price
    pub fn primary_item(&self) -> Option<&GatewaySubscriptionItem> {
        self.items.data.first()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPeriod {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayLineItem {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub price: Option<GatewayPrice>,
    #[serde(default)]
    pub period: GatewayPeriod,
    #[serde(default)]
    pub proration: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStatusTransitions {
    #[serde(default)]
    pub finalized_at: Option<i64>,
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayInvoice {
    /// Previews have no id
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub status_transitions: GatewayStatusTransitions,
    #[serde(default)]
    pub lines: Page<GatewayLineItem>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPaymentIntent {
    pub id: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub invoice: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub last_payment_error: Option<GatewayPaymentError>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub id: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub payment_intent: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub invoice: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub created: i64,
}

impl GatewayCharge {
    /// Key of the local Payment row this charge belongs to
    pub fn payment_key(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCard {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPaymentMethod {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub card: Option<GatewayCard>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayCoupon {
    pub id: String,
    #[serde(default)]
    pub percent_off: Option<f64>,
    #[serde(default)]
    pub amount_off: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub duration: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub charge: Option<String>,
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

macro_rules! impl_gateway_object {
    ($($ty:ty),+ $(,)?) => {
        $(impl GatewayObject for $ty {
            fn gateway_id(&self) -> &str {
                &self.id
            }
        })+
    };
}

impl_gateway_object!(
    GatewayCustomer,
    GatewaySubscription,
    GatewayCharge,
    GatewayPaymentIntent,
    GatewayPaymentMethod,
);

impl GatewayObject for GatewayInvoice {
    fn gateway_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}
