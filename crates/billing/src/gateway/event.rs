//! Typed webhook events

use std::fmt;

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::gateway::types::{
    GatewayCharge, GatewayCheckoutSession, GatewayCustomer, GatewayInvoice, GatewayPaymentIntent,
    GatewaySubscription,
};

/// Event types the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    CheckoutSessionCompleted,
    CustomerCreated,
    CustomerUpdated,
    CustomerDeleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoiceCreated,
    InvoiceFinalized,
    InvoicePaid,
    InvoicePaymentFailed,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    ChargeRefunded,
    Unknown(String),
}

impl EventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.created" => Self::CustomerCreated,
            "customer.updated" => Self::CustomerUpdated,
            "customer.deleted" => Self::CustomerDeleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.created" => Self::InvoiceCreated,
            "invoice.finalized" => Self::InvoiceFinalized,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => Self::PaymentIntentFailed,
            "charge.refunded" => Self::ChargeRefunded,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::CustomerCreated => "customer.created",
            Self::CustomerUpdated => "customer.updated",
            Self::CustomerDeleted => "customer.deleted",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoiceCreated => "invoice.created",
            Self::InvoiceFinalized => "invoice.finalized",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::PaymentIntentSucceeded => "payment_intent.succeeded",
            Self::PaymentIntentFailed => "payment_intent.payment_failed",
            Self::ChargeRefunded => "charge.refunded",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The object carried in `data.object`
#[derive(Debug, Clone)]
pub enum EventObject {
    CheckoutSession(GatewayCheckoutSession),
    Customer(GatewayCustomer),
    Subscription(GatewaySubscription),
    Invoice(GatewayInvoice),
    PaymentIntent(GatewayPaymentIntent),
    Charge(GatewayCharge),
    /// Events we acknowledge without acting on
    Other(serde_json::Value),
}

/// Verified webhook event
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: EventType,
    /// Unix timestamp at which the gateway created the event
    pub created: i64,
    pub object: EventObject,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    created: i64,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

impl GatewayEvent {
    /// Parse a raw notification body. Signature checks happen before this.
    pub fn from_json(payload: &str) -> BillingResult<Self> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        let event_type = EventType::parse(&envelope.type_);
        let raw = envelope.data.object;

        let object = match &event_type {
            EventType::CheckoutSessionCompleted => {
                EventObject::CheckoutSession(serde_json::from_value(raw)?)
            }
            EventType::CustomerCreated | EventType::CustomerUpdated | EventType::CustomerDeleted => {
                EventObject::Customer(serde_json::from_value(raw)?)
            }
            EventType::SubscriptionCreated
            | EventType::SubscriptionUpdated
            | EventType::SubscriptionDeleted => {
                EventObject::Subscription(serde_json::from_value(raw)?)
            }
            EventType::InvoiceCreated
            | EventType::InvoiceFinalized
            | EventType::InvoicePaid
            | EventType::InvoicePaymentFailed => EventObject::Invoice(serde_json::from_value(raw)?),
            EventType::PaymentIntentSucceeded | EventType::PaymentIntentFailed => {
                EventObject::PaymentIntent(serde_json::from_value(raw)?)
            }
            EventType::ChargeRefunded => EventObject::Charge(serde_json::from_value(raw)?),
            EventType::Unknown(_) => EventObject::Other(raw),
        };

        if envelope.id.is_empty() {
            return Err(BillingError::MalformedPayload("event id is empty".to_string()));
        }

        Ok(Self {
            id: envelope.id,
            event_type,
            created: envelope.created,
            object,
        })
    }

    pub fn expect_subscription(&self) -> BillingResult<&GatewaySubscription> {
        match &self.object {
            EventObject::Subscription(s) => Ok(s),
            _ => Err(self.mismatch("subscription")),
        }
    }

    pub fn expect_invoice(&self) -> BillingResult<&GatewayInvoice> {
        match &self.object {
            EventObject::Invoice(i) => Ok(i),
            _ => Err(self.mismatch("invoice")),
        }
    }

    pub fn expect_payment_intent(&self) -> BillingResult<&GatewayPaymentIntent> {
        match &self.object {
            EventObject::PaymentIntent(p) => Ok(p),
            _ => Err(self.mismatch("payment intent")),
        }
    }

    pub fn expect_charge(&self) -> BillingResult<&GatewayCharge> {
        match &self.object {
            EventObject::Charge(c) => Ok(c),
            _ => Err(self.mismatch("charge")),
        }
    }

    fn mismatch(&self, expected: &str) -> BillingError {
        BillingError::MalformedPayload(format!(
            "event {} of type {} does not carry a {expected}",
            self.id, self.event_type
        ))
    }
}
