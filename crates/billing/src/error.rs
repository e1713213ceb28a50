//! Billing errors
//!
//! Gateway failures are classified at the adapter boundary so callers can
//! decide what to retry, what to surface to the end user, and what to drop.

use thiserror::Error;

/// Billing errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// Signature mismatch, stale timestamp, or missing shared secret.
    /// Raised before the event touches the event store.
    #[error("webhook signature verification failed")]
    InvalidSignature,

    /// No BillingCustomer could be matched to the external customer
    #[error("no billing customer resolves for external customer {0}")]
    UnresolvableCustomer(String),

    /// Bad input, rejected by the gateway or by us. Not retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// Card or policy decline. Surfaced to the end user, never retried.
    #[error("payment declined: {message}")]
    Declined {
        code: Option<String>,
        message: String,
    },

    /// Network failure, rate limit or gateway 5xx. Safe to retry with backoff.
    #[error("transient gateway error: {0}")]
    Transient(String),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no plan matches {0}")]
    UnknownPlan(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// Only transient failures are eligible for internal retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Message shown to the user who initiated a plan change.
    ///
    /// Declines keep the gateway's own wording ("Your card was declined.")
    /// since that is what the user can act on.
    pub fn user_message(&self) -> String {
        match self {
            Self::Declined { message, .. } => format!("Payment declined: {message}"),
            Self::Validation(message) => message.clone(),
            Self::UnknownPlan(plan) => format!("The plan '{plan}' is not available"),
            Self::NotFound(what) => format!("{what} was not found"),
            Self::Transient(_) => {
                "The payment provider is temporarily unavailable, please try again".to_string()
            }
            _ => "Something went wrong while updating your subscription".to_string(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedPayload(e.to_string())
    }
}
