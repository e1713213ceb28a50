//! API error responses
//!
//! Webhook deliveries rely on the status code: anything non-2xx makes the
//! gateway redeliver, so only failures that a retry can fix map to 5xx.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crm_billing::BillingError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid service token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m.clone()),
            Self::Billing(e) => match e {
                BillingError::InvalidSignature => {
                    (StatusCode::BAD_REQUEST, "invalid_signature", e.to_string())
                }
                BillingError::MalformedPayload(_) => {
                    (StatusCode::BAD_REQUEST, "malformed_payload", e.to_string())
                }
                BillingError::Validation(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "validation", e.user_message())
                }
                BillingError::Declined { .. } => {
                    (StatusCode::PAYMENT_REQUIRED, "payment_declined", e.user_message())
                }
                BillingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", e.user_message()),
                BillingError::UnknownPlan(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "unknown_plan", e.user_message())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        }
        (status, Json(ErrorBody { error, message })).into_response()
    }
}
