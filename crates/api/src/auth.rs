//! Service token check for the billing and admin routes

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject the request unless it carries `Authorization: Bearer <ADMIN_API_TOKEN>`
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        tracing::warn!(path = %request.uri().path(), "Service token not configured, rejecting");
        return Err(ApiError::Unauthorized);
    };

    let authorized = extract_bearer_token(&request)
        .is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Invalid service token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
