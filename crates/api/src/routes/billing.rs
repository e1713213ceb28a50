//! Plan changes requested by the CRM on behalf of a user

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crm_billing::{IdempotencyKey, PlanChangeOutcome, ProrationSummary};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Names one plan change. Resending the same value retries that change.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
}

impl PlanChangeRequest {
    fn plan_id(&self) -> ApiResult<&str> {
        let plan_id = self.plan_id.trim();
        if plan_id.is_empty() {
            return Err(ApiError::BadRequest("plan_id is required".to_string()));
        }
        Ok(plan_id)
    }
}

/// Current-period cost of moving to another plan. Nothing is changed.
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    Json(request): Json<PlanChangeRequest>,
) -> ApiResult<Json<ProrationSummary>> {
    let summary = state
        .billing
        .proration
        .preview(&subscription_id, request.plan_id()?)
        .await?;
    Ok(Json(summary))
}

/// Client-supplied request id, or a fresh one when the header is absent
fn request_id(headers: &HeaderMap) -> ApiResult<String> {
    match headers.get(IDEMPOTENCY_HEADER) {
        Some(value) => {
            let value = value
                .to_str()
                .map(str::trim)
                .map_err(|_| ApiError::BadRequest("invalid Idempotency-Key header".to_string()))?;
            if value.is_empty() {
                return Err(ApiError::BadRequest(
                    "Idempotency-Key header is empty".to_string(),
                ));
            }
            Ok(value.to_string())
        }
        None => Ok(IdempotencyKey::generate().as_str().to_string()),
    }
}

/// Switch plans and charge the proration immediately
pub async fn change_plan(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeOutcome>> {
    let plan_id = request.plan_id()?;
    let request_id = request_id(&headers)?;
    tracing::info!(
        subscription_id = %subscription_id,
        plan_id = %plan_id,
        request_id = %request_id,
        "Plan change requested"
    );

    let outcome = state
        .billing
        .proration
        .change_plan(&subscription_id, plan_id, &request_id)
        .await?;
    Ok(Json(outcome))
}
