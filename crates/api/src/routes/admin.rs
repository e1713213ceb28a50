//! Operator routes: backfill, failed webhooks, replay, consistency checks

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crm_billing::{IngestOutcome, InvariantCheckSummary, SyncReport, WebhookEventRecord};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    /// Restrict the run to one gateway customer
    pub customer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Failed event without its raw payload
#[derive(Debug, Serialize)]
pub struct FailedWebhook {
    pub external_event_id: String,
    pub event_type: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: OffsetDateTime,
}

impl From<WebhookEventRecord> for FailedWebhook {
    fn from(record: WebhookEventRecord) -> Self {
        Self {
            external_event_id: record.external_event_id,
            event_type: record.event_type,
            attempts: record.attempts,
            last_error: record.last_error,
            received_at: record.received_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailedWebhooksResponse {
    pub events: Vec<FailedWebhook>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub event_id: String,
    pub outcome: IngestOutcome,
}

pub async fn run_sync(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Json<SyncReport> {
    let customer = query.customer.as_deref().filter(|c| !c.is_empty());
    let report = state.billing.sync.run(customer).await;
    Json(report)
}

pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<FailedWebhooksResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state.billing.webhooks.list_failed(limit, offset).await?;

    Ok(Json(FailedWebhooksResponse {
        events: events.into_iter().map(FailedWebhook::from).collect(),
        limit,
        offset,
    }))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ReplayResponse>> {
    tracing::info!(event_id = %event_id, "Manual webhook replay requested");
    let outcome = state.billing.webhooks.replay(&event_id).await?;
    Ok(Json(ReplayResponse { event_id, outcome }))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("consistency checks need a database".to_string()))?;
    let summary = checker.run_all_checks().await?;
    Ok(Json(summary))
}
