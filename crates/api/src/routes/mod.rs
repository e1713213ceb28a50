//! HTTP routes

pub mod admin;
pub mod billing;
pub mod webhooks;


use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth::require_service_token;
use crate::state::AppState;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/billing/subscriptions/{id}/plan/preview",
            post(billing::preview_plan_change),
        )
        .route("/billing/subscriptions/{id}/plan", post(billing::change_plan))
        .route("/admin/sync", post(admin::run_sync))
        .route("/admin/webhooks/failed", get(admin::list_failed_webhooks))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .route("/admin/invariants", get(admin::run_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
