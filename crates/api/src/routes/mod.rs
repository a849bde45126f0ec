//! HTTP routes

pub mod billing;
pub mod internal;
pub mod webhooks;


use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_auth, require_internal_access},
    state::AppState,
};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub fn create_router(state: AppState) -> Router {
    let billing_routes = Router::new()
        .route("/plan-change", post(billing::request_plan_change))
        .route("/plan-change/preview", get(billing::preview_plan_change))
        .route("/checkout", post(billing::create_checkout))
        .route("/reconcile", post(billing::reconcile))
        .route("/subscription", get(billing::get_subscription))
        .route("/transactions", get(billing::list_transactions))
        .route("/subscriptions/cancel", post(billing::cancel_subscription))
        .route("/subscriptions/resume", post(billing::resume_subscription))
        .route(
            "/subscriptions/scheduled-change",
            delete(billing::cancel_scheduled_change),
        )
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let internal_routes = Router::new()
        .route(
            "/sweeps/expire-grace-period",
            post(internal::expire_grace_period),
        )
        .route("/sweeps/activate-deferred", post(internal::activate_deferred))
        .route(
            "/sweeps/process-downgrades",
            post(internal::process_downgrades),
        )
        .route("/sweeps/release-checkouts", post(internal::release_checkouts))
        .route("/invariants", get(internal::run_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.internal_access(),
            require_internal_access,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/midtrans", post(webhooks::midtrans_notification))
        .nest("/api/billing", billing_routes)
        .nest("/internal", internal_routes)
        .with_state(state)
}
