//! Scheduler-facing endpoints under `/internal`, behind the shared secret

use axum::{extract::State, Json};
use brewtrack_billing::{InvariantCheckSummary, SweepReport};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// `POST /internal/sweeps/expire-grace-period`
pub async fn expire_grace_period(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.billing.sweeps.expire_grace_periods().await?))
}

/// `POST /internal/sweeps/activate-deferred`
pub async fn activate_deferred(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.billing.sweeps.activate_deferred_changes().await?))
}

/// `POST /internal/sweeps/process-downgrades`
pub async fn process_downgrades(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.billing.sweeps.process_scheduled_downgrades().await?))
}

/// `POST /internal/sweeps/release-checkouts`
pub async fn release_checkouts(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.billing.sweeps.release_abandoned_checkouts().await?))
}

/// `GET /internal/invariants`
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::Internal("invariant checks need a database".to_string()))?;

    let summary = checker.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Billing invariant violations detected"
        );
    }
    Ok(Json(summary))
}
