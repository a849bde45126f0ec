//! Payment gateway notification receiver

use axum::{body::Bytes, extract::State, Json};
use brewtrack_billing::{BillingError, GatewayNotification};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// `POST /api/webhooks/midtrans`
///
/// 200 once the notification is applied (or was already applied), 401 on a
/// bad signature, 404 for an unknown order, 500 otherwise so the gateway
/// retries.
pub async fn midtrans_notification(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let notification: GatewayNotification = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Malformed gateway notification");
        ApiError::Validation(format!("Invalid notification body: {}", e))
    })?;

    match state
        .billing
        .reconciliation
        .handle_notification(&notification)
        .await
    {
        Ok(outcome) => {
            tracing::info!(
                order_id = %outcome.order_id,
                status = %outcome.status,
                applied = outcome.applied,
                "Gateway notification processed"
            );
            Ok(Json(json!({ "status": "success" })))
        }
        Err(BillingError::WebhookSignatureInvalid) => {
            tracing::warn!(
                order_id = %notification.order_id,
                "Rejected gateway notification with invalid signature"
            );
            Err(ApiError::InvalidSignature)
        }
        Err(BillingError::NotFound(what)) => {
            tracing::warn!(order_id = %notification.order_id, "Notification for unknown order");
            Err(ApiError::NotFound(format!("{} not found", what)))
        }
        Err(e) => {
            tracing::error!(
                order_id = %notification.order_id,
                error = %e,
                "Failed to process gateway notification"
            );
            Err(ApiError::Internal(e.to_string()))
        }
    }
}
