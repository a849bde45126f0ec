//! API error type and its HTTP rendering

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use brewtrack_billing::{BillingError, SubscriptionStatus};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    /// Current subscription status, for state conflicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    StateConflict {
        status: SubscriptionStatus,
        message: String,
    },

    /// Another request changed the same subscription first; safe to retry
    #[error("{0}")]
    Conflict(String),

    #[error("Payment gateway unavailable")]
    BadGateway(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Database error")]
    Database(String),

    #[error("Internal server error")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::StateConflict { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::StateConflict { .. } => "STATE_CONFLICT",
            Self::Conflict(_) => "CONCURRENT_MODIFICATION",
            Self::BadGateway(_) => "GATEWAY_ERROR",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::Database(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InvalidInput(msg) => Self::Validation(msg),
            BillingError::StateConflict { status, message } => {
                Self::StateConflict { status, message }
            }
            BillingError::NotFound(what) => Self::NotFound(format!("{} not found", what)),
            BillingError::Gateway(msg) => Self::BadGateway(msg),
            BillingError::GatewayTimeout => Self::BadGateway("timed out".to_string()),
            BillingError::WebhookSignatureInvalid => Self::InvalidSignature,
            BillingError::ConcurrentModification(msg) => Self::Conflict(msg),
            BillingError::Database(msg) => Self::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Details of server-side failures stay in the logs
        match &self {
            Self::Database(detail) | Self::Internal(detail) => {
                tracing::error!(error = %detail, "Internal API error");
            }
            Self::BadGateway(detail) => {
                tracing::warn!(error = %detail, "Payment gateway call failed");
            }
            _ => {}
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                status: match &self {
                    Self::StateConflict { status, .. } => Some(*status),
                    _ => None,
                },
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}
