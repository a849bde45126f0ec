//! Billing error types

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::subscriptions::SubscriptionStatus;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed or missing request data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The subscription's current status does not allow the requested transition
    #[error("{message} (current status: {status})")]
    StateConflict {
        status: SubscriptionStatus,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The payment gateway rejected the call or could not be reached
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment gateway timed out")]
    GatewayTimeout,

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    /// A guarded write lost a race with another writer
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn state_conflict(status: SubscriptionStatus, message: impl Into<String>) -> Self {
        Self::StateConflict {
            status,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<GatewayError> for BillingError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Timeout => BillingError::GatewayTimeout,
            GatewayError::NotFound(order_id) => {
                BillingError::NotFound(format!("Gateway has no order {}", order_id))
            }
            other => BillingError::Gateway(other.to_string()),
        }
    }
}
