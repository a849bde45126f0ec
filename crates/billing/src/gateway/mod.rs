//! Hosted-checkout payment gateway boundary
//!
//! The billing core depends only on [`PaymentGateway`]; the Midtrans Snap
//! client in [`midtrans`] is the production implementation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transactions::TransactionStatus;

pub mod midtrans;

pub use midtrans::MidtransGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gateway has no transaction for order {0}")]
    NotFound(String),

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Transient failures worth retrying on idempotent calls
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout | GatewayError::Http(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500,
            GatewayError::NotFound(_) | GatewayError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Http(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCustomer {
    pub tenant_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Our transaction id, used as the gateway order id
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub item_id: String,
    pub item_name: String,
    pub customer: CheckoutCustomer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutToken {
    pub token: String,
    pub redirect_url: Option<String>,
}

/// Transaction state as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatusReport {
    pub order_id: String,
    pub transaction_status: String,
    pub fraud_status: Option<String>,
    pub status_code: Option<String>,
    pub gross_amount: Option<String>,
}

impl GatewayStatusReport {
    pub fn mapped_status(&self) -> TransactionStatus {
        map_status(&self.transaction_status, self.fraud_status.as_deref())
    }
}

/// Asynchronous notification pushed by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNotification {
    pub order_id: String,
    pub status_code: String,
    pub gross_amount: String,
    pub signature_key: String,
    pub transaction_status: String,
    #[serde(default)]
    pub fraud_status: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub payment_type: Option<String>,
}

impl GatewayNotification {
    pub fn status_report(&self) -> GatewayStatusReport {
        GatewayStatusReport {
            order_id: self.order_id.clone(),
            transaction_status: self.transaction_status.clone(),
            fraud_status: self.fraud_status.clone(),
            status_code: Some(self.status_code.clone()),
            gross_amount: Some(self.gross_amount.clone()),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout. Not idempotent: never retried.
    async fn create_checkout_token(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutToken, GatewayError>;

    /// Current state of an order. `GatewayError::NotFound` when the gateway
    /// has never seen it.
    async fn transaction_status(&self, order_id: &str)
        -> Result<GatewayStatusReport, GatewayError>;

    fn verify_notification_signature(&self, notification: &GatewayNotification) -> bool;
}

/// Map a gateway status string (plus fraud verdict for card captures) onto
/// the ledger's status. Unrecognised strings stay `PENDING`.
pub fn map_status(transaction_status: &str, fraud_status: Option<&str>) -> TransactionStatus {
    match transaction_status {
        "capture" => match fraud_status {
            None | Some("accept") => TransactionStatus::Paid,
            Some("deny") => TransactionStatus::Failed,
            Some(_) => TransactionStatus::Pending,
        },
        "settlement" => TransactionStatus::Paid,
        "pending" => TransactionStatus::Pending,
        "deny" | "failure" => TransactionStatus::Failed,
        "cancel" => TransactionStatus::Cancelled,
        "expire" => TransactionStatus::Expired,
        _ => TransactionStatus::Pending,
    }
}
