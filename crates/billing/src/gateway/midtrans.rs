//! Midtrans Snap client
//!
//! Checkout tokens come from the Snap API; order status from the Core API.
//! Notifications are authenticated by
//! `hex(SHA-512(order_id + status_code + gross_amount + server_key))`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    CheckoutRequest, CheckoutToken, GatewayError, GatewayNotification, GatewayStatusReport,
    PaymentGateway,
};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

/// Retries after the first status query attempt
const STATUS_RETRIES: usize = 2;

#[derive(Debug, Serialize)]
struct SnapTransactionDetails<'a> {
    order_id: &'a str,
    gross_amount: i64,
}

#[derive(Debug, Serialize)]
struct SnapItem<'a> {
    id: &'a str,
    price: i64,
    quantity: u32,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct SnapCustomer<'a> {
    first_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SnapCallbacks<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    finish: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unfinish: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SnapExpiry {
    unit: &'static str,
    duration: u32,
}

#[derive(Debug, Serialize)]
struct SnapRequest<'a> {
    transaction_details: SnapTransactionDetails<'a>,
    item_details: Vec<SnapItem<'a>>,
    customer_details: SnapCustomer<'a>,
    callbacks: SnapCallbacks<'a>,
    expiry: SnapExpiry,
}

#[derive(Debug, Deserialize)]
struct SnapResponse {
    token: String,
    redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MidtransErrorBody {
    #[serde(default)]
    error_messages: Vec<String>,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status_code: String,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    transaction_status: Option<String>,
    #[serde(default)]
    fraud_status: Option<String>,
    #[serde(default)]
    gross_amount: Option<String>,
}

/// Amount charged at the gateway: whole currency units, rounded up
pub fn gross_amount(amount: Decimal) -> Result<i64, GatewayError> {
    amount
        .ceil()
        .to_i64()
        .filter(|value| *value > 0)
        .ok_or_else(|| GatewayError::Decode(format!("amount {} cannot be charged", amount)))
}

/// Signature the gateway attaches to notifications for these fields
pub fn compute_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<MidtransErrorBody>(body) {
        Ok(parsed) if !parsed.error_messages.is_empty() => parsed.error_messages.join("; "),
        Ok(MidtransErrorBody {
            status_message: Some(message),
            ..
        }) => message,
        _ => body.chars().take(200).collect(),
    }
}

#[derive(Clone)]
pub struct MidtransGateway {
    client: Client,
    config: GatewayConfig,
}

impl MidtransGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn fetch_status(&self, order_id: &str) -> Result<GatewayStatusReport, GatewayError> {
        let url = format!("{}/v2/{}/status", self.config.api_url, order_id);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.server_key, Some(""))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(order_id.to_string()));
        }
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let parsed: StatusResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;

        // The Core API reports unknown orders in the body with HTTP 200.
        if parsed.status_code == "404" {
            return Err(GatewayError::NotFound(order_id.to_string()));
        }

        let transaction_status = parsed.transaction_status.ok_or_else(|| {
            GatewayError::Decode(format!(
                "status response without transaction_status: {}",
                parsed.status_message.unwrap_or_default()
            ))
        })?;

        Ok(GatewayStatusReport {
            order_id: parsed.order_id.unwrap_or_else(|| order_id.to_string()),
            transaction_status,
            fraud_status: parsed.fraud_status,
            status_code: Some(parsed.status_code),
            gross_amount: parsed.gross_amount,
        })
    }
}

#[async_trait]
impl PaymentGateway for MidtransGateway {
    async fn create_checkout_token(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutToken, GatewayError> {
        let amount = gross_amount(request.amount)?;
        let body = SnapRequest {
            transaction_details: SnapTransactionDetails {
                order_id: &request.order_id,
                gross_amount: amount,
            },
            item_details: vec![SnapItem {
                id: &request.item_id,
                price: amount,
                quantity: 1,
                name: &request.item_name,
            }],
            customer_details: SnapCustomer {
                first_name: &request.customer.tenant_id,
                email: request.customer.email.as_deref(),
            },
            callbacks: SnapCallbacks {
                finish: self.config.finish_url.as_deref(),
                unfinish: self.config.pending_url.as_deref(),
                error: self.config.error_url.as_deref(),
            },
            expiry: SnapExpiry {
                unit: "minute",
                duration: self.config.checkout_expiry_minutes,
            },
        };

        let url = format!("{}/snap/v1/transactions", self.config.snap_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.server_key, Some(""))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = error_message(&text);
            tracing::error!(
                order_id = %request.order_id,
                status = status.as_u16(),
                message = %message,
                "Snap checkout creation failed"
            );
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SnapResponse =
            serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))?;

        tracing::info!(
            order_id = %request.order_id,
            gross_amount = amount,
            currency = %request.currency,
            "Snap checkout created"
        );

        Ok(CheckoutToken {
            token: parsed.token,
            redirect_url: parsed.redirect_url,
        })
    }

    async fn transaction_status(
        &self,
        order_id: &str,
    ) -> Result<GatewayStatusReport, GatewayError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(STATUS_RETRIES);

        RetryIf::spawn(
            strategy,
            || self.fetch_status(order_id),
            |e: &GatewayError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(order_id = %order_id, error = %e, "Retrying gateway status query");
                }
                retry
            },
        )
        .await
    }

    fn verify_notification_signature(&self, notification: &GatewayNotification) -> bool {
        let expected = compute_signature(
            &notification.order_id,
            &notification.status_code,
            &notification.gross_amount,
            &self.config.server_key,
        );
        let provided = notification.signature_key.trim().to_ascii_lowercase();
        let valid: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();

        if !valid {
            tracing::warn!(
                order_id = %notification.order_id,
                "Gateway notification signature mismatch"
            );
        }
        valid
    }
}
