//! HTTP client for the API's internal sweep endpoints

use brewtrack_shared::INTERNAL_ACCESS_HEADER;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::WorkerConfig;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("internal endpoint rejected the access secret")]
    Unauthorized,
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    ExpireGracePeriod,
    ActivateDeferred,
    ProcessDowngrades,
    ReleaseCheckouts,
}

impl Sweep {
    pub const ALL: [Sweep; 4] = [
        Sweep::ExpireGracePeriod,
        Sweep::ActivateDeferred,
        Sweep::ProcessDowngrades,
        Sweep::ReleaseCheckouts,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Sweep::ExpireGracePeriod => "/internal/sweeps/expire-grace-period",
            Sweep::ActivateDeferred => "/internal/sweeps/activate-deferred",
            Sweep::ProcessDowngrades => "/internal/sweeps/process-downgrades",
            Sweep::ReleaseCheckouts => "/internal/sweeps/release-checkouts",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sweep::ExpireGracePeriod => "expire_grace_period",
            Sweep::ActivateDeferred => "activate_deferred",
            Sweep::ProcessDowngrades => "process_downgrades",
            Sweep::ReleaseCheckouts => "release_checkouts",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepFailure {
    pub id: Uuid,
    pub error: String,
}

/// What one sweep run reports back
#[derive(Debug, Clone, Deserialize)]
pub struct SweepSummary {
    pub sweep: String,
    pub processed: usize,
    #[serde(default)]
    pub skipped: usize,
    pub failed: usize,
    #[serde(default)]
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub severity: String,
    pub description: String,
    #[serde(default, rename = "tenantIds")]
    pub tenant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantSummary {
    pub checks_run: usize,
    pub checks_failed: usize,
    pub healthy: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

#[derive(Clone)]
pub struct SweepClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl SweepClient {
    pub fn new(config: &WorkerConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            secret: config.internal_access_secret.clone(),
        })
    }

    pub async fn run_sweep(&self, sweep: Sweep) -> Result<SweepSummary, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, sweep.path()))
            .header(INTERNAL_ACCESS_HEADER, &self.secret)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn check_invariants(&self) -> Result<InvariantSummary, ClientError> {
        let response = self
            .http
            .get(format!("{}/internal/invariants", self.base_url))
            .header(INTERNAL_ACCESS_HEADER, &self.secret)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Log a sweep result: counts at info, each failure at error
pub fn log_sweep_summary(summary: &SweepSummary) {
    tracing::info!(
        sweep = %summary.sweep,
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Sweep complete"
    );
    for failure in &summary.failures {
        tracing::error!(
            sweep = %summary.sweep,
            id = %failure.id,
            error = %failure.error,
            "Sweep item failed"
        );
    }
}

pub fn log_invariant_summary(summary: &InvariantSummary) {
    if summary.healthy {
        tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        return;
    }
    tracing::warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations detected"
    );
    for violation in &summary.violations {
        tracing::warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            tenants = ?violation.tenant_ids,
            "{}",
            violation.description
        );
    }
}
