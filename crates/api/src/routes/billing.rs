//! Tenant-facing billing endpoints under `/api/billing`
//!
//! Every handler resolves the record it acts on, then checks it belongs to
//! the caller's tenant. Mutations additionally need a billing-manager role.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Extension, Json,
};
use brewtrack_billing::{
    BillingStore, CheckoutInput, CheckoutSession, EffectiveDate, PlanChangeOutcome,
    PlanChangePreview, PlanChangeRequest, PlanInterval, PlanSummary, ReconcileOutcome,
    Subscription, Transaction,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

fn default_effective_date() -> EffectiveDate {
    EffectiveDate::Immediate
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanChangeBody {
    pub subscription_id: Uuid,
    pub new_plan_id: Uuid,
    #[serde(default = "default_effective_date")]
    pub effective_date: EffectiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PreviewQuery {
    pub subscription_id: Uuid,
    pub new_plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CheckoutBody {
    pub plan_id: Uuid,
    pub billing_cycle: PlanInterval,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconcileBody {
    pub order_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionsQuery {
    pub limit: Option<i64>,
}

/// Plan change result with the checkout fields lifted to the top level
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(flatten)]
    pub outcome: PlanChangeOutcome,
}

impl From<PlanChangeOutcome> for PlanChangeResponse {
    fn from(outcome: PlanChangeOutcome) -> Self {
        let checkout = outcome.checkout.as_ref();
        Self {
            snap_token: checkout.map(|c| c.snap_token.clone()),
            redirect_url: checkout.and_then(|c| c.redirect_url.clone()),
            order_id: checkout.map(|c| c.order_id.clone()),
            amount: checkout.map(|c| c.amount),
            outcome,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub plan: PlanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intended_plan: Option<PlanSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsResponse {
    pub transactions: Vec<Transaction>,
}

/// `POST /api/billing/plan-change`
pub async fn request_plan_change(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<PlanChangeBody>, JsonRejection>,
) -> ApiResult<Json<PlanChangeResponse>> {
    let Json(body) = payload?;
    user.require_billing_manager()?;

    let sub = state.billing.subscriptions.get(body.subscription_id).await?;
    user.require_tenant(sub.tenant_id)?;

    let outcome = state
        .billing
        .checkout
        .request_plan_change(PlanChangeRequest {
            subscription_id: sub.id,
            new_plan_id: body.new_plan_id,
            effective_date: body.effective_date,
            requested_by: Some(user.user_id),
            customer_email: user.email.clone(),
        })
        .await?;

    Ok(Json(outcome.into()))
}

/// `GET /api/billing/plan-change/preview`
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<PreviewQuery>, QueryRejection>,
) -> ApiResult<Json<PlanChangePreview>> {
    let Query(query) = query?;

    let sub = state.billing.subscriptions.get(query.subscription_id).await?;
    user.require_tenant(sub.tenant_id)?;

    let preview = state
        .billing
        .checkout
        .preview_plan_change(sub.id, query.new_plan_id)
        .await?;
    Ok(Json(preview))
}

/// `POST /api/billing/checkout`: renewal or outright purchase
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<CheckoutBody>, JsonRejection>,
) -> ApiResult<Json<CheckoutSession>> {
    let Json(body) = payload?;
    user.require_billing_manager()?;

    let session = state
        .billing
        .checkout
        .create_checkout(CheckoutInput {
            tenant_id: user.tenant_id,
            plan_id: body.plan_id,
            billing_cycle: body.billing_cycle,
            requested_by: Some(user.user_id),
            customer_email: user.email.clone(),
        })
        .await?;
    Ok(Json(session))
}

/// `POST /api/billing/reconcile`: poll the gateway for one of the tenant's orders
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<ReconcileBody>, JsonRejection>,
) -> ApiResult<Json<ReconcileOutcome>> {
    let Json(body) = payload?;
    let order_id = body.order_id.trim();
    if order_id.is_empty() {
        return Err(ApiError::Validation("orderId must not be empty".to_string()));
    }

    let tx = state
        .billing
        .store()
        .get_transaction_by_gateway_id(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {} not found", order_id)))?;
    user.require_tenant(tx.tenant_id)?;

    let outcome = state.billing.reconciliation.reconcile(order_id).await?;
    Ok(Json(outcome))
}

/// `GET /api/billing/subscription`
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .get_for_tenant(user.tenant_id)
        .await?;

    let store = state.billing.store();
    let plan = store.get_plan(subscription.plan_id).await?.ok_or_else(|| {
        ApiError::Internal(format!(
            "subscription {} references missing plan {}",
            subscription.id, subscription.plan_id
        ))
    })?;
    let intended_plan = match subscription.intended_plan_id {
        Some(id) => store.get_plan(id).await?.map(|p| PlanSummary::from(&p)),
        None => None,
    };

    Ok(Json(SubscriptionResponse {
        subscription,
        plan: PlanSummary::from(&plan),
        intended_plan,
    }))
}

/// `GET /api/billing/transactions`
pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<TransactionsQuery>, QueryRejection>,
) -> ApiResult<Json<TransactionsResponse>> {
    let Query(query) = query?;
    let transactions = state
        .billing
        .transactions(user.tenant_id, query.limit)
        .await?;
    Ok(Json(TransactionsResponse { transactions }))
}

/// `POST /api/billing/subscriptions/cancel`
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    user.require_billing_manager()?;
    let sub = state
        .billing
        .subscriptions
        .cancel_at_period_end(user.tenant_id)
        .await?;
    Ok(Json(sub))
}

/// `POST /api/billing/subscriptions/resume`
pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    user.require_billing_manager()?;
    let sub = state.billing.subscriptions.resume(user.tenant_id).await?;
    Ok(Json(sub))
}

/// `DELETE /api/billing/subscriptions/scheduled-change`
pub async fn cancel_scheduled_change(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Subscription>> {
    user.require_billing_manager()?;
    let sub = state
        .billing
        .subscriptions
        .cancel_scheduled_change(user.tenant_id)
        .await?;
    Ok(Json(sub))
}
