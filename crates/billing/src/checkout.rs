//! Plan changes and hosted checkouts
//!
//! Every path that moves money or changes a tenant's plan on request starts
//! here. Paid paths call the gateway before persisting anything: a failed or
//! timed-out token request leaves no `PENDING` transaction behind, and the
//! caller simply starts over with a fresh order id.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::calendar::PlanInterval;
use crate::config::BillingSettings;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutCustomer, CheckoutRequest, PaymentGateway};
use crate::plans::{ChangeType, SubscriptionPlan};
use crate::proration::{calculate_proration, ProrationBreakdown};
use crate::store::{BillingStore, LedgerWrite, SubscriptionGuard, SubscriptionPatch, Transition};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::transactions::{
    ExpiredPlanChangeMeta, NewTransaction, PlanChangeMeta, RenewalMeta, ScheduledPlanChangeMeta,
    TransactionMetadata, TransactionStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveDate {
    Immediate,
    #[serde(alias = "endOfPeriod")]
    EndOfPeriod,
}

#[derive(Debug, Clone)]
pub struct PlanChangeRequest {
    pub subscription_id: Uuid,
    pub new_plan_id: Uuid,
    pub effective_date: EffectiveDate,
    pub requested_by: Option<Uuid>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutInput {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: PlanInterval,
    pub requested_by: Option<Uuid>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub interval: PlanInterval,
}

impl From<&SubscriptionPlan> for PlanSummary {
    fn from(plan: &SubscriptionPlan) -> Self {
        Self {
            id: plan.id,
            name: plan.name.clone(),
            price: plan.price,
            interval: plan.interval,
        }
    }
}

/// A hosted checkout waiting for the tenant to pay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub snap_token: String,
    pub redirect_url: Option<String>,
    pub order_id: String,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub plan_name: String,
    pub billing_cycle: PlanInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeOutcome {
    pub requires_payment: bool,
    pub change_type: ChangeType,
    pub effective_date: EffectiveDate,
    pub current_plan: PlanSummary,
    pub new_plan: PlanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout: Option<CheckoutSession>,
    /// Net proration amount; negative values are credits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prorated_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit: Option<Decimal>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub effective_at: Option<OffsetDateTime>,
    pub transaction_id: Uuid,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOptions {
    pub immediate: bool,
    pub end_of_period: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangePreview {
    pub change_type: ChangeType,
    pub current_plan: PlanSummary,
    pub new_plan: PlanSummary,
    /// The period has lapsed (or never ends): the change is a fresh purchase
    pub treated_as_new_purchase: bool,
    pub proration: Option<ProrationBreakdown>,
    /// What an immediate change would charge now
    pub amount_due_now: Decimal,
    pub credit: Decimal,
    pub options: PreviewOptions,
}

/// How a requested change will be carried out, decided from stored state only
enum ChangePlan {
    /// Period lapsed or absent: buy the target outright
    Acquisition,
    /// Live period, prorated against it
    Prorated(ProrationBreakdown),
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    settings: BillingSettings,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
        }
    }

    async fn load_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
    }

    async fn load_plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", plan_id)))
    }

    fn classify(
        sub: &Subscription,
        current: &SubscriptionPlan,
        target: &SubscriptionPlan,
        now: OffsetDateTime,
    ) -> ChangePlan {
        match sub.current_period_end {
            Some(end) if end > now => {
                calculate_proration(current.price, target.price, sub.current_period_start, end, now)
                    .map_or(ChangePlan::Acquisition, ChangePlan::Prorated)
            }
            _ => ChangePlan::Acquisition,
        }
    }

    /// Proration and available options for a change, without side effects
    pub async fn preview_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<PlanChangePreview> {
        self.preview_plan_change_at(subscription_id, new_plan_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn preview_plan_change_at(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangePreview> {
        let sub = self.load_subscription(subscription_id).await?;
        sub.ensure_plan_change_allowed(new_plan_id, now)?;
        let current = self.load_plan(sub.plan_id).await?;
        let target = self.load_plan(new_plan_id).await?;
        target.ensure_purchasable()?;

        let change_type = ChangeType::between(&current, &target);
        let preview = match Self::classify(&sub, &current, &target, now) {
            ChangePlan::Acquisition => PlanChangePreview {
                change_type,
                current_plan: PlanSummary::from(&current),
                new_plan: PlanSummary::from(&target),
                treated_as_new_purchase: true,
                proration: None,
                amount_due_now: target.price,
                credit: Decimal::ZERO,
                options: PreviewOptions {
                    immediate: true,
                    end_of_period: false,
                },
            },
            ChangePlan::Prorated(proration) => PlanChangePreview {
                change_type,
                current_plan: PlanSummary::from(&current),
                new_plan: PlanSummary::from(&target),
                treated_as_new_purchase: false,
                amount_due_now: proration.net_amount.max(Decimal::ZERO),
                credit: proration.credit(),
                proration: Some(proration),
                options: PreviewOptions {
                    immediate: true,
                    end_of_period: true,
                },
            },
        };
        Ok(preview)
    }

    pub async fn request_plan_change(
        &self,
        request: PlanChangeRequest,
    ) -> BillingResult<PlanChangeOutcome> {
        self.request_plan_change_at(request, OffsetDateTime::now_utc())
            .await
    }

    pub async fn request_plan_change_at(
        &self,
        request: PlanChangeRequest,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeOutcome> {
        let sub = self.load_subscription(request.subscription_id).await?;
        sub.ensure_plan_change_allowed(request.new_plan_id, now)?;
        let current = self.load_plan(sub.plan_id).await?;
        let target = self.load_plan(request.new_plan_id).await?;
        target.ensure_purchasable()?;

        let change_type = ChangeType::between(&current, &target);

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            from_plan = %current.name,
            to_plan = %target.name,
            change_type = %change_type,
            effective_date = ?request.effective_date,
            "Plan change requested"
        );

        match Self::classify(&sub, &current, &target, now) {
            ChangePlan::Acquisition => {
                if request.effective_date == EffectiveDate::EndOfPeriod {
                    tracing::info!(
                        tenant_id = %sub.tenant_id,
                        period_end = ?sub.current_period_end,
                        "No live period to defer to; treating the change as a purchase now"
                    );
                }
                self.change_after_lapse(&request, &sub, &current, &target, change_type, now)
                    .await
            }
            ChangePlan::Prorated(proration) => match request.effective_date {
                EffectiveDate::Immediate if proration.requires_payment() => {
                    self.change_with_payment(&request, &sub, &current, &target, change_type, proration, now)
                        .await
                }
                EffectiveDate::Immediate => {
                    self.change_with_credit(&request, &sub, &current, &target, change_type, proration, now)
                        .await
                }
                EffectiveDate::EndOfPeriod => {
                    self.schedule_change(&request, &sub, &current, &target, change_type, proration, now)
                        .await
                }
            },
        }
    }

    /// Lapsed or open-ended period: no proration. A free target activates at
    /// once; anything else is a full-price checkout.
    async fn change_after_lapse(
        &self,
        request: &PlanChangeRequest,
        sub: &Subscription,
        current: &SubscriptionPlan,
        target: &SubscriptionPlan,
        change_type: ChangeType,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeOutcome> {
        let metadata = TransactionMetadata::ExpiredPlanChange(ExpiredPlanChangeMeta {
            from_plan_id: current.id,
            to_plan_id: target.id,
            lapsed_period_end: sub.current_period_end,
            previous_status: sub.status,
            previous_intended_plan_id: sub.intended_plan_id,
        });

        if target.is_free() {
            let audit = self
                .new_transaction(sub, target, Decimal::ZERO, target.interval, metadata, request.requested_by)
                .completed(now);
            let transaction_id = audit.id;

            let transition = Transition::new("activate_free_plan", now)
                .subscription(
                    sub.id,
                    SubscriptionGuard::status_in(&[sub.status])
                        .plan(sub.plan_id)
                        .period_end(sub.current_period_end),
                    SubscriptionPatch {
                        status: Some(SubscriptionStatus::Active),
                        plan_id: Some(target.id),
                        period: Some((now, None)),
                        intended_plan_id: Some(None),
                        cancel_at_period_end: Some(false),
                    },
                )
                .ledger(LedgerWrite::SettleScheduled {
                    tenant_id: sub.tenant_id,
                    to: TransactionStatus::Cancelled,
                })
                .record(audit);
            self.commit(transition, sub).await?;

            tracing::info!(
                tenant_id = %sub.tenant_id,
                plan = %target.name,
                "Free plan activated"
            );

            return Ok(PlanChangeOutcome {
                requires_payment: false,
                change_type,
                effective_date: EffectiveDate::Immediate,
                current_plan: PlanSummary::from(current),
                new_plan: PlanSummary::from(target),
                checkout: None,
                prorated_amount: None,
                credit: None,
                effective_at: Some(now),
                transaction_id,
                subscription: self.load_subscription(sub.id).await?,
            });
        }

        let checkout = self
            .open_checkout(
                sub,
                target,
                target.price,
                target.interval,
                metadata,
                request.requested_by,
                request.customer_email.clone(),
                now,
            )
            .await?;

        Ok(PlanChangeOutcome {
            requires_payment: true,
            change_type,
            effective_date: EffectiveDate::Immediate,
            current_plan: PlanSummary::from(current),
            new_plan: PlanSummary::from(target),
            transaction_id: checkout.transaction_id,
            checkout: Some(checkout),
            prorated_amount: None,
            credit: None,
            effective_at: None,
            subscription: self.load_subscription(sub.id).await?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn change_with_payment(
        &self,
        request: &PlanChangeRequest,
        sub: &Subscription,
        current: &SubscriptionPlan,
        target: &SubscriptionPlan,
        change_type: ChangeType,
        proration: ProrationBreakdown,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeOutcome> {
        let net = proration.net_amount;
        let metadata = TransactionMetadata::PlanChange(PlanChangeMeta {
            from_plan_id: current.id,
            to_plan_id: target.id,
            change_type,
            proration,
            credit: Decimal::ZERO,
            previous_status: sub.status,
            previous_intended_plan_id: sub.intended_plan_id,
        });

        let checkout = self
            .open_checkout(
                sub,
                target,
                net,
                target.interval,
                metadata,
                request.requested_by,
                request.customer_email.clone(),
                now,
            )
            .await?;

        Ok(PlanChangeOutcome {
            requires_payment: true,
            change_type,
            effective_date: EffectiveDate::Immediate,
            current_plan: PlanSummary::from(current),
            new_plan: PlanSummary::from(target),
            transaction_id: checkout.transaction_id,
            checkout: Some(checkout),
            prorated_amount: Some(net),
            credit: None,
            effective_at: None,
            subscription: self.load_subscription(sub.id).await?,
        })
    }

    /// Nothing to pay: switch plans now and book the credit
    #[allow(clippy::too_many_arguments)]
    async fn change_with_credit(
        &self,
        request: &PlanChangeRequest,
        sub: &Subscription,
        current: &SubscriptionPlan,
        target: &SubscriptionPlan,
        change_type: ChangeType,
        proration: ProrationBreakdown,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeOutcome> {
        let net = proration.net_amount;
        let credit = proration.credit();
        let metadata = TransactionMetadata::PlanChange(PlanChangeMeta {
            from_plan_id: current.id,
            to_plan_id: target.id,
            change_type,
            proration,
            credit,
            previous_status: sub.status,
            previous_intended_plan_id: sub.intended_plan_id,
        });
        let audit = self
            .new_transaction(sub, target, Decimal::ZERO, target.interval, metadata, request.requested_by)
            .completed(now);
        let transaction_id = audit.id;

        // Free plans never expire, so moving onto one drops the period end.
        let period = target.is_free().then_some((now, None));

        let transition = Transition::new("apply_plan_change", now)
            .subscription(
                sub.id,
                SubscriptionGuard::status_in(&[sub.status])
                    .plan(sub.plan_id)
                    .period_end(sub.current_period_end),
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    plan_id: Some(target.id),
                    period,
                    intended_plan_id: Some(None),
                    cancel_at_period_end: Some(false),
                },
            )
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id: sub.tenant_id,
                to: TransactionStatus::Cancelled,
            })
            .record(audit);
        self.commit(transition, sub).await?;

        tracing::info!(
            tenant_id = %sub.tenant_id,
            from_plan = %current.name,
            to_plan = %target.name,
            credit = %credit,
            "Plan change applied without payment"
        );

        Ok(PlanChangeOutcome {
            requires_payment: false,
            change_type,
            effective_date: EffectiveDate::Immediate,
            current_plan: PlanSummary::from(current),
            new_plan: PlanSummary::from(target),
            checkout: None,
            prorated_amount: Some(net),
            credit: Some(credit),
            effective_at: Some(now),
            transaction_id,
            subscription: self.load_subscription(sub.id).await?,
        })
    }

    /// Stage the target for the period boundary. The plan itself is untouched.
    #[allow(clippy::too_many_arguments)]
    async fn schedule_change(
        &self,
        request: &PlanChangeRequest,
        sub: &Subscription,
        current: &SubscriptionPlan,
        target: &SubscriptionPlan,
        change_type: ChangeType,
        proration: ProrationBreakdown,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeOutcome> {
        let effective_at = proration.period_end;

        if let Some(previous) = sub.intended_plan_id {
            tracing::warn!(
                tenant_id = %sub.tenant_id,
                previous_intended_plan_id = %previous,
                new_intended_plan_id = %target.id,
                "Replacing an already scheduled plan change"
            );
        }

        let metadata = TransactionMetadata::ScheduledPlanChange(ScheduledPlanChangeMeta {
            from_plan_id: current.id,
            to_plan_id: target.id,
            change_type,
            effective_at,
            proration: Some(proration),
        });
        let scheduled = self
            .new_transaction(sub, target, target.price, target.interval, metadata, request.requested_by)
            .scheduled(now);
        let transaction_id = scheduled.id;

        let transition = Transition::new("schedule_plan_change", now)
            .subscription(
                sub.id,
                SubscriptionGuard::status_in(&[sub.status])
                    .plan(sub.plan_id)
                    .intended_plan(sub.intended_plan_id)
                    .period_end(sub.current_period_end),
                SubscriptionPatch {
                    intended_plan_id: Some(Some(target.id)),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .ledger(LedgerWrite::SettleScheduled {
                tenant_id: sub.tenant_id,
                to: TransactionStatus::Cancelled,
            })
            .record(scheduled);
        self.commit(transition, sub).await?;

        tracing::info!(
            tenant_id = %sub.tenant_id,
            to_plan = %target.name,
            effective_at = %effective_at,
            "Plan change scheduled for period end"
        );

        Ok(PlanChangeOutcome {
            requires_payment: false,
            change_type,
            effective_date: EffectiveDate::EndOfPeriod,
            current_plan: PlanSummary::from(current),
            new_plan: PlanSummary::from(target),
            checkout: None,
            prorated_amount: None,
            credit: None,
            effective_at: Some(effective_at),
            transaction_id,
            subscription: self.load_subscription(sub.id).await?,
        })
    }

    /// Renewal of the current plan after it lapsed, or outright purchase of a
    /// plan from the free tier.
    pub async fn create_checkout(&self, input: CheckoutInput) -> BillingResult<CheckoutSession> {
        self.create_checkout_at(input, OffsetDateTime::now_utc())
            .await
    }

    pub async fn create_checkout_at(
        &self,
        input: CheckoutInput,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutSession> {
        let sub = self
            .store
            .get_subscription_by_tenant(input.tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription for tenant {}", input.tenant_id))
            })?;
        let target = self.load_plan(input.plan_id).await?;
        target.ensure_purchasable()?;

        if sub.status == SubscriptionStatus::PendingCheckout {
            return Err(BillingError::state_conflict(
                sub.status,
                "A checkout is already in progress",
            ));
        }
        if target.is_free() {
            return Err(BillingError::InvalidInput(
                "The free plan does not need a checkout".to_string(),
            ));
        }

        let live = sub.current_period_end.is_some_and(|end| end > now);
        if live && sub.plan_id == target.id {
            return Err(BillingError::state_conflict(
                sub.status,
                "Subscription is still active on this plan; renew once the period ends",
            ));
        }
        if live {
            return Err(BillingError::state_conflict(
                sub.status,
                "Use a plan change to switch plans during an active period",
            ));
        }

        let amount = target.price_for_cycle(input.billing_cycle)?;
        let metadata = TransactionMetadata::Renewal(RenewalMeta {
            from_plan_id: sub.plan_id,
            to_plan_id: target.id,
            billing_cycle: input.billing_cycle,
            previous_status: sub.status,
            previous_intended_plan_id: sub.intended_plan_id,
        });

        self.open_checkout(
            &sub,
            &target,
            amount,
            input.billing_cycle,
            metadata,
            input.requested_by,
            input.customer_email,
            now,
        )
        .await
    }

    fn new_transaction(
        &self,
        sub: &Subscription,
        plan: &SubscriptionPlan,
        amount: Decimal,
        billing_cycle: PlanInterval,
        metadata: TransactionMetadata,
        user_id: Option<Uuid>,
    ) -> NewTransaction {
        NewTransaction {
            tenant_id: sub.tenant_id,
            user_id,
            subscription_plan_id: plan.id,
            amount,
            currency: self.settings.currency.clone(),
            billing_cycle,
            metadata,
        }
    }

    /// Request a hosted checkout, then record the `PENDING` transaction and put
    /// the subscription on hold in one transition.
    #[allow(clippy::too_many_arguments)]
    async fn open_checkout(
        &self,
        sub: &Subscription,
        target: &SubscriptionPlan,
        amount: Decimal,
        billing_cycle: PlanInterval,
        metadata: TransactionMetadata,
        user_id: Option<Uuid>,
        customer_email: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutSession> {
        // Whole currency units: the ledger records what the gateway charges.
        let charge = amount.ceil();
        let tx = self
            .new_transaction(sub, target, charge, billing_cycle, metadata, user_id)
            .pending(now);
        let order_id = tx.payment_gateway_id.clone().unwrap_or_else(|| tx.id.to_string());

        let request = CheckoutRequest {
            order_id: order_id.clone(),
            amount: charge,
            currency: self.settings.currency.clone(),
            item_id: target.id.to_string(),
            item_name: format!("{} ({})", target.name, billing_cycle),
            customer: CheckoutCustomer {
                tenant_id: sub.tenant_id.to_string(),
                email: customer_email,
            },
        };

        let token = match self.gateway.create_checkout_token(&request).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(
                    tenant_id = %sub.tenant_id,
                    order_id = %order_id,
                    error = %e,
                    "Checkout token request failed; nothing was recorded"
                );
                return Err(e.into());
            }
        };

        let transaction_id = tx.id;
        let transition = Transition::new("open_checkout", now)
            .subscription(
                sub.id,
                SubscriptionGuard::status_in(&[sub.status])
                    .plan(sub.plan_id)
                    .period_end(sub.current_period_end),
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::PendingCheckout),
                    intended_plan_id: Some(Some(target.id)),
                    ..Default::default()
                },
            )
            .record(tx);
        self.commit(transition, sub).await?;

        tracing::info!(
            tenant_id = %sub.tenant_id,
            order_id = %order_id,
            amount = %charge,
            plan = %target.name,
            "Checkout opened"
        );

        Ok(CheckoutSession {
            snap_token: token.token,
            redirect_url: token.redirect_url,
            order_id,
            transaction_id,
            amount: charge,
            plan_name: target.name.clone(),
            billing_cycle,
        })
    }

    async fn commit(&self, transition: Transition, sub: &Subscription) -> BillingResult<()> {
        let reason = transition.reason;
        if self.store.attempt_transition(transition).await? {
            return Ok(());
        }

        tracing::warn!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            reason,
            "Subscription changed while the request was processed"
        );
        let current = self.load_subscription(sub.id).await?;
        Err(BillingError::ConcurrentModification(format!(
            "Subscription changed concurrently (now {}); reload and try again",
            current.status
        )))
    }
}
