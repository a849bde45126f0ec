// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Exercises the services end to end against the in-memory store and a
//! scripted gateway:
//! - Plan changes (BILL-PC01 to BILL-PC11)
//! - Checkout for renewal and purchase (BILL-CO01 to BILL-CO05)
//! - Payment confirmation (BILL-W01 to BILL-W10)
//! - Sweeps (BILL-SW01 to BILL-SW09)
//! - Tenant subscription operations (BILL-S01 to BILL-S04)

#[cfg(test)]
mod harness {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use time::macros::datetime;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::calendar::PlanInterval;
    use crate::config::BillingSettings;
    use crate::gateway::{
        CheckoutRequest, CheckoutToken, GatewayError, GatewayNotification, GatewayStatusReport,
        PaymentGateway,
    };
    use crate::plans::fixtures::plan;
    use crate::plans::SubscriptionPlan;
    use crate::store::{BillingStore, InMemoryBillingStore};
    use crate::subscriptions::fixtures::subscription;
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::Transaction;
    use crate::BillingService;

    /// Ten days before the end of a 30-day period
    pub const NOW: OffsetDateTime = datetime!(2024-04-21 00:00:00 UTC);
    pub const PERIOD_START: OffsetDateTime = datetime!(2024-04-01 00:00:00 UTC);
    pub const PERIOD_END: OffsetDateTime = datetime!(2024-05-01 00:00:00 UTC);

    pub const VALID_SIGNATURE: &str = "valid-signature";

    #[derive(Clone)]
    pub enum Scripted {
        Status(&'static str),
        NotFound,
        Unavailable,
    }

    #[derive(Default)]
    pub struct FakeGateway {
        pub fail_checkout: AtomicBool,
        checkouts: Mutex<Vec<CheckoutRequest>>,
        statuses: Mutex<HashMap<String, Scripted>>,
    }

    impl FakeGateway {
        pub fn script(&self, order_id: &str, status: Scripted) {
            self.statuses
                .lock()
                .unwrap()
                .insert(order_id.to_string(), status);
        }

        pub fn checkouts(&self) -> Vec<CheckoutRequest> {
            self.checkouts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_checkout_token(
            &self,
            request: &CheckoutRequest,
        ) -> Result<CheckoutToken, GatewayError> {
            if self.fail_checkout.load(Ordering::SeqCst) {
                return Err(GatewayError::Timeout);
            }
            self.checkouts.lock().unwrap().push(request.clone());
            Ok(CheckoutToken {
                token: format!("snap-{}", request.order_id),
                redirect_url: None,
            })
        }

        async fn transaction_status(
            &self,
            order_id: &str,
        ) -> Result<GatewayStatusReport, GatewayError> {
            let scripted = self.statuses.lock().unwrap().get(order_id).cloned();
            match scripted {
                Some(Scripted::Status(status)) => Ok(GatewayStatusReport {
                    order_id: order_id.to_string(),
                    transaction_status: status.to_string(),
                    fraud_status: None,
                    status_code: Some("200".to_string()),
                    gross_amount: None,
                }),
                Some(Scripted::Unavailable) => Err(GatewayError::Rejected {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
                Some(Scripted::NotFound) | None => Err(GatewayError::NotFound(order_id.to_string())),
            }
        }

        fn verify_notification_signature(&self, notification: &GatewayNotification) -> bool {
            notification.signature_key == VALID_SIGNATURE
        }
    }

    pub struct Harness {
        pub store: Arc<InMemoryBillingStore>,
        pub gateway: Arc<FakeGateway>,
        pub billing: BillingService,
        pub free: SubscriptionPlan,
        pub starter: SubscriptionPlan,
        pub craft: SubscriptionPlan,
        pub roastery: SubscriptionPlan,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(FakeGateway::default());

        let free = plan("Free", 0, PlanInterval::Monthly);
        let starter = plan("Starter", 10, PlanInterval::Monthly);
        let craft = plan("Craft", 30, PlanInterval::Monthly);
        let roastery = plan("Roastery", 300, PlanInterval::Yearly);
        for p in [&free, &starter, &craft, &roastery] {
            store.insert_plan(p.clone()).unwrap();
        }

        let billing = BillingService::new(
            store.clone(),
            gateway.clone(),
            BillingSettings::default(),
        );

        Harness {
            store,
            gateway,
            billing,
            free,
            starter,
            craft,
            roastery,
        }
    }

    impl Harness {
        pub fn subscribe(
            &self,
            plan: &SubscriptionPlan,
            status: SubscriptionStatus,
            start: OffsetDateTime,
            end: Option<OffsetDateTime>,
        ) -> Subscription {
            let sub = subscription(plan.id, status, start, end);
            self.store.insert_subscription(sub.clone()).unwrap();
            sub
        }

        /// Active on `plan` for the standard 30-day period
        pub fn active_on(&self, plan: &SubscriptionPlan) -> Subscription {
            self.subscribe(plan, SubscriptionStatus::Active, PERIOD_START, Some(PERIOD_END))
        }

        pub async fn reload(&self, sub: &Subscription) -> Subscription {
            self.store.get_subscription(sub.id).await.unwrap().unwrap()
        }

        pub fn ledger(&self, sub: &Subscription) -> Vec<Transaction> {
            self.store.transactions_for(sub.tenant_id).unwrap()
        }

        pub fn writes(&self) -> usize {
            self.store.subscription_writes().unwrap()
        }
    }

    pub fn notification(order_id: &str, transaction_status: &str) -> GatewayNotification {
        GatewayNotification {
            order_id: order_id.to_string(),
            status_code: "200".to_string(),
            gross_amount: "7.00".to_string(),
            signature_key: VALID_SIGNATURE.to_string(),
            transaction_status: transaction_status.to_string(),
            fraud_status: None,
            transaction_id: Some(Uuid::new_v4().to_string()),
            payment_type: Some("bank_transfer".to_string()),
        }
    }
}

#[cfg(test)]
mod plan_change_tests {
    use super::harness::*;
    use crate::checkout::{EffectiveDate, PlanChangeRequest};
    use crate::error::BillingError;
    use crate::plans::ChangeType;
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::{TransactionMetadata, TransactionStatus};
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;
    use time::Duration;
    use uuid::Uuid;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn change(sub: &Subscription, plan_id: Uuid, effective_date: EffectiveDate) -> PlanChangeRequest {
        PlanChangeRequest {
            subscription_id: sub.id,
            new_plan_id: plan_id,
            effective_date,
            requested_by: Some(Uuid::new_v4()),
            customer_email: Some("owner@brewery.test".to_string()),
        }
    }

    // =========================================================================
    // BILL-PC01: $10 -> $30 with 10 of 30 days left charges 6.67 via checkout
    // =========================================================================
    #[tokio::test]
    async fn test_mid_period_upgrade_requires_checkout() {
        let h = harness();
        let sub = h.active_on(&h.starter);

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();

        assert!(outcome.requires_payment);
        assert_eq!(outcome.change_type, ChangeType::Upgrade);
        assert_eq!(outcome.prorated_amount, Some(dec("6.67")));
        let checkout = outcome.checkout.expect("checkout session");
        assert_eq!(checkout.amount, dec("7"), "gateway charges whole units");
        assert_eq!(checkout.snap_token, format!("snap-{}", checkout.order_id));

        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::PendingCheckout);
        assert_eq!(after.intended_plan_id, Some(h.craft.id));
        assert_eq!(after.plan_id, h.starter.id, "plan changes only on payment");
        assert_eq!(after.current_period_end, Some(PERIOD_END));

        let ledger = h.ledger(&sub);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TransactionStatus::Pending);
        assert_eq!(ledger[0].payment_gateway_id.as_deref(), Some(checkout.order_id.as_str()));
        match &ledger[0].metadata {
            TransactionMetadata::PlanChange(meta) => {
                assert_eq!(meta.proration.unused_amount, dec("3.33"));
                assert_eq!(meta.proration.new_plan_prorated, dec("10.00"));
                assert_eq!(meta.previous_status, SubscriptionStatus::Active);
            }
            other => panic!("unexpected metadata: {other:?}"),
        }
        assert_eq!(h.gateway.checkouts().len(), 1);
    }

    // =========================================================================
    // BILL-PC02: $30 -> $10 with 10 days left applies now with 6.67 credit
    // =========================================================================
    #[tokio::test]
    async fn test_mid_period_downgrade_applies_immediately() {
        let h = harness();
        let sub = h.active_on(&h.craft);

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.starter.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();

        assert!(!outcome.requires_payment);
        assert_eq!(outcome.change_type, ChangeType::Downgrade);
        assert_eq!(outcome.prorated_amount, Some(dec("-6.67")));
        assert_eq!(outcome.credit, Some(dec("6.67")));
        assert!(outcome.checkout.is_none());

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.starter.id);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, PERIOD_START);
        assert_eq!(after.current_period_end, Some(PERIOD_END));

        let ledger = h.ledger(&sub);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TransactionStatus::Completed);
        assert_eq!(ledger[0].amount, Decimal::ZERO);
        match &ledger[0].metadata {
            TransactionMetadata::PlanChange(meta) => assert_eq!(meta.credit, dec("6.67")),
            other => panic!("unexpected metadata: {other:?}"),
        }
        assert!(h.gateway.checkouts().is_empty());
    }

    // =========================================================================
    // BILL-PC03: Same plan while active is rejected without writes
    // =========================================================================
    #[tokio::test]
    async fn test_same_plan_while_active_rejected() {
        let h = harness();
        let sub = h.active_on(&h.craft);

        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::StateConflict {
                status: SubscriptionStatus::Active,
                ..
            }
        ));
        assert_eq!(h.writes(), 0);
        assert!(h.ledger(&sub).is_empty());
    }

    // =========================================================================
    // BILL-PC04: Same plan after expiry points to the renewal path
    // =========================================================================
    #[tokio::test]
    async fn test_same_plan_when_expired_rejected() {
        let h = harness();
        let sub = h.subscribe(
            &h.craft,
            SubscriptionStatus::Expired,
            PERIOD_START - Duration::days(60),
            Some(PERIOD_START - Duration::days(30)),
        );

        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();

        // EXPIRED is outside the plan-change whitelist as well
        assert!(matches!(err, BillingError::StateConflict { .. }));

        let lapsed = h.subscribe(
            &h.craft,
            SubscriptionStatus::PastDue,
            PERIOD_START - Duration::days(30),
            Some(NOW - Duration::days(3)),
        );
        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&lapsed, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();
        assert!(
            matches!(err, BillingError::StateConflict { ref message, .. } if message.contains("renew"))
        );
    }

    // =========================================================================
    // BILL-PC05: A pending checkout blocks further plan changes
    // =========================================================================
    #[tokio::test]
    async fn test_pending_checkout_blocks_second_change() {
        let h = harness();
        let sub = h.active_on(&h.starter);

        h.billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();

        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.roastery.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::StateConflict {
                status: SubscriptionStatus::PendingCheckout,
                ..
            }
        ));
        assert_eq!(h.ledger(&sub).len(), 1);
    }

    // =========================================================================
    // BILL-PC06: After expiry even a cheaper plan is a full-price checkout
    // =========================================================================
    #[tokio::test]
    async fn test_change_after_lapse_is_full_price() {
        let h = harness();
        let sub = h.subscribe(
            &h.craft,
            SubscriptionStatus::PastDue,
            PERIOD_START - Duration::days(30),
            Some(NOW - Duration::days(3)),
        );

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.starter.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();

        assert!(outcome.requires_payment);
        assert_eq!(outcome.prorated_amount, None);
        assert_eq!(outcome.checkout.unwrap().amount, dec("10"));

        let ledger = h.ledger(&sub);
        assert!(matches!(
            ledger[0].metadata,
            TransactionMetadata::ExpiredPlanChange(_)
        ));
        assert_eq!(h.reload(&sub).await.status, SubscriptionStatus::PendingCheckout);
    }

    // =========================================================================
    // BILL-PC07: After expiry a free target activates at once, never expiring
    // =========================================================================
    #[tokio::test]
    async fn test_free_plan_after_lapse_activates_immediately() {
        let h = harness();
        let sub = h.subscribe(
            &h.craft,
            SubscriptionStatus::PastDue,
            PERIOD_START - Duration::days(30),
            Some(NOW - Duration::days(3)),
        );

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.free.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();

        assert!(!outcome.requires_payment);
        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.free.id);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, NOW);
        assert_eq!(after.current_period_end, None);
        assert!(h.gateway.checkouts().is_empty());
    }

    // =========================================================================
    // BILL-PC08: End-of-period change stages intent only; a new one replaces it
    // =========================================================================
    #[tokio::test]
    async fn test_end_of_period_change_is_staged() {
        let h = harness();
        let sub = h.active_on(&h.starter);

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::EndOfPeriod), NOW)
            .await
            .unwrap();

        assert!(!outcome.requires_payment);
        assert_eq!(outcome.effective_at, Some(PERIOD_END));
        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.starter.id);
        assert_eq!(after.intended_plan_id, Some(h.craft.id));
        assert_eq!(after.status, SubscriptionStatus::Active);

        h.billing
            .checkout
            .request_plan_change_at(change(&sub, h.roastery.id, EffectiveDate::EndOfPeriod), NOW)
            .await
            .unwrap();

        let after = h.reload(&sub).await;
        assert_eq!(after.intended_plan_id, Some(h.roastery.id));

        let ledger = h.ledger(&sub);
        assert_eq!(ledger.len(), 2);
        let statuses: Vec<_> = ledger
            .iter()
            .map(|tx| (tx.subscription_plan_id, tx.status))
            .collect();
        assert!(statuses.contains(&(h.craft.id, TransactionStatus::Cancelled)));
        assert!(statuses.contains(&(h.roastery.id, TransactionStatus::Scheduled)));
    }

    // =========================================================================
    // BILL-PC09: Gateway failure leaves no pending transaction behind
    // =========================================================================
    #[tokio::test]
    async fn test_gateway_failure_persists_nothing() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        h.gateway.fail_checkout.store(true, Ordering::SeqCst);

        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::GatewayTimeout));
        assert!(h.ledger(&sub).is_empty());
        assert_eq!(h.reload(&sub).await, sub);

        // A fresh attempt gets a new order id
        h.gateway.fail_checkout.store(false, Ordering::SeqCst);
        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap();
        assert!(outcome.checkout.is_some());
        assert_eq!(h.ledger(&sub).len(), 1);
    }

    // =========================================================================
    // BILL-PC10: Preview computes the same numbers without side effects
    // =========================================================================
    #[tokio::test]
    async fn test_preview_has_no_side_effects() {
        let h = harness();
        let sub = h.active_on(&h.starter);

        let preview = h
            .billing
            .checkout
            .preview_plan_change_at(sub.id, h.craft.id, NOW)
            .await
            .unwrap();

        assert!(!preview.treated_as_new_purchase);
        assert_eq!(preview.amount_due_now, dec("6.67"));
        assert_eq!(preview.credit, Decimal::ZERO);
        assert!(preview.options.immediate);
        assert!(preview.options.end_of_period);
        assert_eq!(preview.proration.unwrap().remaining_days, 10);

        assert_eq!(h.writes(), 0);
        assert!(h.ledger(&sub).is_empty());
        assert!(h.gateway.checkouts().is_empty());
    }

    #[tokio::test]
    async fn test_preview_after_lapse_offers_only_immediate() {
        let h = harness();
        let sub = h.subscribe(
            &h.starter,
            SubscriptionStatus::PastDue,
            PERIOD_START,
            Some(NOW - Duration::days(1)),
        );

        let preview = h
            .billing
            .checkout
            .preview_plan_change_at(sub.id, h.craft.id, NOW)
            .await
            .unwrap();

        assert!(preview.treated_as_new_purchase);
        assert_eq!(preview.amount_due_now, dec("30"));
        assert!(!preview.options.end_of_period);
    }

    #[tokio::test]
    async fn test_inactive_target_plan_rejected() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        let mut retired = h.craft.clone();
        retired.id = Uuid::new_v4();
        retired.is_active = false;
        h.store.insert_plan(retired.clone()).unwrap();

        let err = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, retired.id, EffectiveDate::Immediate), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
    // =========================================================================
    // BILL-PC11: End-of-period request on a lapsed period is a purchase now
    // =========================================================================
    #[tokio::test]
    async fn test_end_of_period_after_lapse_is_purchase() {
        let h = harness();
        let sub = h.subscribe(
            &h.starter,
            SubscriptionStatus::PastDue,
            PERIOD_START - Duration::days(30),
            Some(NOW - Duration::days(3)),
        );

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(change(&sub, h.craft.id, EffectiveDate::EndOfPeriod), NOW)
            .await
            .unwrap();

        assert!(outcome.requires_payment);
        assert_eq!(outcome.effective_date, EffectiveDate::Immediate);
        assert_eq!(outcome.checkout.unwrap().amount, dec("30"));
        assert_eq!(h.reload(&sub).await.status, SubscriptionStatus::PendingCheckout);
        assert!(!h
            .ledger(&sub)
            .iter()
            .any(|tx| tx.status == TransactionStatus::Scheduled));
    }
}

#[cfg(test)]
mod checkout_tests {
    use super::harness::*;
    use crate::calendar::{compute_next_period_end, PlanInterval};
    use crate::checkout::CheckoutInput;
    use crate::error::BillingError;
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::TransactionMetadata;
    use rust_decimal::Decimal;
    use time::Duration;
    use uuid::Uuid;

    fn input(sub: &Subscription, plan_id: Uuid, cycle: PlanInterval) -> CheckoutInput {
        CheckoutInput {
            tenant_id: sub.tenant_id,
            plan_id,
            billing_cycle: cycle,
            requested_by: None,
            customer_email: None,
        }
    }

    // =========================================================================
    // BILL-CO01: Renewal after expiry, a year at a time on a monthly plan
    // =========================================================================
    #[tokio::test]
    async fn test_yearly_renewal_of_monthly_plan() {
        let h = harness();
        let sub = h.subscribe(
            &h.craft,
            SubscriptionStatus::Expired,
            PERIOD_START - Duration::days(60),
            Some(PERIOD_START - Duration::days(30)),
        );

        let session = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.craft.id, PlanInterval::Yearly), NOW)
            .await
            .unwrap();

        assert_eq!(session.amount, Decimal::from(360));
        assert_eq!(session.billing_cycle, PlanInterval::Yearly);
        assert_eq!(session.plan_name, "Craft");
        assert!(matches!(
            h.ledger(&sub)[0].metadata,
            TransactionMetadata::Renewal(_)
        ));

        // Paying activates a full calendar year
        h.billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();
        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(
            after.current_period_end,
            Some(compute_next_period_end(
                after.current_period_start,
                PlanInterval::Yearly
            ))
        );
    }

    // =========================================================================
    // BILL-CO02: Monthly billing of a yearly-only plan is invalid
    // =========================================================================
    #[tokio::test]
    async fn test_monthly_cycle_on_yearly_plan_rejected() {
        let h = harness();
        let sub = h.subscribe(&h.free, SubscriptionStatus::Active, PERIOD_START, None);

        let err = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.roastery.id, PlanInterval::Monthly), NOW)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(h.gateway.checkouts().is_empty());
    }

    // =========================================================================
    // BILL-CO03: Live subscriptions cannot renew or switch through checkout
    // =========================================================================
    #[tokio::test]
    async fn test_live_subscription_cannot_checkout() {
        let h = harness();
        let sub = h.active_on(&h.craft);

        let same = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.craft.id, PlanInterval::Monthly), NOW)
            .await
            .unwrap_err();
        assert!(matches!(same, BillingError::StateConflict { .. }));

        let other = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.starter.id, PlanInterval::Monthly), NOW)
            .await
            .unwrap_err();
        assert!(
            matches!(other, BillingError::StateConflict { ref message, .. } if message.contains("plan change"))
        );
    }

    // =========================================================================
    // BILL-CO04: A free-tier tenant buys a paid plan outright
    // =========================================================================
    #[tokio::test]
    async fn test_free_tenant_buys_plan() {
        let h = harness();
        let sub = h.subscribe(&h.free, SubscriptionStatus::Active, PERIOD_START, None);

        let session = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.craft.id, PlanInterval::Monthly), NOW)
            .await
            .unwrap();

        assert_eq!(session.amount, Decimal::from(30));
        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::PendingCheckout);
        assert_eq!(after.intended_plan_id, Some(h.craft.id));
    }

    // =========================================================================
    // BILL-CO05: The free plan is never sold through checkout
    // =========================================================================
    #[tokio::test]
    async fn test_free_plan_checkout_rejected() {
        let h = harness();
        let sub = h.subscribe(
            &h.craft,
            SubscriptionStatus::Expired,
            PERIOD_START - Duration::days(60),
            Some(PERIOD_START - Duration::days(30)),
        );

        let err = h
            .billing
            .checkout
            .create_checkout_at(input(&sub, h.free.id, PlanInterval::Monthly), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}

#[cfg(test)]
mod webhook_tests {
    use super::harness::*;
    use crate::calendar::{compute_next_period_end, PlanInterval};
    use crate::checkout::{CheckoutSession, EffectiveDate, PlanChangeRequest};
    use crate::error::BillingError;
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::TransactionStatus;
    use std::sync::Arc;

    async fn upgrade_checkout(h: &Harness) -> (Subscription, CheckoutSession) {
        let sub = h.active_on(&h.starter);
        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();
        (sub, outcome.checkout.unwrap())
    }

    // =========================================================================
    // BILL-W01: Settlement activates the intended plan from now
    // =========================================================================
    #[tokio::test]
    async fn test_paid_notification_activates_subscription() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;

        let outcome = h
            .billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();

        assert!(outcome.applied);
        assert!(outcome.subscription_activated);
        assert_eq!(outcome.status, TransactionStatus::Paid);

        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.plan_id, h.craft.id);
        assert_eq!(after.intended_plan_id, None);
        assert!(!after.cancel_at_period_end);
        assert!(after.current_period_start > NOW);
        assert_eq!(
            after.current_period_end,
            Some(compute_next_period_end(
                after.current_period_start,
                PlanInterval::Monthly
            ))
        );

        let tx = &h.ledger(&sub)[0];
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert_eq!(tx.gateway_status.as_deref(), Some("settlement"));
    }

    // =========================================================================
    // BILL-W02: Replayed notification changes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_notification_is_noop() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;
        let paid = notification(&session.order_id, "settlement");

        h.billing
            .reconciliation
            .handle_notification(&paid)
            .await
            .unwrap();
        let first = h.reload(&sub).await;
        let writes = h.writes();

        let replay = h
            .billing
            .reconciliation
            .handle_notification(&paid)
            .await
            .unwrap();

        assert!(!replay.applied);
        assert_eq!(replay.status, TransactionStatus::Paid);
        assert_eq!(h.writes(), writes);
        assert_eq!(h.reload(&sub).await, first);
        assert_eq!(h.ledger(&sub).len(), 1);
    }

    // =========================================================================
    // BILL-W03: Concurrent deliveries activate exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_notifications_activate_once() {
        let h = Arc::new(harness());
        let (_sub, session) = upgrade_checkout(&h).await;
        let writes = h.writes();

        let mut handles = vec![];
        for _ in 0..5 {
            let h = h.clone();
            let order_id = session.order_id.clone();
            handles.push(tokio::spawn(async move {
                h.billing
                    .reconciliation
                    .handle_notification(&notification(&order_id, "settlement"))
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(h.writes(), writes + 1);
    }

    // =========================================================================
    // BILL-W04: Bad signature is rejected before any lookup
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;
        let mut forged = notification(&session.order_id, "settlement");
        forged.signature_key = "forged".to_string();

        let err = h
            .billing
            .reconciliation
            .handle_notification(&forged)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert_eq!(h.reload(&sub).await.status, SubscriptionStatus::PendingCheckout);
        assert_eq!(h.ledger(&sub)[0].status, TransactionStatus::Pending);
    }

    // =========================================================================
    // BILL-W05: Unknown order id
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_order_not_found() {
        let h = harness();
        let err = h
            .billing
            .reconciliation
            .handle_notification(&notification("no-such-order", "settlement"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    // =========================================================================
    // BILL-W06: Failed payment is recorded without touching the subscription
    // =========================================================================
    #[tokio::test]
    async fn test_failed_payment_leaves_subscription() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;
        let held = h.reload(&sub).await;
        let writes = h.writes();

        let outcome = h
            .billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "deny"))
            .await
            .unwrap();

        assert_eq!(outcome.status, TransactionStatus::Failed);
        assert!(!outcome.subscription_activated);
        assert_eq!(h.writes(), writes);
        assert_eq!(h.reload(&sub).await, held);

        // A late success for a closed order is ignored
        let late = h
            .billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();
        assert!(!late.applied);
        assert_eq!(h.reload(&sub).await.plan_id, h.starter.id);
    }

    // =========================================================================
    // BILL-W07: Poll and push converge on the same state
    // =========================================================================
    #[tokio::test]
    async fn test_reconcile_then_webhook_converge() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;
        h.gateway
            .script(&session.order_id, Scripted::Status("settlement"));

        let polled = h
            .billing
            .reconciliation
            .reconcile(&session.order_id)
            .await
            .unwrap();
        assert!(polled.ok);
        assert!(polled.subscription_activated);
        assert_eq!(polled.gateway_status, "settlement");
        let after_poll = h.reload(&sub).await;

        let pushed = h
            .billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();
        assert!(!pushed.applied);
        assert_eq!(h.reload(&sub).await, after_poll);
    }

    // =========================================================================
    // BILL-W08: Still-pending status only refreshes the raw gateway status
    // =========================================================================
    #[tokio::test]
    async fn test_pending_status_keeps_hold() {
        let h = harness();
        let (sub, session) = upgrade_checkout(&h).await;
        h.gateway.script(&session.order_id, Scripted::Status("pending"));

        let outcome = h
            .billing
            .reconciliation
            .reconcile(&session.order_id)
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert_eq!(outcome.status, TransactionStatus::Pending);
        let tx = &h.ledger(&sub)[0];
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.gateway_status.as_deref(), Some("pending"));
        assert_eq!(h.reload(&sub).await.status, SubscriptionStatus::PendingCheckout);
    }
    // =========================================================================
    // BILL-W09: Payment drops a staged change
    // =========================================================================
    #[tokio::test]
    async fn test_payment_supersedes_staged_change() {
        let h = harness();
        let sub = h.active_on(&h.starter);

        h.billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.roastery.id,
                    effective_date: EffectiveDate::EndOfPeriod,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();
        let session = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap()
            .checkout
            .unwrap();

        h.billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.craft.id);
        assert_eq!(after.intended_plan_id, None);

        let staged = h
            .ledger(&sub)
            .into_iter()
            .find(|tx| tx.subscription_plan_id == h.roastery.id)
            .unwrap();
        assert_eq!(staged.status, TransactionStatus::Cancelled);
    }

    // =========================================================================
    // BILL-W10: A paid upgrade withdraws a scheduled cancellation
    // =========================================================================
    #[tokio::test]
    async fn test_payment_clears_scheduled_cancellation() {
        let h = harness();
        let mut sub = h.active_on(&h.starter);
        sub.cancel_at_period_end = true;
        h.store.insert_subscription(sub.clone()).unwrap();

        let session = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap()
            .checkout
            .unwrap();
        assert!(h.reload(&sub).await.cancel_at_period_end);

        h.billing
            .reconciliation
            .handle_notification(&notification(&session.order_id, "settlement"))
            .await
            .unwrap();

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.craft.id);
        assert!(!after.cancel_at_period_end);
    }
}

#[cfg(test)]
mod sweep_tests {
    use super::harness::*;
    use crate::checkout::{EffectiveDate, PlanChangeRequest};
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::{TransactionMetadata, TransactionStatus};
    use rust_decimal::Decimal;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    fn ended_days_ago(h: &Harness, days: i64, status: SubscriptionStatus) -> Subscription {
        let end = NOW - Duration::days(days);
        h.subscribe(&h.craft, status, end - Duration::days(30), Some(end))
    }

    // =========================================================================
    // BILL-SW01: 6 days past end is PAST_DUE, 8 days is EXPIRED; reruns idle
    // =========================================================================
    #[tokio::test]
    async fn test_grace_window_boundary() {
        let h = harness();
        let six = ended_days_ago(&h, 6, SubscriptionStatus::Active);
        let eight = ended_days_ago(&h, 8, SubscriptionStatus::Active);
        let live = h.active_on(&h.craft);

        let report = h
            .billing
            .sweeps
            .expire_grace_periods_at(NOW)
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(h.reload(&six).await.status, SubscriptionStatus::PastDue);
        assert_eq!(h.reload(&eight).await.status, SubscriptionStatus::Expired);
        assert_eq!(h.reload(&live).await.status, SubscriptionStatus::Active);

        let rerun = h
            .billing
            .sweeps
            .expire_grace_periods_at(NOW)
            .await
            .unwrap();
        assert_eq!(rerun.processed, 0);
        assert_eq!(h.reload(&six).await.status, SubscriptionStatus::PastDue);
    }

    // =========================================================================
    // BILL-SW02: Held, cancelling and staged subscriptions are left alone
    // =========================================================================
    #[tokio::test]
    async fn test_grace_sweep_skips_other_owners() {
        let h = harness();
        let held = ended_days_ago(&h, 10, SubscriptionStatus::PendingCheckout);

        let mut cancelling = ended_days_ago(&h, 10, SubscriptionStatus::Active);
        cancelling.cancel_at_period_end = true;
        h.store.insert_subscription(cancelling.clone()).unwrap();

        let mut staged = ended_days_ago(&h, 10, SubscriptionStatus::Active);
        staged.intended_plan_id = Some(h.starter.id);
        h.store.insert_subscription(staged.clone()).unwrap();

        let report = h
            .billing
            .sweeps
            .expire_grace_periods_at(NOW)
            .await
            .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(h.reload(&held).await.status, SubscriptionStatus::PendingCheckout);
        assert_eq!(h.reload(&cancelling).await.status, SubscriptionStatus::Active);
        assert_eq!(h.reload(&staged).await.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // BILL-SW03: Deferred change anchors to the old period end, not sweep time
    // =========================================================================
    #[tokio::test]
    async fn test_deferred_change_anchors_to_period_end() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        h.billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::EndOfPeriod,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();

        // Too early: nothing happens
        let early = h
            .billing
            .sweeps
            .activate_deferred_changes_at(PERIOD_END - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(early.processed, 0);

        // Three days late
        let report = h
            .billing
            .sweeps
            .activate_deferred_changes_at(PERIOD_END + Duration::days(3))
            .await
            .unwrap();
        assert_eq!(report.processed, 1);

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.craft.id);
        assert_eq!(after.intended_plan_id, None);
        assert_eq!(after.current_period_start, PERIOD_END);
        assert_eq!(
            after.current_period_end,
            Some(datetime!(2024-06-01 00:00:00 UTC))
        );

        let ledger = h.ledger(&sub);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TransactionStatus::Paid);
    }

    // =========================================================================
    // BILL-SW04: Scheduled cancellation lands on the free plan with an audit row
    // =========================================================================
    #[tokio::test]
    async fn test_scheduled_downgrade_to_free() {
        let h = harness();
        let mut sub = h.active_on(&h.craft);
        sub.cancel_at_period_end = true;
        h.store.insert_subscription(sub.clone()).unwrap();

        let run_at = PERIOD_END + Duration::hours(1);
        let report = h
            .billing
            .sweeps
            .process_scheduled_downgrades_at(run_at)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.free.id);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert!(!after.cancel_at_period_end);
        assert_eq!(after.current_period_start, run_at);
        assert_eq!(after.current_period_end, None);

        let ledger = h.ledger(&sub);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, Decimal::ZERO);
        assert_eq!(ledger[0].status, TransactionStatus::Completed);
        match &ledger[0].metadata {
            TransactionMetadata::ScheduledDowngrade(meta) => {
                assert_eq!(meta.from_plan_id, h.craft.id);
                assert_eq!(meta.period_ended_at, PERIOD_END);
            }
            other => panic!("unexpected metadata: {other:?}"),
        }

        let rerun = h
            .billing
            .sweeps
            .process_scheduled_downgrades_at(run_at)
            .await
            .unwrap();
        assert_eq!(rerun.processed, 0);
        assert_eq!(h.ledger(&sub).len(), 1);
    }

    // =========================================================================
    // BILL-SW05: Unused checkout expires and the hold is released
    // =========================================================================
    #[tokio::test]
    async fn test_abandoned_checkout_released() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();
        let order_id = outcome.checkout.unwrap().order_id;
        h.gateway.script(&order_id, Scripted::NotFound);

        // Not stale yet
        let early = h
            .billing
            .sweeps
            .release_abandoned_checkouts_at(NOW + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(early.processed, 0);

        let report = h
            .billing
            .sweeps
            .release_abandoned_checkouts_at(NOW + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(report.processed, 2, "expire the order, release the hold");

        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.intended_plan_id, None);
        assert_eq!(after.plan_id, h.starter.id);
        assert_eq!(h.ledger(&sub)[0].status, TransactionStatus::Expired);
    }

    // =========================================================================
    // BILL-SW06: A stale checkout that was actually paid gets activated
    // =========================================================================
    #[tokio::test]
    async fn test_stale_paid_checkout_activated() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();
        h.gateway
            .script(&outcome.checkout.unwrap().order_id, Scripted::Status("settlement"));

        let run_at = NOW + Duration::days(2);
        let report = h
            .billing
            .sweeps
            .release_abandoned_checkouts_at(run_at)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.craft.id);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, run_at);
    }

    // =========================================================================
    // BILL-SW07: One broken item does not stop the batch
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_continues_past_failures() {
        let h = harness();
        let mut broken = h.active_on(&h.starter);
        broken.intended_plan_id = Some(Uuid::new_v4());
        h.store.insert_subscription(broken.clone()).unwrap();

        let mut fine = h.active_on(&h.starter);
        fine.intended_plan_id = Some(h.craft.id);
        h.store.insert_subscription(fine.clone()).unwrap();

        let report = h
            .billing
            .sweeps
            .activate_deferred_changes_at(PERIOD_END)
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, broken.id);
        assert_eq!(h.reload(&fine).await.plan_id, h.craft.id);
        assert_eq!(h.reload(&broken).await.plan_id, h.starter.id);
    }

    #[tokio::test]
    async fn test_gateway_outage_recorded_as_failure() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    subscription_id: sub.id,
                    new_plan_id: h.craft.id,
                    effective_date: EffectiveDate::Immediate,
                    requested_by: None,
                    customer_email: None,
                },
                NOW,
            )
            .await
            .unwrap();
        let order_id = outcome.checkout.unwrap().order_id;
        h.gateway.script(&order_id, Scripted::Unavailable);

        let report = h
            .billing
            .sweeps
            .release_abandoned_checkouts_at(NOW + Duration::days(2))
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(h.reload(&sub).await.status, SubscriptionStatus::PendingCheckout);
        assert_eq!(h.ledger(&sub)[0].status, TransactionStatus::Pending);
    }
    fn upgrade_now(sub: &Subscription, plan_id: Uuid) -> PlanChangeRequest {
        PlanChangeRequest {
            subscription_id: sub.id,
            new_plan_id: plan_id,
            effective_date: EffectiveDate::Immediate,
            requested_by: None,
            customer_email: None,
        }
    }

    // =========================================================================
    // BILL-SW08: A cancellation survives an abandoned upgrade checkout
    // =========================================================================
    #[tokio::test]
    async fn test_abandoned_checkout_keeps_scheduled_cancellation() {
        let h = harness();
        let mut sub = h.active_on(&h.starter);
        sub.cancel_at_period_end = true;
        h.store.insert_subscription(sub.clone()).unwrap();

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(upgrade_now(&sub, h.craft.id), NOW)
            .await
            .unwrap();
        let order_id = outcome.checkout.unwrap().order_id;

        let held = h.reload(&sub).await;
        assert_eq!(held.status, SubscriptionStatus::PendingCheckout);
        assert!(held.cancel_at_period_end);

        h.billing
            .reconciliation
            .handle_notification(&notification(&order_id, "expire"))
            .await
            .unwrap();

        let released = h
            .billing
            .sweeps
            .release_abandoned_checkouts_at(NOW + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(released.processed, 1);

        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.plan_id, h.starter.id);
        assert!(after.cancel_at_period_end);

        let downgraded = h
            .billing
            .sweeps
            .process_scheduled_downgrades_at(PERIOD_END + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(downgraded.processed, 1);

        let after = h.reload(&sub).await;
        assert_eq!(after.plan_id, h.free.id);
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_end, None);
    }

    // =========================================================================
    // BILL-SW09: A staged change survives an abandoned upgrade checkout
    // =========================================================================
    #[tokio::test]
    async fn test_abandoned_checkout_restores_staged_change() {
        let h = harness();
        let sub = h.active_on(&h.starter);
        h.billing
            .checkout
            .request_plan_change_at(
                PlanChangeRequest {
                    effective_date: EffectiveDate::EndOfPeriod,
                    ..upgrade_now(&sub, h.roastery.id)
                },
                NOW,
            )
            .await
            .unwrap();

        let outcome = h
            .billing
            .checkout
            .request_plan_change_at(upgrade_now(&sub, h.craft.id), NOW)
            .await
            .unwrap();
        let order_id = outcome.checkout.unwrap().order_id;
        assert_eq!(h.reload(&sub).await.intended_plan_id, Some(h.craft.id));

        h.billing
            .reconciliation
            .handle_notification(&notification(&order_id, "cancel"))
            .await
            .unwrap();
        h.billing
            .sweeps
            .release_abandoned_checkouts_at(NOW + Duration::hours(1))
            .await
            .unwrap();

        let after = h.reload(&sub).await;
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.intended_plan_id, Some(h.roastery.id));

        let report = h
            .billing
            .sweeps
            .activate_deferred_changes_at(PERIOD_END)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(h.reload(&sub).await.plan_id, h.roastery.id);

        let staged = h
            .ledger(&sub)
            .into_iter()
            .find(|tx| tx.subscription_plan_id == h.roastery.id)
            .unwrap();
        assert_eq!(staged.status, TransactionStatus::Paid);
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::harness::*;
    use crate::checkout::{EffectiveDate, PlanChangeRequest};
    use crate::error::BillingError;
    use crate::subscriptions::{Subscription, SubscriptionStatus};
    use crate::transactions::TransactionStatus;
    use time::{Duration, OffsetDateTime};

    fn live(h: &Harness) -> Subscription {
        let now = OffsetDateTime::now_utc();
        h.subscribe(
            &h.craft,
            SubscriptionStatus::Active,
            now - Duration::days(10),
            Some(now + Duration::days(20)),
        )
    }

    // =========================================================================
    // BILL-S01: Cancel then resume before the period ends
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_and_resume() {
        let h = harness();
        let sub = live(&h);

        let cancelled = h
            .billing
            .subscriptions
            .cancel_at_period_end(sub.tenant_id)
            .await
            .unwrap();
        assert!(cancelled.cancel_at_period_end);
        assert_eq!(cancelled.status, SubscriptionStatus::Active);
        assert_eq!(cancelled.plan_id, h.craft.id);

        let resumed = h.billing.subscriptions.resume(sub.tenant_id).await.unwrap();
        assert!(!resumed.cancel_at_period_end);
    }

    // =========================================================================
    // BILL-S02: The free plan has nothing to cancel
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_free_plan_rejected() {
        let h = harness();
        let sub = h.subscribe(
            &h.free,
            SubscriptionStatus::Active,
            OffsetDateTime::now_utc(),
            None,
        );

        let err = h
            .billing
            .subscriptions
            .cancel_at_period_end(sub.tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::StateConflict { .. }));
    }

    // =========================================================================
    // BILL-S03: Withdrawing a deferred change cancels its scheduled row
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_scheduled_change() {
        let h = harness();
        let sub = live(&h);
        h.billing
            .checkout
            .request_plan_change(PlanChangeRequest {
                subscription_id: sub.id,
                new_plan_id: h.starter.id,
                effective_date: EffectiveDate::EndOfPeriod,
                requested_by: None,
                customer_email: None,
            })
            .await
            .unwrap();

        let after = h
            .billing
            .subscriptions
            .cancel_scheduled_change(sub.tenant_id)
            .await
            .unwrap();

        assert_eq!(after.intended_plan_id, None);
        assert_eq!(after.plan_id, h.craft.id);
        assert_eq!(h.ledger(&sub)[0].status, TransactionStatus::Cancelled);
    }

    // =========================================================================
    // BILL-S04: Scheduling a cancellation drops a staged plan change
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_supersedes_staged_change() {
        let h = harness();
        let sub = live(&h);
        h.billing
            .checkout
            .request_plan_change(PlanChangeRequest {
                subscription_id: sub.id,
                new_plan_id: h.roastery.id,
                effective_date: EffectiveDate::EndOfPeriod,
                requested_by: None,
                customer_email: None,
            })
            .await
            .unwrap();

        let after = h
            .billing
            .subscriptions
            .cancel_at_period_end(sub.tenant_id)
            .await
            .unwrap();

        assert!(after.cancel_at_period_end);
        assert_eq!(after.intended_plan_id, None);
        assert_eq!(h.ledger(&sub)[0].status, TransactionStatus::Cancelled);
    }
}
