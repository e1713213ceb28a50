// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! End-to-end scenarios through webhook ingestion, the reconciliation
//! engine, proration and backfill, on the in-memory store and the recording
//! gateway:
//! - Subscription lifecycle and duplicate suppression
//! - License exclusivity
//! - Redelivery and idempotency
//! - Invoices and payments, including out-of-order delivery
//! - Plan-change proration
//! - Backfill sync

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use serde::Serialize;

    use crate::error::BillingResult;
    use crate::models::{BillingCycle, LicenseStatus, Subscription, UserLicense};
    use crate::plans::{PlanCatalog, PlanDefinition};
    use crate::store::MemoryBillingStore;
    use crate::testing::{event_json, sign, MockGateway};
    use crate::webhooks::IngestOutcome;
    use crate::BillingService;

    pub struct Harness {
        pub gateway: Arc<MockGateway>,
        pub store: MemoryBillingStore,
        pub billing: BillingService,
    }

    fn plan(plan_id: &str, unit_amount: i64) -> PlanDefinition {
        PlanDefinition {
            plan_id: plan_id.to_string(),
            name: plan_id.trim_start_matches("lt_").to_string(),
            price_ids: vec![format!("price_{plan_id}")],
            unit_amount,
            currency: "usd".to_string(),
            billing_cycle: BillingCycle::Monthly,
        }
    }

    pub fn catalog() -> PlanCatalog {
        PlanCatalog::new(vec![
            plan("lt_basic", 1900),
            plan("lt_pro", 4900),
            plan("lt_team", 9900),
        ])
    }

    /// Customer `bc_1` owned by `user_1`, not yet linked to the gateway
    pub async fn harness() -> Harness {
        harness_with_page_size(100).await
    }

    pub async fn harness_with_page_size(page_size: u32) -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let store = MemoryBillingStore::new();
        store.seed_customer("bc_1", "user_1", None).await.unwrap();

        let shared = Arc::new(store.clone());
        let billing = BillingService::from_parts(
            gateway.clone(),
            shared.clone(),
            shared.clone(),
            shared,
            catalog(),
            page_size,
        );

        Harness {
            gateway,
            store,
            billing,
        }
    }

    impl Harness {
        pub async fn deliver(
            &self,
            event_id: &str,
            event_type: &str,
            object: &impl Serialize,
        ) -> BillingResult<IngestOutcome> {
            let body = event_json(event_id, event_type, object);
            self.billing.webhooks.handle(&body, &sign(&body)).await
        }

        pub async fn active_subscriptions(&self, customer_id: &str) -> Vec<Subscription> {
            self.store
                .subscriptions_for(customer_id)
                .await
                .into_iter()
                .filter(|s| s.status.is_active_like())
                .collect()
        }

        pub async fn active_licenses(&self, user_id: &str) -> Vec<UserLicense> {
            self.store
                .licenses_for(user_id)
                .await
                .into_iter()
                .filter(|l| l.status == LicenseStatus::Active)
                .collect()
        }
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::support::harness;
    use crate::models::{LicenseStatus, SubscriptionStatus};
    use crate::reconcile::REPLACED_REASON;
    use crate::store::{BillingStore, CustomerDirectory};
    use crate::testing::{subscription, DAY, T0};
    use crate::webhooks::IngestOutcome;

    // =========================================================================
    // Trialing subscription for a customer known only through metadata
    // =========================================================================
    #[tokio::test]
    async fn test_trialing_subscription_activates_license() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "trialing", "lt_pro", T0);

        let outcome = h
            .deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);

        let row = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Trialing);
        assert_eq!(row.billing_customer_id, "bc_1");
        assert_eq!(row.plan_id.as_deref(), Some("lt_pro"));
        assert_eq!(row.unit_amount, 4900);

        let licenses = h.store.licenses_for("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].plan_id, "lt_pro");
        assert_eq!(licenses[0].status, LicenseStatus::Active);
        assert_eq!(licenses[0].expires_at, Some(row.current_period_end));
    }

    // =========================================================================
    // Metadata resolution writes the external id back (self-healing link)
    // =========================================================================
    #[tokio::test]
    async fn test_metadata_resolution_backfills_link() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);

        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        let customer = h.store.find_customer("bc_1").await.unwrap().unwrap();
        assert_eq!(customer.external_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(
            h.store.resolve_internal_customer_id("cus_1").await.unwrap(),
            Some("bc_1".to_string())
        );
    }

    // =========================================================================
    // Directory lookup when the event carries no CRM customer id
    // =========================================================================
    #[tokio::test]
    async fn test_directory_resolves_customer_without_metadata() {
        let h = harness().await;
        h.store.seed_customer("bc_2", "user_2", None).await.unwrap();
        h.store.seed_directory("cus_9", "bc_2").await;

        let mut sub = subscription("sub_9", "cus_9", "bc_2", "active", "lt_team", T0);
        sub.metadata.clear();
        sub.items.data[0].price.metadata.clear();

        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        let row = h.store.subscription("sub_9").await.unwrap();
        assert_eq!(row.billing_customer_id, "bc_2");
        // Price id matched the catalog
        assert_eq!(row.plan_id.as_deref(), Some("lt_team"));
        let customer = h.store.find_customer("bc_2").await.unwrap().unwrap();
        assert_eq!(customer.external_customer_id.as_deref(), Some("cus_9"));
    }

    // =========================================================================
    // Second subscription for the same customer replaces the first
    // =========================================================================
    #[tokio::test]
    async fn test_second_subscription_cancels_first_at_gateway() {
        let h = harness().await;
        let first = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let second = subscription("sub_2", "cus_1", "bc_1", "active", "lt_pro", T0 + 60);

        h.deliver("evt_1", "customer.subscription.created", &first)
            .await
            .unwrap();
        h.deliver("evt_2", "customer.subscription.created", &second)
            .await
            .unwrap();

        let old = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(old.status, SubscriptionStatus::Canceled);
        assert_eq!(old.cancellation_reason.as_deref(), Some(REPLACED_REASON));
        assert!(old.canceled_at.is_some());

        let cancels = h.gateway.calls_to("cancel_subscription");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].target, "sub_1");
        assert_eq!(cancels[0].detail.as_deref(), Some("immediately"));

        let active = h.active_subscriptions("bc_1").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_subscription_id, "sub_2");
        assert_eq!(h.active_licenses("user_1").await.len(), 1);
    }

    // =========================================================================
    // Older subscription delivered last loses to the newer one
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_created_keeps_newest() {
        let h = harness().await;
        let older = subscription("sub_old", "cus_1", "bc_1", "active", "lt_basic", T0);
        let newer = subscription("sub_new", "cus_1", "bc_1", "active", "lt_team", T0 + DAY);

        h.deliver("evt_1", "customer.subscription.created", &newer)
            .await
            .unwrap();
        h.deliver("evt_2", "customer.subscription.created", &older)
            .await
            .unwrap();

        assert_eq!(
            h.store.subscription("sub_new").await.unwrap().status,
            SubscriptionStatus::Active
        );
        let old = h.store.subscription("sub_old").await.unwrap();
        assert_eq!(old.status, SubscriptionStatus::Canceled);
        assert_eq!(old.cancellation_reason.as_deref(), Some(REPLACED_REASON));

        let cancels = h.gateway.calls_to("cancel_subscription");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].target, "sub_old");

        let licenses = h.active_licenses("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].plan_id, "lt_team");
    }

    // =========================================================================
    // Many created events for one customer leave exactly one active
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_checkouts_leave_one_active() {
        let h = harness().await;
        let plans = ["lt_pro", "lt_team", "lt_basic", "lt_pro", "lt_team"];
        let offsets = [3, 1, 4, 0, 2];

        for (i, (plan, offset)) in plans.iter().zip(offsets).enumerate() {
            let sub = subscription(
                &format!("sub_{i}"),
                "cus_1",
                "bc_1",
                "active",
                plan,
                T0 + offset * 60,
            );
            h.deliver(&format!("evt_{i}"), "customer.subscription.created", &sub)
                .await
                .unwrap();

            assert!(h.active_subscriptions("bc_1").await.len() <= 1);
            assert_eq!(h.active_licenses("user_1").await.len(), 1);
        }

        // sub_2 was created last at the gateway
        let active = h.active_subscriptions("bc_1").await;
        assert_eq!(active[0].external_subscription_id, "sub_2");
        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_basic");
    }

    // =========================================================================
    // A late created event never resurrects a canceled subscription
    // =========================================================================
    #[tokio::test]
    async fn test_created_after_deleted_stays_canceled() {
        let h = harness().await;
        let mut deleted = subscription("sub_1", "cus_1", "bc_1", "canceled", "lt_pro", T0);
        deleted.canceled_at = Some(T0 + DAY);
        let created = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);

        h.deliver("evt_del", "customer.subscription.deleted", &deleted)
            .await
            .unwrap();
        h.deliver("evt_new", "customer.subscription.created", &created)
            .await
            .unwrap();

        let row = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert_eq!(row.canceled_at.unwrap().unix_timestamp(), T0 + DAY);
        assert!(h.active_licenses("user_1").await.is_empty());
    }

    // =========================================================================
    // A late updated event for a replaced subscription stays canceled
    // =========================================================================
    #[tokio::test]
    async fn test_stale_update_keeps_replaced_subscription_canceled() {
        let h = harness().await;
        let first = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let second = subscription("sub_2", "cus_1", "bc_1", "active", "lt_team", T0 + DAY);

        h.deliver("evt_1", "customer.subscription.created", &first)
            .await
            .unwrap();
        h.deliver("evt_2", "customer.subscription.created", &second)
            .await
            .unwrap();
        assert_eq!(h.gateway.calls_to("cancel_subscription").len(), 1);

        // Emitted before the replacement, delivered after it
        let outcome = h
            .deliver("evt_3", "customer.subscription.updated", &first)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);

        let old = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(old.status, SubscriptionStatus::Canceled);
        assert_eq!(old.cancellation_reason.as_deref(), Some(REPLACED_REASON));

        let active = h.active_subscriptions("bc_1").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_subscription_id, "sub_2");

        let licenses = h.active_licenses("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].plan_id, "lt_team");
        assert_eq!(h.gateway.calls_to("cancel_subscription").len(), 1);
    }

    // =========================================================================
    // An update that activates a subscription still enforces one active
    // =========================================================================
    #[tokio::test]
    async fn test_update_to_active_replaces_older_subscription() {
        let h = harness().await;
        let first = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let mut second = subscription("sub_2", "cus_1", "bc_1", "incomplete", "lt_team", T0 + DAY);

        h.deliver("evt_1", "customer.subscription.created", &first)
            .await
            .unwrap();
        h.deliver("evt_2", "customer.subscription.created", &second)
            .await
            .unwrap();
        assert!(h.gateway.calls_to("cancel_subscription").is_empty());

        second.status = "active".to_string();
        h.deliver("evt_3", "customer.subscription.updated", &second)
            .await
            .unwrap();

        let cancels = h.gateway.calls_to("cancel_subscription");
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].target, "sub_1");

        let active = h.active_subscriptions("bc_1").await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_subscription_id, "sub_2");

        let licenses = h.active_licenses("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].plan_id, "lt_team");
    }

    // =========================================================================
    // Deleted marks canceled and releases the license
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_deactivates_license() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        // Gateway status lags behind the event type
        h.deliver("evt_2", "customer.subscription.deleted", &sub)
            .await
            .unwrap();

        let row = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert!(row.canceled_at.is_some());

        let licenses = h.store.licenses_for("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].status, LicenseStatus::Cancelled);
    }

    // =========================================================================
    // Updated refreshes period bounds and flags in place
    // =========================================================================
    #[tokio::test]
    async fn test_updated_refreshes_period_and_flags() {
        let h = harness().await;
        let mut sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();
        let before = h.store.subscription("sub_1").await.unwrap();

        sub.current_period_start += 30 * DAY;
        sub.current_period_end += 30 * DAY;
        sub.cancel_at_period_end = true;
        h.deliver("evt_2", "customer.subscription.updated", &sub)
            .await
            .unwrap();

        let after = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(after.id, before.id);
        assert!(after.cancel_at_period_end);
        assert_eq!(after.current_period_end.unix_timestamp(), T0 + 60 * DAY);
        assert_eq!(
            h.active_licenses("user_1").await[0].expires_at,
            Some(after.current_period_end)
        );
    }

    // =========================================================================
    // Unknown gateway status keeps the entitlement
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_status_fails_open() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "paused_by_risk", "lt_pro", T0);

        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        assert_eq!(
            h.store.subscription("sub_1").await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(h.active_licenses("user_1").await.len(), 1);
    }

    // =========================================================================
    // Past due keeps the license while the gateway retries payment
    // =========================================================================
    #[tokio::test]
    async fn test_past_due_keeps_license() {
        let h = harness().await;
        let mut sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        sub.status = "past_due".to_string();
        h.deliver("evt_2", "customer.subscription.updated", &sub)
            .await
            .unwrap();

        assert_eq!(
            h.store.subscription("sub_1").await.unwrap().status,
            SubscriptionStatus::PastDue
        );
        assert_eq!(h.active_licenses("user_1").await.len(), 1);
    }

    // =========================================================================
    // Unresolvable customer: logged, left for replay, acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_unresolvable_customer_is_dropped() {
        let h = harness().await;
        let mut sub = subscription("sub_x", "cus_unknown", "bc_missing", "active", "lt_pro", T0);
        sub.metadata.remove(crate::plans::CUSTOMER_ID_KEY);

        let outcome = h
            .deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped);

        assert!(h.store.subscription("sub_x").await.is_none());
        let record = h.store.find_webhook_event("evt_1").await.unwrap().unwrap();
        assert!(!record.processed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("cus_unknown"));
    }
}

#[cfg(test)]
mod license_tests {
    use super::support::harness;
    use crate::models::LicenseStatus;
    use crate::testing::{subscription, T0};

    // =========================================================================
    // Plan changes through updated events move the single active license
    // =========================================================================
    #[tokio::test]
    async fn test_plan_changes_keep_one_active_license() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_0", "customer.subscription.created", &sub)
            .await
            .unwrap();

        for (i, plan) in ["lt_team", "lt_basic", "lt_pro", "lt_team"].iter().enumerate() {
            let changed = subscription("sub_1", "cus_1", "bc_1", "active", plan, T0);
            h.deliver(&format!("evt_{}", i + 1), "customer.subscription.updated", &changed)
                .await
                .unwrap();

            let active = h.active_licenses("user_1").await;
            assert_eq!(active.len(), 1, "after switching to {plan}");
            assert_eq!(active[0].plan_id, *plan);
            assert_eq!(
                h.store.subscription("sub_1").await.unwrap().plan_id.as_deref(),
                Some(*plan)
            );
        }

        let all = h.store.licenses_for("user_1").await;
        assert_eq!(all.len(), 3);
        assert_eq!(
            all.iter()
                .filter(|l| l.status == LicenseStatus::Cancelled)
                .count(),
            2
        );
    }

    // =========================================================================
    // Amount and interval resolve the plan when no metadata is present
    // =========================================================================
    #[tokio::test]
    async fn test_plan_resolved_by_amount() {
        let h = harness().await;
        let mut sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        sub.metadata.remove(crate::plans::LICENSE_TYPE_KEY);
        let price = &mut sub.items.data[0].price;
        price.metadata.clear();
        price.id = "price_legacy".to_string();
        price.unit_amount = Some(9900);

        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();

        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_team");
    }
}

#[cfg(test)]
mod idempotency_tests {
    use super::support::harness;
    use crate::error::BillingError;
    use crate::models::SubscriptionStatus;
    use crate::store::BillingStore;
    use crate::testing::{event_json, sign, subscription, T0};
    use crate::webhooks::IngestOutcome;

    // =========================================================================
    // Same event id twice: identical state, no second round of side effects
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_has_no_side_effects() {
        let h = harness().await;
        let first = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let second = subscription("sub_2", "cus_1", "bc_1", "active", "lt_team", T0 + 60);
        h.deliver("evt_1", "customer.subscription.created", &first)
            .await
            .unwrap();

        let body = event_json("evt_2", "customer.subscription.created", &second);
        let outcome = h.billing.webhooks.handle(&body, &sign(&body)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);

        let state = h.store.snapshot().await;
        let calls = h.gateway.calls().len();

        let again = h.billing.webhooks.handle(&body, &sign(&body)).await.unwrap();
        assert_eq!(again, IngestOutcome::AlreadyProcessed);
        assert_eq!(h.store.snapshot().await, state);
        assert_eq!(h.gateway.calls().len(), calls);
        assert_eq!(h.gateway.calls_to("cancel_subscription").len(), 1);
    }

    // =========================================================================
    // Gateway outage during suppression: failure recorded, redelivery heals
    // =========================================================================
    #[tokio::test]
    async fn test_failed_suppression_retries_on_redelivery() {
        let h = harness().await;
        let first = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let second = subscription("sub_2", "cus_1", "bc_1", "active", "lt_pro", T0 + 60);
        h.deliver("evt_1", "customer.subscription.created", &first)
            .await
            .unwrap();

        h.gateway.fail("cancel_subscription");
        let err = h
            .deliver("evt_2", "customer.subscription.created", &second)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Transient(_)));

        let record = h.store.find_webhook_event("evt_2").await.unwrap().unwrap();
        assert!(!record.processed);
        assert_eq!(record.attempts, 1);
        assert!(h.store.subscription("sub_2").await.is_none());
        assert_eq!(
            h.store.subscription("sub_1").await.unwrap().status,
            SubscriptionStatus::Active
        );

        h.gateway.recover("cancel_subscription");
        let outcome = h
            .deliver("evt_2", "customer.subscription.created", &second)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);
        assert_eq!(
            h.store.subscription("sub_1").await.unwrap().status,
            SubscriptionStatus::Canceled
        );
        assert!(h.store.find_webhook_event("evt_2").await.unwrap().unwrap().processed);
    }

    // =========================================================================
    // Created and updated for one subscription commute
    // =========================================================================
    #[tokio::test]
    async fn test_created_and_updated_in_either_order() {
        let created = subscription("sub_1", "cus_1", "bc_1", "trialing", "lt_pro", T0);
        let updated = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);

        let a = harness().await;
        a.deliver("evt_1", "customer.subscription.created", &created)
            .await
            .unwrap();
        a.deliver("evt_2", "customer.subscription.updated", &updated)
            .await
            .unwrap();

        let b = harness().await;
        b.deliver("evt_2", "customer.subscription.updated", &updated)
            .await
            .unwrap();
        b.deliver("evt_1", "customer.subscription.created", &created)
            .await
            .unwrap();

        // Created applies the object it carries; either way one active row
        assert_eq!(a.active_subscriptions("bc_1").await.len(), 1);
        assert_eq!(b.active_subscriptions("bc_1").await.len(), 1);
        assert_eq!(a.active_licenses("user_1").await.len(), 1);
        assert_eq!(b.active_licenses("user_1").await.len(), 1);
    }

    // =========================================================================
    // Unknown event types are acknowledged and marked processed
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_acknowledged() {
        let h = harness().await;
        let outcome = h
            .deliver(
                "evt_1",
                "customer.tax_id.created",
                &serde_json::json!({ "id": "txi_1" }),
            )
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Processed);
        assert!(h.store.find_webhook_event("evt_1").await.unwrap().unwrap().processed);
        assert!(h.gateway.calls().is_empty());
    }
}

#[cfg(test)]
mod invoice_tests {
    use std::collections::HashMap;

    use super::support::{harness, Harness};
    use crate::gateway::types::{GatewayPeriod, GatewayStatusTransitions};
    use crate::gateway::{GatewayInvoice, GatewayLineItem, Page};
    use crate::models::InvoiceStatus;
    use crate::plans::CUSTOMER_ID_KEY;
    use crate::store::BillingStore;
    use crate::testing::{subscription, DAY, T0};
    use crate::webhooks::IngestOutcome;

    fn invoice(id: &str, status: &str, amount_due: i64) -> GatewayInvoice {
        GatewayInvoice {
            id: Some(id.to_string()),
            customer: "cus_1".to_string(),
            subscription: Some("sub_1".to_string()),
            status: Some(status.to_string()),
            currency: "usd".to_string(),
            amount_due,
            total: amount_due,
            lines: Page {
                data: vec![
                    GatewayLineItem {
                        id: "il_credit".to_string(),
                        description: Some("Unused time on Pro".to_string()),
                        amount: -2450,
                        currency: "usd".to_string(),
                        period: GatewayPeriod {
                            start: Some(T0 + 15 * DAY),
                            end: Some(T0 + 30 * DAY),
                        },
                        proration: true,
                        ..Default::default()
                    },
                    GatewayLineItem {
                        id: "il_charge".to_string(),
                        description: Some("Remaining time on Team".to_string()),
                        quantity: Some(1),
                        amount: 4950,
                        currency: "usd".to_string(),
                        period: GatewayPeriod {
                            start: Some(T0 + 15 * DAY),
                            end: Some(T0 + 30 * DAY),
                        },
                        proration: true,
                        ..Default::default()
                    },
                ],
                has_more: false,
            },
            created: T0 + 15 * DAY,
            metadata: HashMap::from([(CUSTOMER_ID_KEY.to_string(), "bc_1".to_string())]),
            ..Default::default()
        }
    }

    async fn with_subscription() -> Harness {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_sub", "customer.subscription.created", &sub)
            .await
            .unwrap();
        h
    }

    // =========================================================================
    // invoice.created: number, subscription link, ordered line items
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_created_with_lines() {
        let h = with_subscription().await;
        h.deliver("evt_1", "invoice.created", &invoice("in_1", "draft", 2500))
            .await
            .unwrap();

        let row = h.store.invoice("in_1").await.unwrap();
        let sub = h.store.subscription("sub_1").await.unwrap();
        assert_eq!(row.status, InvoiceStatus::Draft);
        assert_eq!(row.invoice_number, "INV-000001");
        assert_eq!(row.subscription_id, Some(sub.id));
        assert_eq!(row.billing_customer_id, "bc_1");

        let lines = h.store.list_line_items(row.id).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].external_line_id, "il_credit");
        assert_eq!(lines[0].amount, -2450);
        assert_eq!(lines[1].position, 1);
        assert_eq!(
            lines[1].period_start.unwrap().unix_timestamp(),
            T0 + 15 * DAY
        );
    }

    // =========================================================================
    // invoice.paid: PAID, amount paid, paid_at and URLs
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_paid_records_payment_details() {
        let h = with_subscription().await;
        h.deliver("evt_1", "invoice.created", &invoice("in_1", "draft", 2500))
            .await
            .unwrap();

        let mut paid = invoice("in_1", "paid", 2500);
        paid.amount_paid = 2500;
        paid.hosted_invoice_url = Some("https://pay.example/in_1".to_string());
        paid.invoice_pdf = Some("https://pay.example/in_1.pdf".to_string());
        paid.status_transitions = GatewayStatusTransitions {
            finalized_at: Some(T0 + 15 * DAY),
            paid_at: Some(T0 + 15 * DAY + 60),
        };
        h.deliver("evt_2", "invoice.paid", &paid).await.unwrap();

        let row = h.store.invoice("in_1").await.unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
        assert_eq!(row.amount_paid, 2500);
        assert_eq!(row.paid_at.unwrap().unix_timestamp(), T0 + 15 * DAY + 60);
        assert_eq!(row.hosted_invoice_url.as_deref(), Some("https://pay.example/in_1"));
        assert_eq!(row.invoice_number, "INV-000001");
    }

    // =========================================================================
    // Late invoice.created after invoice.paid does not downgrade
    // =========================================================================
    #[tokio::test]
    async fn test_late_created_keeps_paid() {
        let h = with_subscription().await;
        let mut paid = invoice("in_1", "paid", 2500);
        paid.amount_paid = 2500;

        h.deliver("evt_2", "invoice.paid", &paid).await.unwrap();
        h.deliver("evt_1", "invoice.created", &invoice("in_1", "draft", 2500))
            .await
            .unwrap();

        let row = h.store.invoice("in_1").await.unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
        assert_eq!(row.amount_paid, 2500);
        assert!(row.paid_at.is_some());
    }

    // =========================================================================
    // Failed payment leaves the invoice OPEN, finalized marks it OPEN
    // =========================================================================
    #[tokio::test]
    async fn test_payment_failed_and_finalized_are_open() {
        let h = with_subscription().await;
        h.deliver("evt_1", "invoice.finalized", &invoice("in_1", "draft", 2500))
            .await
            .unwrap();
        assert_eq!(h.store.invoice("in_1").await.unwrap().status, InvoiceStatus::Open);

        h.deliver("evt_2", "invoice.payment_failed", &invoice("in_1", "open", 2500))
            .await
            .unwrap();
        assert_eq!(h.store.invoice("in_1").await.unwrap().status, InvoiceStatus::Open);
    }

    // =========================================================================
    // Each new invoice gets the next number; updates keep theirs
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_numbers_are_stable() {
        let h = with_subscription().await;
        h.deliver("evt_1", "invoice.created", &invoice("in_1", "draft", 100))
            .await
            .unwrap();
        h.deliver("evt_2", "invoice.created", &invoice("in_2", "draft", 200))
            .await
            .unwrap();
        h.deliver("evt_3", "invoice.finalized", &invoice("in_1", "open", 100))
            .await
            .unwrap();

        assert_eq!(h.store.invoice("in_1").await.unwrap().invoice_number, "INV-000001");
        assert_eq!(h.store.invoice("in_2").await.unwrap().invoice_number, "INV-000002");
    }

    // =========================================================================
    // Invoice for an unknown customer is dropped
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_for_unknown_customer_dropped() {
        let h = harness().await;
        let mut orphan = invoice("in_x", "draft", 100);
        orphan.customer = "cus_nobody".to_string();
        orphan.subscription = None;
        orphan.metadata.clear();

        let outcome = h.deliver("evt_1", "invoice.created", &orphan).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped);
        assert!(h.store.invoice("in_x").await.is_none());
    }
}

#[cfg(test)]
mod payment_tests {
    use std::collections::HashMap;

    use super::support::{harness, Harness};
    use crate::gateway::types::GatewayPaymentError;
    use crate::gateway::{GatewayCharge, GatewayInvoice, GatewayPaymentIntent};
    use crate::models::PaymentStatus;
    use crate::plans::CUSTOMER_ID_KEY;
    use crate::testing::{subscription, T0};

    fn open_invoice(id: &str, created: i64) -> GatewayInvoice {
        GatewayInvoice {
            id: Some(id.to_string()),
            customer: "cus_1".to_string(),
            status: Some("open".to_string()),
            currency: "usd".to_string(),
            amount_due: 4900,
            created,
            ..Default::default()
        }
    }

    fn intent(id: &str, status: &str) -> GatewayPaymentIntent {
        GatewayPaymentIntent {
            id: id.to_string(),
            customer: Some("cus_1".to_string()),
            amount: 4900,
            currency: "usd".to_string(),
            status: status.to_string(),
            metadata: HashMap::from([(CUSTOMER_ID_KEY.to_string(), "bc_1".to_string())]),
            ..Default::default()
        }
    }

    async fn linked() -> Harness {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.deliver("evt_sub", "customer.subscription.created", &sub)
            .await
            .unwrap();
        h
    }

    // =========================================================================
    // Payment without an invoice id links the most recent OPEN invoice
    // =========================================================================
    #[tokio::test]
    async fn test_payment_links_latest_open_invoice() {
        let h = linked().await;
        h.deliver("evt_1", "invoice.finalized", &open_invoice("in_old", T0))
            .await
            .unwrap();
        h.deliver("evt_2", "invoice.finalized", &open_invoice("in_new", T0 + 60))
            .await
            .unwrap();

        h.deliver("evt_3", "payment_intent.succeeded", &intent("pi_1", "succeeded"))
            .await
            .unwrap();

        let payment = h.store.payment("pi_1").await.unwrap();
        let newest = h.store.invoice("in_new").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.invoice_id, Some(newest.id));
        assert_eq!(payment.billing_customer_id, "bc_1");
    }

    // =========================================================================
    // An echoed invoice id wins over the heuristic
    // =========================================================================
    #[tokio::test]
    async fn test_echoed_invoice_id_is_used() {
        let h = linked().await;
        h.deliver("evt_1", "invoice.finalized", &open_invoice("in_old", T0))
            .await
            .unwrap();
        h.deliver("evt_2", "invoice.finalized", &open_invoice("in_new", T0 + 60))
            .await
            .unwrap();

        let mut pi = intent("pi_1", "succeeded");
        pi.invoice = Some("in_old".to_string());
        h.deliver("evt_3", "payment_intent.succeeded", &pi)
            .await
            .unwrap();

        let old = h.store.invoice("in_old").await.unwrap();
        assert_eq!(h.store.payment("pi_1").await.unwrap().invoice_id, Some(old.id));
    }

    // =========================================================================
    // Failure details recorded; a late failure never undoes a success
    // =========================================================================
    #[tokio::test]
    async fn test_failure_then_success_and_late_failure() {
        let h = linked().await;
        let mut failed = intent("pi_1", "requires_payment_method");
        failed.last_payment_error = Some(GatewayPaymentError {
            code: Some("card_declined".to_string()),
            decline_code: Some("insufficient_funds".to_string()),
            message: Some("Your card has insufficient funds.".to_string()),
        });

        h.deliver("evt_1", "payment_intent.payment_failed", &failed)
            .await
            .unwrap();
        let payment = h.store.payment("pi_1").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.failure_code.as_deref(), Some("insufficient_funds"));

        h.deliver("evt_2", "payment_intent.succeeded", &intent("pi_1", "succeeded"))
            .await
            .unwrap();
        let payment = h.store.payment("pi_1").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert!(payment.failure_code.is_none());

        h.deliver("evt_3", "payment_intent.payment_failed", &failed)
            .await
            .unwrap();
        assert_eq!(
            h.store.payment("pi_1").await.unwrap().status,
            PaymentStatus::Succeeded
        );
    }

    // =========================================================================
    // charge.refunded flips the payment to REFUNDED for good
    // =========================================================================
    #[tokio::test]
    async fn test_refund_is_terminal() {
        let h = linked().await;
        h.deliver("evt_1", "payment_intent.succeeded", &intent("pi_1", "succeeded"))
            .await
            .unwrap();

        let charge = GatewayCharge {
            id: "ch_1".to_string(),
            customer: Some("cus_1".to_string()),
            payment_intent: Some("pi_1".to_string()),
            amount: 4900,
            amount_refunded: 4900,
            refunded: true,
            currency: "usd".to_string(),
            status: "succeeded".to_string(),
            ..Default::default()
        };
        h.deliver("evt_2", "charge.refunded", &charge).await.unwrap();

        let payment = h.store.payment("pi_1").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.refunded_amount, 4900);
        assert!(payment.refunded_at.is_some());

        h.deliver("evt_3", "payment_intent.succeeded", &intent("pi_1", "succeeded"))
            .await
            .unwrap();
        assert_eq!(
            h.store.payment("pi_1").await.unwrap().status,
            PaymentStatus::Refunded
        );
    }

    // =========================================================================
    // Refund for a charge without intent creates the payment by charge id
    // =========================================================================
    #[tokio::test]
    async fn test_refund_without_prior_payment() {
        let h = linked().await;
        let charge = GatewayCharge {
            id: "ch_9".to_string(),
            customer: Some("cus_1".to_string()),
            amount: 1000,
            amount_refunded: 400,
            currency: "usd".to_string(),
            status: "succeeded".to_string(),
            ..Default::default()
        };
        h.deliver("evt_1", "charge.refunded", &charge).await.unwrap();

        let payment = h.store.payment("ch_9").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(payment.amount, 1000);
        assert_eq!(payment.refunded_amount, 400);
    }
}

#[cfg(test)]
mod proration_tests {
    use std::collections::HashSet;

    use super::support::{harness, Harness};
    use crate::error::BillingError;
    use crate::gateway::types::GatewayPeriod;
    use crate::gateway::{GatewayInvoice, GatewayLineItem, IdempotencyKey, Page};
    use crate::models::InvoiceStatus;
    use crate::proration::{ProrationSettlement, PLAN_CHANGE_REQUEST_KEY};
    use crate::testing::{price, subscription, DAY, T0};

    const PERIOD_END: i64 = T0 + 30 * DAY;

    fn line(id: &str, amount: i64, start: i64, end: i64) -> GatewayLineItem {
        GatewayLineItem {
            id: id.to_string(),
            description: Some(id.to_string()),
            amount,
            currency: "usd".to_string(),
            period: GatewayPeriod {
                start: Some(start),
                end: Some(end),
            },
            proration: start < PERIOD_END,
            ..Default::default()
        }
    }

    fn proration_invoice(amount_due: i64) -> GatewayInvoice {
        GatewayInvoice {
            customer: "cus_1".to_string(),
            currency: "usd".to_string(),
            amount_due,
            total: amount_due,
            ..Default::default()
        }
    }

    /// Active Pro subscription known to both the gateway and the store
    async fn on_pro() -> Harness {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        h.gateway.add_subscription(sub.clone());
        h.gateway.add_price(price("price_lt_team", "lt_team", 9900));
        h.gateway.add_price(price("price_lt_basic", "lt_basic", 1900));
        h.deliver("evt_sub", "customer.subscription.created", &sub)
            .await
            .unwrap();
        h
    }

    // =========================================================================
    // Preview excludes the next cycle's regular charge
    // =========================================================================
    #[tokio::test]
    async fn test_preview_counts_current_period_only() {
        let h = on_pro().await;
        let mid = T0 + 15 * DAY;
        let mut preview = proration_invoice(12400);
        preview.lines = Page {
            data: vec![
                line("unused pro", -2450, mid, PERIOD_END),
                line("remaining team", 4950, mid, PERIOD_END),
                line("team next month", 9900, PERIOD_END, PERIOD_END + 30 * DAY),
            ],
            has_more: false,
        };
        h.gateway.set_preview(preview);

        let summary = h.billing.proration.preview("sub_1", "lt_team").await.unwrap();

        assert_eq!(summary.lines.len(), 2);
        assert_eq!(summary.amount_due, 4950);
        assert_eq!(summary.credit, 2450);
        assert_eq!(summary.net_amount_due, 2500);

        let calls = h.gateway.calls_to("preview_invoice");
        assert_eq!(calls[0].detail.as_deref(), Some("price_lt_team"));
        assert!(h.gateway.calls_to("update_subscription").is_empty());
    }

    // =========================================================================
    // Upgrade: invoice materialized, finalized and paid right away
    // =========================================================================
    #[tokio::test]
    async fn test_upgrade_charges_immediately() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(2500));

        let outcome = h
            .billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap();

        let invoice_id = match &outcome.settlement {
            ProrationSettlement::Charged { invoice_id, amount } => {
                assert_eq!(*amount, 2500);
                invoice_id.clone()
            }
            other => panic!("expected a charge, got {other:?}"),
        };

        let methods: Vec<&str> = h
            .gateway
            .calls()
            .iter()
            .map(|c| c.method)
            .filter(|m| *m != "retrieve_subscription")
            .collect();
        assert_eq!(
            methods,
            vec!["update_subscription", "create_invoice", "finalize_invoice", "pay_invoice"]
        );
        let update = &h.gateway.calls_to("update_subscription")[0];
        assert_eq!(update.detail.as_deref(), Some("price_lt_team:create_prorations"));

        assert_eq!(outcome.subscription.plan_id.as_deref(), Some("lt_team"));
        let licenses = h.active_licenses("user_1").await;
        assert_eq!(licenses.len(), 1);
        assert_eq!(licenses[0].plan_id, "lt_team");

        let local = h.store.invoice(&invoice_id).await.unwrap();
        assert_eq!(local.status, InvoiceStatus::Paid);
        assert_eq!(local.amount_paid, 2500);
    }

    // =========================================================================
    // Downgrade with pure credit: the zero-amount draft is deleted
    // =========================================================================
    #[tokio::test]
    async fn test_zero_amount_draft_is_deleted() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(0));

        let outcome = h
            .billing
            .proration
            .change_plan("sub_1", "lt_basic", "req_1")
            .await
            .unwrap();

        assert!(matches!(outcome.settlement, ProrationSettlement::NoCharge { .. }));
        assert_eq!(h.gateway.calls_to("delete_invoice").len(), 1);
        assert!(h.gateway.calls_to("finalize_invoice").is_empty());
        assert!(h.gateway.calls_to("pay_invoice").is_empty());
        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_basic");
    }

    // =========================================================================
    // Decline surfaces as an actionable validation error
    // =========================================================================
    #[tokio::test]
    async fn test_decline_is_actionable() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(2500));
        h.gateway
            .decline_payments("card_declined", "Your card was declined.");

        let err = h
            .billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap_err();

        match &err {
            BillingError::Validation(message) => assert!(message.contains("declined")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(err.user_message().contains("declined"));

        let invoice_id = h.gateway.calls_to("pay_invoice")[0].target.clone();
        assert_eq!(
            h.store.invoice(&invoice_id).await.unwrap().status,
            InvoiceStatus::Open
        );
    }

    // =========================================================================
    // Unknown plan: nothing is changed at the gateway
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_plan_rejected() {
        let h = on_pro().await;

        let err = h
            .billing
            .proration
            .change_plan("sub_1", "lt_enterprise", "req_1")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::UnknownPlan(_)));
        assert!(h.gateway.calls_to("update_subscription").is_empty());
        assert!(h.gateway.calls_to("create_invoice").is_empty());
    }

    // =========================================================================
    // Same plan is a validation error
    // =========================================================================
    #[tokio::test]
    async fn test_same_plan_rejected() {
        let h = on_pro().await;
        let err = h
            .billing
            .proration
            .preview("sub_1", "lt_pro")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // Idempotency keys derive from the request, one per gateway call
    // =========================================================================
    #[tokio::test]
    async fn test_plan_change_keys_are_derived() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(2500));
        h.billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap();

        let expected =
            IdempotencyKey::derived(&["plan_change", "sub_1", "lt_team", "req_1", "update"]);
        let update = &h.gateway.calls_to("update_subscription")[0];
        assert_eq!(update.idempotency_key.as_deref(), Some(expected.as_str()));

        let invoice_key = h.gateway.calls_to("create_invoice")[0].idempotency_key.clone();
        let pay_key = h.gateway.calls_to("pay_invoice")[0].idempotency_key.clone();
        assert!(invoice_key.is_some());
        assert_ne!(invoice_key, pay_key);
        assert_ne!(update.idempotency_key, invoice_key);

        // The request id is stamped on the subscription
        let stamped = h.gateway.subscription("sub_1").unwrap();
        assert_eq!(
            stamped.metadata.get(PLAN_CHANGE_REQUEST_KEY).map(String::as_str),
            Some("req_1")
        );
    }

    // =========================================================================
    // Back-and-forth changes in one period never share a key
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_changes_in_one_period_use_fresh_keys() {
        let h = on_pro().await;
        h.gateway.add_price(price("price_lt_pro", "lt_pro", 4900));
        let changes = [("lt_team", "req_1"), ("lt_pro", "req_2"), ("lt_team", "req_3")];

        for (plan, request) in changes {
            h.gateway.set_next_invoice(proration_invoice(2500));
            let outcome = h
                .billing
                .proration
                .change_plan("sub_1", plan, request)
                .await
                .unwrap();
            assert_eq!(outcome.subscription.plan_id.as_deref(), Some(plan));
            assert!(matches!(
                outcome.settlement,
                ProrationSettlement::Charged { .. }
            ));
        }

        for method in ["update_subscription", "create_invoice", "pay_invoice"] {
            let keys: HashSet<Option<String>> = h
                .gateway
                .calls_to(method)
                .into_iter()
                .map(|c| c.idempotency_key)
                .collect();
            assert_eq!(keys.len(), 3, "{method} reused a key");
        }
        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_team");
    }

    // =========================================================================
    // Invoice creation fails after the switch; the retry resumes there
    // =========================================================================
    #[tokio::test]
    async fn test_retry_after_invoice_failure_charges_once() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(2500));
        h.gateway.fail("create_invoice");

        let err = h
            .billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // The switch itself went through
        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_team");
        assert!(h.gateway.calls_to("pay_invoice").is_empty());

        h.gateway.recover("create_invoice");
        let outcome = h
            .billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap();

        assert!(matches!(
            outcome.settlement,
            ProrationSettlement::Charged { amount: 2500, .. }
        ));
        assert_eq!(h.gateway.calls_to("update_subscription").len(), 1);

        let invoices = h.gateway.calls_to("create_invoice");
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[0].idempotency_key, invoices[1].idempotency_key);
        assert_eq!(h.gateway.calls_to("pay_invoice").len(), 1);
    }

    // =========================================================================
    // A new request for the plan already in place is still rejected
    // =========================================================================
    #[tokio::test]
    async fn test_other_request_for_current_plan_rejected() {
        let h = on_pro().await;
        h.gateway.set_next_invoice(proration_invoice(2500));
        h.billing
            .proration
            .change_plan("sub_1", "lt_team", "req_1")
            .await
            .unwrap();

        let err = h
            .billing
            .proration
            .change_plan("sub_1", "lt_team", "req_2")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(h.gateway.calls_to("create_invoice").len(), 1);

        let err = h
            .billing
            .proration
            .change_plan("sub_1", "lt_pro", " ")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}

#[cfg(test)]
mod backfill_tests {
    use std::collections::HashMap;

    use super::support::{harness, harness_with_page_size};
    use crate::gateway::{GatewayCustomer, GatewayInvoice};
    use crate::models::SubscriptionStatus;
    use crate::plans::CUSTOMER_ID_KEY;
    use crate::reconcile::REPLACED_REASON;
    use crate::testing::{subscription, DAY, T0};

    // =========================================================================
    // Backfill of already-ingested objects changes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_backfill_after_webhooks_is_a_no_op() {
        let h = harness().await;
        let sub = subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0);
        let invoice = GatewayInvoice {
            id: Some("in_1".to_string()),
            customer: "cus_1".to_string(),
            subscription: Some("sub_1".to_string()),
            status: Some("paid".to_string()),
            currency: "usd".to_string(),
            amount_due: 4900,
            amount_paid: 4900,
            total: 4900,
            status_transitions: crate::gateway::types::GatewayStatusTransitions {
                finalized_at: Some(T0),
                paid_at: Some(T0 + 60),
            },
            created: T0,
            ..Default::default()
        };

        h.deliver("evt_1", "customer.subscription.created", &sub)
            .await
            .unwrap();
        h.deliver("evt_2", "invoice.paid", &invoice).await.unwrap();

        h.gateway.add_customer(GatewayCustomer {
            id: "cus_1".to_string(),
            metadata: HashMap::from([(CUSTOMER_ID_KEY.to_string(), "bc_1".to_string())]),
            ..Default::default()
        });
        h.gateway.add_subscription(sub);
        h.gateway.add_invoice(invoice);

        let before = h.store.snapshot().await;
        let report = h.billing.sync.run(None).await;

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.subscriptions.applied, 1);
        assert_eq!(report.invoices.applied, 1);
        assert_eq!(h.store.snapshot().await, before);
        assert!(h.gateway.calls_to("cancel_subscription").is_empty());
    }

    // =========================================================================
    // Cold start: paginated import, duplicates resolved as for webhooks
    // =========================================================================
    #[tokio::test]
    async fn test_cold_start_import_with_duplicates() {
        let h = harness_with_page_size(2).await;
        h.store.seed_customer("bc_2", "user_2", None).await.unwrap();

        h.gateway
            .add_subscription(subscription("sub_a", "cus_1", "bc_1", "active", "lt_pro", T0));
        h.gateway.add_subscription(subscription(
            "sub_b",
            "cus_2",
            "bc_2",
            "trialing",
            "lt_team",
            T0,
        ));
        h.gateway.add_subscription(subscription(
            "sub_c",
            "cus_1",
            "bc_1",
            "active",
            "lt_team",
            T0 + DAY,
        ));

        let report = h.billing.sync.run(None).await;

        assert!(report.is_clean());
        assert_eq!(report.subscriptions.seen, 3);
        let pages = h.gateway.calls_to("list_subscriptions");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].detail.as_deref(), Some("sub_b"));

        let a = h.store.subscription("sub_a").await.unwrap();
        assert_eq!(a.status, SubscriptionStatus::Canceled);
        assert_eq!(a.cancellation_reason.as_deref(), Some(REPLACED_REASON));
        assert_eq!(h.gateway.calls_to("cancel_subscription")[0].target, "sub_a");

        assert_eq!(h.active_licenses("user_1").await[0].plan_id, "lt_team");
        assert_eq!(h.active_licenses("user_2").await[0].plan_id, "lt_team");
    }

    // =========================================================================
    // Unresolvable objects are skipped, listing failures reported
    // =========================================================================
    #[tokio::test]
    async fn test_partial_failures_are_reported() {
        let h = harness().await;
        let mut orphan = subscription("sub_x", "cus_x", "bc_missing", "active", "lt_pro", T0);
        orphan.metadata.remove(CUSTOMER_ID_KEY);
        h.gateway.add_subscription(orphan);
        h.gateway
            .add_subscription(subscription("sub_1", "cus_1", "bc_1", "active", "lt_pro", T0));
        h.gateway.fail("list_invoices");

        let report = h.billing.sync.run(None).await;

        assert_eq!(report.subscriptions.seen, 2);
        assert_eq!(report.subscriptions.applied, 1);
        assert_eq!(report.subscriptions.skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].object, "invoice");
        assert!(h.store.subscription("sub_1").await.is_some());
    }

    // =========================================================================
    // Scoped sync passes the customer filter to the gateway
    // =========================================================================
    #[tokio::test]
    async fn test_scoped_sync_skips_customer_listing() {
        let h = harness().await;
        h.billing.sync.run(Some("cus_1")).await;

        assert!(h.gateway.calls_to("list_customers").is_empty());
        assert_eq!(h.gateway.calls_to("list_subscriptions").len(), 1);
    }
}
