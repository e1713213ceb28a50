//! Subscription state machine
//!
//! Status transitions are driven by the event type, not by polling.
//! Duplicate suppression keeps the most recently created active-like
//! subscription of a customer and cancels every other one at the gateway.
//! License grants swap plans in one store call so a user never sees two
//! active plans, or none, in between.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::{CancelMode, GatewaySubscription};
use crate::models::{BillingCustomer, BillingCycle, Subscription, SubscriptionStatus};

use super::{optional_timestamp, timestamp, Origin, ReconciliationEngine, REPLACED_REASON};

impl ReconciliationEngine {
    /// Apply a gateway subscription observed through `origin`.
    ///
    /// Returns the row as stored after the call.
    pub async fn apply_subscription(
        &self,
        sub: &GatewaySubscription,
        origin: Origin,
    ) -> BillingResult<Subscription> {
        let customer = self.subscription_owner(sub).await?;
        let _guard = self.locks.lock(&customer.id).await;

        let existing = self.store.find_subscription_by_external_id(&sub.id).await?;

        // Cancellation is terminal at the gateway. A created or updated
        // event that still reports the old state arrived out of order.
        if matches!(origin, Origin::Created | Origin::Updated) {
            if let Some(current) = existing.as_ref() {
                if current.status == SubscriptionStatus::Canceled {
                    tracing::info!(
                        subscription_id = %sub.id,
                        origin = ?origin,
                        incoming_status = %sub.status,
                        "Event for a canceled subscription, ignoring"
                    );
                    return Ok(current.clone());
                }
            }
        }

        let mut incoming = self.to_local(sub, &customer, existing.as_ref())?;
        if origin == Origin::Deleted {
            incoming.status = SubscriptionStatus::Canceled;
        }
        if incoming.status == SubscriptionStatus::Canceled && incoming.canceled_at.is_none() {
            incoming.canceled_at = Some(OffsetDateTime::now_utc());
        }

        if origin.checks_duplicates() && incoming.status.is_active_like() {
            self.suppress_duplicates(&customer, &mut incoming).await?;
        }

        let saved = match existing.as_ref() {
            Some(current) if current.same_state(&incoming) => current.clone(),
            _ => {
                let saved = self.store.upsert_subscription(&incoming).await?;
                tracing::info!(
                    subscription_id = %saved.external_subscription_id,
                    customer_id = %customer.id,
                    from = ?existing.as_ref().map(|s| s.status),
                    to = %saved.status,
                    plan_id = ?saved.plan_id,
                    origin = ?origin,
                    "Subscription reconciled"
                );
                saved
            }
        };

        self.sync_license(&customer, &saved, existing.as_ref())
            .await?;

        Ok(saved)
    }

    /// Owner of a subscription: the customer of the stored row if any,
    /// otherwise the regular resolution chain
    async fn subscription_owner(&self, sub: &GatewaySubscription) -> BillingResult<BillingCustomer> {
        if let Some(local) = self.store.find_subscription_by_external_id(&sub.id).await? {
            if let Some(customer) = self.store.find_customer(&local.billing_customer_id).await? {
                return Ok(customer);
            }
        }
        self.resolve_customer(&sub.customer, &sub.metadata).await
    }

    pub(crate) fn to_local(
        &self,
        sub: &GatewaySubscription,
        customer: &BillingCustomer,
        existing: Option<&Subscription>,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let item = sub.primary_item();
        let price = item.map(|i| &i.price);

        let billing_cycle = price
            .and_then(|p| p.recurring.as_ref())
            .map(|r| BillingCycle::from_interval(&r.interval, r.interval_count))
            .or(existing.map(|s| s.billing_cycle))
            .unwrap_or(BillingCycle::Monthly);

        let plan_id = self
            .plans
            .resolve_plan(sub)
            .or_else(|| existing.and_then(|s| s.plan_id.clone()));
        if plan_id.is_none() {
            tracing::warn!(
                subscription_id = %sub.id,
                price_id = ?price.map(|p| &p.id),
                "No plan resolves for subscription, no license will be granted"
            );
        }

        let currency = match price.map(|p| p.currency.to_lowercase()) {
            Some(c) if !c.is_empty() => c,
            _ => existing
                .map(|s| s.currency.clone())
                .unwrap_or_else(|| "usd".to_string()),
        };

        let status = SubscriptionStatus::from_gateway(&sub.status);
        let canceled_at = optional_timestamp(sub.canceled_at)?
            .or_else(|| existing.and_then(|s| s.canceled_at));

        Ok(Subscription {
            id: existing.map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            external_subscription_id: sub.id.clone(),
            billing_customer_id: customer.id.clone(),
            status,
            billing_cycle,
            plan_id,
            price_id: price.map(|p| p.id.clone()),
            unit_amount: price.and_then(|p| p.unit_amount).unwrap_or_default(),
            currency,
            current_period_start: timestamp(sub.current_period_start)?,
            current_period_end: timestamp(sub.current_period_end)?,
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: if status == SubscriptionStatus::Canceled {
                canceled_at
            } else {
                None
            },
            cancellation_reason: if status == SubscriptionStatus::Canceled {
                existing.and_then(|s| s.cancellation_reason.clone())
            } else {
                None
            },
            external_created_at: timestamp(sub.created)?,
            created_at: existing.map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        })
    }

    /// Cancel every active-like subscription of the customer except the
    /// newest one. Ties go to the incoming subscription.
    async fn suppress_duplicates(
        &self,
        customer: &BillingCustomer,
        incoming: &mut Subscription,
    ) -> BillingResult<()> {
        let others: Vec<Subscription> = self
            .store
            .list_active_subscriptions(&customer.id)
            .await?
            .into_iter()
            .filter(|s| s.external_subscription_id != incoming.external_subscription_id)
            .collect();

        if others.is_empty() {
            return Ok(());
        }

        let newest_other = others
            .iter()
            .max_by_key(|s| s.external_created_at)
            .map(|s| (s.id, s.external_created_at));
        let incoming_wins = newest_other
            .map_or(true, |(_, created)| incoming.external_created_at >= created);

        for other in &others {
            let survivor = !incoming_wins && newest_other.map(|(id, _)| id) == Some(other.id);
            if survivor {
                continue;
            }
            self.cancel_at_gateway(&other.external_subscription_id, customer)
                .await?;
            self.store
                .mark_subscription_canceled(other.id, REPLACED_REASON, OffsetDateTime::now_utc())
                .await?;
            if other.plan_id != incoming.plan_id {
                self.release_license(customer, other.plan_id.as_deref(), Some(other.id))
                    .await?;
            }
        }

        if !incoming_wins {
            self.cancel_at_gateway(&incoming.external_subscription_id, customer)
                .await?;
            incoming.status = SubscriptionStatus::Canceled;
            incoming.canceled_at = Some(OffsetDateTime::now_utc());
            incoming.cancellation_reason = Some(REPLACED_REASON.to_string());
        }

        Ok(())
    }

    async fn cancel_at_gateway(
        &self,
        external_subscription_id: &str,
        customer: &BillingCustomer,
    ) -> BillingResult<()> {
        tracing::warn!(
            subscription_id = %external_subscription_id,
            customer_id = %customer.id,
            "Duplicate active subscription, canceling at gateway"
        );
        match self
            .gateway
            .cancel_subscription(external_subscription_id, CancelMode::Immediately)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    subscription_id = %external_subscription_id,
                    "Duplicate already gone at gateway"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_license(
        &self,
        customer: &BillingCustomer,
        saved: &Subscription,
        previous: Option<&Subscription>,
    ) -> BillingResult<()> {
        match saved.status {
            status if status.is_active_like() => match saved.plan_id.as_deref() {
                Some(plan_id) => {
                    self.grant_license(&customer.user_id, plan_id, saved.current_period_end)
                        .await
                }
                None => Ok(()),
            },
            SubscriptionStatus::Canceled => {
                let mut plans = vec![saved.plan_id.as_deref()];
                if let Some(previous) = previous {
                    plans.push(previous.plan_id.as_deref());
                }
                plans.dedup();
                for plan in plans {
                    self.release_license(customer, plan, Some(saved.id)).await?;
                }
                Ok(())
            }
            // Past due and paused keep the current entitlement while the
            // gateway runs its own dunning
            _ => Ok(()),
        }
    }

    /// Make `plan_id` the user's only active license
    pub(crate) async fn grant_license(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let replaced = self
            .licenses
            .activate_exclusive(user_id, plan_id, Some(expires_at))
            .await?;
        for previous in replaced {
            tracing::info!(
                user_id = %user_id,
                plan_id = %previous,
                replaced_by = %plan_id,
                "License deactivated"
            );
        }
        Ok(())
    }

    /// Deactivate the license for `plan_id` unless another active-like
    /// subscription of the customer still grants it
    async fn release_license(
        &self,
        customer: &BillingCustomer,
        plan_id: Option<&str>,
        ending: Option<Uuid>,
    ) -> BillingResult<()> {
        let Some(plan_id) = plan_id else {
            return Ok(());
        };

        let still_granted = self
            .store
            .list_active_subscriptions(&customer.id)
            .await?
            .iter()
            .any(|s| Some(s.id) != ending && s.plan_id.as_deref() == Some(plan_id));
        if still_granted {
            return Ok(());
        }

        if self
            .licenses
            .active_plans(&customer.user_id)
            .await?
            .iter()
            .any(|p| p == plan_id)
        {
            self.licenses
                .deactivate_license(&customer.user_id, plan_id)
                .await?;
            tracing::info!(
                user_id = %customer.user_id,
                plan_id = %plan_id,
                "License deactivated"
            );
        }
        Ok(())
    }
}
