//! Plan catalog
//!
//! Maps gateway prices onto the CRM's license types.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewaySubscription;
use crate::models::BillingCycle;

/// Metadata key carrying the license type on prices and subscriptions
pub const LICENSE_TYPE_KEY: &str = "licenseTypeId";

/// Metadata key carrying the internal customer id
pub const CUSTOMER_ID_KEY: &str = "customerId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    /// License type granted by this plan
    pub plan_id: String,
    pub name: String,
    #[serde(default)]
    pub price_ids: Vec<String>,
    pub unit_amount: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    /// Parse the `BILLING_PLANS` JSON array
    pub fn from_json(json: &str) -> BillingResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid plan catalog: {e}")))
    }

    pub fn plans(&self) -> &[PlanDefinition] {
        &self.plans
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn contains(&self, plan_id: &str) -> bool {
        self.plans.iter().any(|p| p.plan_id == plan_id)
    }

    pub fn by_price_id(&self, price_id: &str) -> Option<&PlanDefinition> {
        self.plans
            .iter()
            .find(|p| p.price_ids.iter().any(|id| id == price_id))
    }

    pub fn by_amount(
        &self,
        unit_amount: i64,
        currency: &str,
        cycle: BillingCycle,
    ) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| {
            p.unit_amount == unit_amount
                && p.currency.eq_ignore_ascii_case(currency)
                && p.billing_cycle == cycle
        })
    }

    /// Price to switch to for a plan change. Falls back to any cycle when
    /// the plan is not offered on the requested one.
    pub fn price_for(&self, plan_id: &str, cycle: BillingCycle) -> Option<&str> {
        let mut candidates = self.plans.iter().filter(|p| p.plan_id == plan_id);
        let exact = self
            .plans
            .iter()
            .filter(|p| p.plan_id == plan_id && p.billing_cycle == cycle)
            .find_map(|p| p.price_ids.first());

        exact
            .or_else(|| candidates.find_map(|p| p.price_ids.first()))
            .map(String::as_str)
    }

    /// Derive the plan identity of a gateway subscription.
    ///
    /// Order: price metadata, catalog price id, catalog amount and
    /// interval, subscription metadata.
    pub fn resolve_plan(&self, subscription: &GatewaySubscription) -> Option<String> {
        if let Some(item) = subscription.primary_item() {
            let price = &item.price;

            if let Some(plan) = price.metadata.get(LICENSE_TYPE_KEY) {
                return Some(plan.clone());
            }

            if let Some(plan) = self.by_price_id(&price.id) {
                return Some(plan.plan_id.clone());
            }

            if let (Some(amount), Some(recurring)) = (price.unit_amount, price.recurring.as_ref())
            {
                let cycle = BillingCycle::from_interval(&recurring.interval, recurring.interval_count);
                if let Some(plan) = self.by_amount(amount, &price.currency, cycle) {
                    return Some(plan.plan_id.clone());
                }
            }
        }

        subscription.metadata.get(LICENSE_TYPE_KEY).cloned()
    }
}
