//! Customer resolution and external id linking

use std::collections::HashMap;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayCheckoutSession, GatewayCustomer};
use crate::models::BillingCustomer;
use crate::plans::CUSTOMER_ID_KEY;

use super::ReconciliationEngine;

impl ReconciliationEngine {
    /// Find the local customer behind a gateway customer.
    ///
    /// Tries the stored link, then the `customerId` metadata, then the CRM
    /// directory. A customer found by either fallback gets its external id
    /// written back, so the next event resolves directly.
    pub(crate) async fn resolve_customer(
        &self,
        external_customer_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<BillingCustomer> {
        if !external_customer_id.is_empty() {
            if let Some(customer) = self
                .store
                .find_customer_by_external_id(external_customer_id)
                .await?
            {
                return Ok(customer);
            }
        }

        if let Some(internal_id) = metadata.get(CUSTOMER_ID_KEY) {
            if let Some(customer) = self.store.find_customer(internal_id).await? {
                return self.backfill_link(customer, external_customer_id).await;
            }
            tracing::warn!(
                customer_id = %internal_id,
                external_customer_id = %external_customer_id,
                "Metadata names a customer that does not exist"
            );
        }

        if !external_customer_id.is_empty() {
            if let Some(internal_id) = self
                .directory
                .resolve_internal_customer_id(external_customer_id)
                .await?
            {
                if let Some(customer) = self.store.find_customer(&internal_id).await? {
                    return self.backfill_link(customer, external_customer_id).await;
                }
            }
        }

        tracing::warn!(
            external_customer_id = %external_customer_id,
            "No billing customer resolves, dropping"
        );
        Err(BillingError::UnresolvableCustomer(
            external_customer_id.to_string(),
        ))
    }

    async fn backfill_link(
        &self,
        mut customer: BillingCustomer,
        external_customer_id: &str,
    ) -> BillingResult<BillingCustomer> {
        if external_customer_id.is_empty()
            || customer.external_customer_id.as_deref() == Some(external_customer_id)
        {
            return Ok(customer);
        }

        self.store
            .link_external_customer(&customer.id, external_customer_id)
            .await?;
        self.directory
            .link_external_customer_id(&customer.id, external_customer_id)
            .await?;

        tracing::info!(
            customer_id = %customer.id,
            external_customer_id = %external_customer_id,
            previous = ?customer.external_customer_id,
            "Linked billing customer to gateway customer"
        );

        customer.external_customer_id = Some(external_customer_id.to_string());
        Ok(customer)
    }

    /// `customer.created` / `customer.updated`
    pub async fn link_customer(&self, customer: &GatewayCustomer) -> BillingResult<()> {
        match customer.metadata.get(CUSTOMER_ID_KEY) {
            Some(internal_id) => self.link_internal(internal_id, &customer.id).await,
            None => {
                tracing::debug!(
                    external_customer_id = %customer.id,
                    "Gateway customer carries no CRM customer id"
                );
                Ok(())
            }
        }
    }

    /// `checkout.session.completed`
    pub async fn link_checkout_session(
        &self,
        session: &GatewayCheckoutSession,
    ) -> BillingResult<()> {
        let Some(external_customer_id) = session.customer.as_deref() else {
            tracing::debug!(session_id = %session.id, "Checkout session without customer");
            return Ok(());
        };

        let internal_id = session
            .metadata
            .get(CUSTOMER_ID_KEY)
            .or(session.client_reference_id.as_ref());

        match internal_id {
            Some(internal_id) => self.link_internal(internal_id, external_customer_id).await,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    external_customer_id = %external_customer_id,
                    "Checkout session does not name a CRM customer"
                );
                Ok(())
            }
        }
    }

    async fn link_internal(
        &self,
        internal_id: &str,
        external_customer_id: &str,
    ) -> BillingResult<()> {
        let customer = self
            .store
            .find_customer(internal_id)
            .await?
            .ok_or_else(|| BillingError::UnresolvableCustomer(external_customer_id.to_string()))?;
        self.backfill_link(customer, external_customer_id).await?;
        Ok(())
    }
}
