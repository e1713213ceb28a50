// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::Declined carries the gateway's message
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CRM Billing Reconciliation
//!
//! Keeps the CRM's subscription, invoice and payment tables in step with an
//! external payment processor.
//!
//! ## Features
//!
//! - **Gateway**: processor-neutral verbs with a Stripe adapter, idempotency
//!   keys and transient retry
//! - **Webhooks**: signature check, event log, at-most-once side effects
//! - **Reconciliation**: subscription state machine, duplicate suppression,
//!   license exclusivity, invoice and payment mirroring
//! - **Proration**: preview and immediate settlement of mid-cycle plan changes
//! - **Backfill**: cursor-paginated full sync through the same upserts
//! - **Invariants**: read-only consistency checks

pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod models;
pub mod plans;
pub mod proration;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::stripe::StripeGateway;
pub use gateway::{CancelMode, GatewayEvent, IdempotencyKey, PaymentGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    BillingCustomer, BillingCycle, Invoice, InvoiceLineItem, InvoiceStatus, Payment,
    PaymentStatus, Subscription, SubscriptionStatus, UserLicense, WebhookEventRecord,
};

// Plans
pub use plans::{PlanCatalog, PlanDefinition};

// Proration
pub use proration::{
    PlanChangeOutcome, ProrationCalculator, ProrationLine, ProrationSettlement, ProrationSummary,
    PLAN_CHANGE_REQUEST_KEY,
};

// Reconciliation
pub use reconcile::{EventProcessor, Origin, ReconciliationEngine};

// Store
pub use store::{BillingStore, CustomerDirectory, LicenseSink, PgBillingStore};

// Sync
pub use sync::{BackfillSync, SyncReport};

// Webhooks
pub use webhooks::{IngestOutcome, WebhookHandler};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub engine: Arc<ReconciliationEngine>,
    pub webhooks: WebhookHandler,
    pub proration: ProrationCalculator,
    pub sync: BackfillSync,
}

impl BillingService {
    /// Production wiring: Stripe gateway and Postgres for every store seam
    pub fn new(config: &BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(config)?);
        let store = Arc::new(PgBillingStore::new(pool));

        Ok(Self::from_parts(
            gateway,
            store.clone(),
            store.clone(),
            store,
            config.plans.clone(),
            config.backfill_page_size,
        ))
    }

    /// Create a billing service from explicit collaborators
    pub fn from_parts(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        licenses: Arc<dyn LicenseSink>,
        directory: Arc<dyn CustomerDirectory>,
        plans: PlanCatalog,
        page_size: u32,
    ) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(
            gateway.clone(),
            store.clone(),
            licenses,
            directory,
            plans,
        ));

        Self {
            webhooks: WebhookHandler::new(gateway.clone(), store, engine.clone()),
            proration: ProrationCalculator::new(gateway.clone(), engine.clone()),
            sync: BackfillSync::new(gateway, engine.clone(), page_size),
            engine,
        }
    }
}
