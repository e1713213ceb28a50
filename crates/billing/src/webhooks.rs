//! Webhook ingestion
//!
//! Every notification is verified, logged in the event store and then
//! handed to the processor. The `processed` flag gates side effects: the
//! gateway delivers at least once, handlers run at most once per event id.
//! Concurrent deliveries of one event race for a processing claim in the
//! store; only the winner runs the handlers.

use std::sync::Arc;

use serde::Serialize;
use time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayEvent, PaymentGateway};
use crate::models::WebhookEventRecord;
use crate::reconcile::EventProcessor;
use crate::store::BillingStore;

/// Result of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Processed,
    /// Seen and processed before, handlers skipped
    AlreadyProcessed,
    /// Customer did not resolve; kept unprocessed for manual replay
    Dropped,
    /// Another delivery of the same event holds the processing claim
    InProgress,
}

/// A claim older than this is treated as abandoned by a crashed worker
const CLAIM_TIMEOUT: Duration = Duration::minutes(30);

/// Webhook handler for gateway events
pub struct WebhookHandler {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn EventProcessor>,
}

impl WebhookHandler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        Self {
            gateway,
            store,
            processor,
        }
    }

    /// Handle a raw delivery.
    ///
    /// An invalid signature fails before the event store is touched. Any
    /// other error is recorded on the event and returned so the caller
    /// answers non-2xx and the gateway redelivers.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<IngestOutcome> {
        let event = match self.gateway.verify_webhook(payload, signature) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected webhook delivery");
                return Err(e);
            }
        };

        if let Some(record) = self.store.find_webhook_event(&event.id).await? {
            if record.processed {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, already processed"
                );
                return Ok(IngestOutcome::AlreadyProcessed);
            }
        }

        self.store
            .record_webhook_event(&event.id, event.event_type.as_str(), payload)
            .await?;

        if let Some(outcome) = self.claim(&event).await? {
            return Ok(outcome);
        }
        self.run(&event).await
    }

    /// Re-run a stored event from its raw payload. It was verified on
    /// receipt, so the signature is not checked again.
    pub async fn replay(&self, external_event_id: &str) -> BillingResult<IngestOutcome> {
        let record = self
            .store
            .find_webhook_event(external_event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {external_event_id}")))?;

        if record.processed {
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        let event = GatewayEvent::from_json(&record.payload)?;
        if let Some(outcome) = self.claim(&event).await? {
            return Ok(outcome);
        }
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempts = record.attempts,
            "Replaying webhook event"
        );
        self.run(&event).await
    }

    /// Unprocessed events with at least one failed attempt, oldest first
    pub async fn list_failed(&self, limit: i64, offset: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store
            .list_failed_webhooks(limit.clamp(1, 500), offset.max(0))
            .await
    }

    /// Take the processing claim. `Some` is the outcome to report when
    /// another delivery got there first.
    async fn claim(&self, event: &GatewayEvent) -> BillingResult<Option<IngestOutcome>> {
        if self
            .store
            .claim_webhook_event(&event.id, CLAIM_TIMEOUT)
            .await?
        {
            return Ok(None);
        }

        let processed = self
            .store
            .find_webhook_event(&event.id)
            .await?
            .is_some_and(|record| record.processed);
        let outcome = if processed {
            IngestOutcome::AlreadyProcessed
        } else {
            IngestOutcome::InProgress
        };
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Duplicate webhook delivery, claim held elsewhere"
        );
        Ok(Some(outcome))
    }

    async fn run(&self, event: &GatewayEvent) -> BillingResult<IngestOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match self.processor.process(event).await {
            Ok(()) => {
                self.store.mark_webhook_processed(&event.id).await?;
                Ok(IngestOutcome::Processed)
            }
            Err(BillingError::UnresolvableCustomer(customer)) => {
                let message = format!("no billing customer resolves for {customer}");
                self.store
                    .record_webhook_failure(&event.id, &message)
                    .await?;
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    external_customer_id = %customer,
                    "Dropped webhook event, needs manual reconciliation"
                );
                Ok(IngestOutcome::Dropped)
            }
            Err(e) => {
                if let Err(record_err) = self
                    .store
                    .record_webhook_failure(&event.id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        event_id = %event.id,
                        error = %record_err,
                        "Failed to record webhook failure"
                    );
                }
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event processing failed"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::store::MemoryBillingStore;
    use crate::testing::{event_json, sign, MockGateway};

    /// Counts invocations and fails on demand
    #[derive(Default)]
    struct CountingProcessor {
        calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl EventProcessor for CountingProcessor {
        async fn process(&self, _event: &GatewayEvent) -> BillingResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(BillingError::Transient("database busy".to_string()));
            }
            Ok(())
        }
    }

    /// Parks inside the handler until released
    #[derive(Default)]
    struct GatedProcessor {
        calls: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl EventProcessor for GatedProcessor {
        async fn process(&self, _event: &GatewayEvent) -> BillingResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    fn handler(processor: Arc<dyn EventProcessor>) -> (WebhookHandler, MemoryBillingStore) {
        let store = MemoryBillingStore::new();
        let handler = WebhookHandler::new(
            Arc::new(MockGateway::new()),
            Arc::new(store.clone()),
            processor,
        );
        (handler, store)
    }

    fn payload(id: &str) -> String {
        event_json(id, "customer.deleted", &serde_json::json!({ "id": "cus_1" }))
    }

    #[tokio::test]
    async fn test_second_delivery_skips_handlers() {
        let processor = Arc::new(CountingProcessor::default());
        let (handler, _store) = handler(processor.clone());
        let body = payload("evt_1");

        let first = handler.handle(&body, &sign(&body)).await.unwrap();
        let second = handler.handle(&body, &sign(&body)).await.unwrap();

        assert_eq!(first, IngestOutcome::Processed);
        assert_eq!(second, IngestOutcome::AlreadyProcessed);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_run_handlers_once() {
        let processor = Arc::new(GatedProcessor::default());
        let (handler, store) = handler(processor.clone());
        let body = payload("evt_1");
        let signature = sign(&body);

        let first = handler.handle(&body, &signature);
        let second = async {
            // Wait until the first delivery is inside the handler
            while processor.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            let outcome = handler.handle(&body, &signature).await;
            processor.gate.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), IngestOutcome::Processed);
        assert_eq!(second.unwrap(), IngestOutcome::InProgress);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        let record = store.find_webhook_event("evt_1").await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.processing_started_at.is_none());
    }

    #[tokio::test]
    async fn test_invalid_signature_never_reaches_store() {
        let processor = Arc::new(CountingProcessor::default());
        let (handler, store) = handler(processor.clone());
        let body = payload("evt_1");

        let err = handler.handle(&body, "t=1,v1=deadbeef").await.unwrap_err();

        assert!(matches!(err, BillingError::InvalidSignature));
        assert!(store.find_webhook_event("evt_1").await.unwrap().is_none());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_counts_attempts_and_redelivery_retries() {
        let processor = Arc::new(CountingProcessor::default());
        processor.fail_first.store(1, Ordering::SeqCst);
        let (handler, store) = handler(processor.clone());
        let body = payload("evt_1");

        let err = handler.handle(&body, &sign(&body)).await.unwrap_err();
        assert!(err.is_retryable());

        let record = store.find_webhook_event("evt_1").await.unwrap().unwrap();
        assert!(!record.processed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("database busy"));
        assert_eq!(handler.list_failed(10, 0).await.unwrap().len(), 1);

        let outcome = handler.handle(&body, &sign(&body)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Processed);
        assert!(store.find_webhook_event("evt_1").await.unwrap().unwrap().processed);
        assert!(handler.list_failed(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_uses_stored_payload() {
        let processor = Arc::new(CountingProcessor::default());
        processor.fail_first.store(1, Ordering::SeqCst);
        let (handler, store) = handler(processor.clone());
        let body = payload("evt_1");

        handler.handle(&body, &sign(&body)).await.unwrap_err();
        let outcome = handler.replay("evt_1").await.unwrap();

        assert_eq!(outcome, IngestOutcome::Processed);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(store.find_webhook_event("evt_1").await.unwrap().unwrap().processed);

        assert_eq!(
            handler.replay("evt_1").await.unwrap(),
            IngestOutcome::AlreadyProcessed
        );
        assert!(handler.replay("evt_missing").await.unwrap_err().is_not_found());
    }
}
