//! Outbound billing notifications
//!
//! Delivery is best-effort: callers persist first and treat a publish failure
//! as logged, never as a reason to roll back.

use async_nats::jetstream;
use async_trait::async_trait;
use meterflow_common::{BillingCalculatedEvent, MeterflowError, Result, BILLING_EVENTS_SUBJECT};
use parking_lot::Mutex;
use tracing::debug;

/// Sink for `BillingCalculatedEvent`s
#[async_trait]
pub trait BillingEventPublisher: Send + Sync {
    async fn publish(&self, event: &BillingCalculatedEvent) -> Result<()>;
}

/// JetStream publisher, JSON payloads
pub struct NatsBillingPublisher {
    jetstream: jetstream::Context,
    subject: String,
}

impl NatsBillingPublisher {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self::with_subject(jetstream, BILLING_EVENTS_SUBJECT)
    }

    pub fn with_subject(jetstream: jetstream::Context, subject: impl Into<String>) -> Self {
        Self {
            jetstream,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl BillingEventPublisher for NatsBillingPublisher {
    async fn publish(&self, event: &BillingCalculatedEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;

        debug!(
            subject = %self.subject,
            invoice_number = %event.invoice_number,
            size_bytes = payload.len(),
            "Publishing billing event"
        );

        let ack = self
            .jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| MeterflowError::Publish(e.to_string()))?;

        // Wait for the stream to persist the message
        ack.await
            .map_err(|e| MeterflowError::Publish(e.to_string()))?;

        Ok(())
    }
}

/// Publisher that keeps events in memory
#[derive(Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<BillingCalculatedEvent>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<BillingCalculatedEvent> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BillingEventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &BillingCalculatedEvent) -> Result<()> {
        self.published.lock().push(event.clone());
        Ok(())
    }
}
