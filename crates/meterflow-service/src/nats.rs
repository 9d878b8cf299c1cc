//! JetStream plumbing: stream setup and the inbound usage source
//!
//! Each bus message carries one batch, a JSON array of usage events. Batches
//! that cannot be ingested for good are republished to the dead-letter subject
//! wrapped with the rejection reason, then terminated so they never redeliver.

use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    AckKind, Message,
};
use async_trait::async_trait;
use futures::StreamExt;
use meterflow_billing::{BatchDisposition, DeliveredBatch, UsageBatchSource};
use meterflow_common::{
    MeterflowError, UsageEvent, BILLING_EVENTS_SUBJECT, USAGE_EVENTS_DLQ_SUBJECT,
    USAGE_EVENTS_SUBJECT,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Create the usage and billing streams if missing
pub async fn ensure_streams(
    jetstream: &jetstream::Context,
    usage_stream: &str,
    billing_stream: &str,
) -> Result<()> {
    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: usage_stream.to_string(),
            subjects: vec![
                USAGE_EVENTS_SUBJECT.to_string(),
                USAGE_EVENTS_DLQ_SUBJECT.to_string(),
            ],
            description: Some("Inbound usage batches and dead letters".to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to ensure stream {}: {}", usage_stream, e))?;

    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: billing_stream.to_string(),
            subjects: vec![BILLING_EVENTS_SUBJECT.to_string()],
            description: Some("Billing notifications".to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to ensure stream {}: {}", billing_stream, e))?;

    info!(usage_stream, billing_stream, "JetStream streams ready");
    Ok(())
}

#[derive(Serialize)]
struct DeadLetter<'a> {
    reason: &'a str,
    delivery_id: &'a str,
    payload: String,
}

/// Pull consumer over the usage subject
pub struct JetStreamUsageSource {
    jetstream: jetstream::Context,
    consumer: PullConsumer,
    max_wait: Duration,
}

impl JetStreamUsageSource {
    pub async fn new(
        jetstream: jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
        max_wait: Duration,
    ) -> Result<Self> {
        let stream = jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get stream {}: {}", stream_name, e))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: USAGE_EVENTS_SUBJECT.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create usage consumer: {}", e))?;

        info!(stream = stream_name, consumer = consumer_name, "Usage consumer ready");
        Ok(Self {
            jetstream,
            consumer,
            max_wait,
        })
    }

    fn delivery_id(message: &Message) -> String {
        match message.info() {
            Ok(info) => format!("{}#{}", info.stream, info.stream_sequence),
            Err(_) => message.subject.to_string(),
        }
    }

    async fn dead_letter(&self, message: &Message, delivery_id: &str, reason: &str) -> meterflow_common::Result<()> {
        let letter = DeadLetter {
            reason,
            delivery_id,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        };
        let body = serde_json::to_vec(&letter)?;

        let ack = self
            .jetstream
            .publish(USAGE_EVENTS_DLQ_SUBJECT.to_string(), body.into())
            .await
            .map_err(|e| MeterflowError::Publish(e.to_string()))?;
        ack.await
            .map_err(|e| MeterflowError::Publish(e.to_string()))?;

        warn!(%delivery_id, reason, "Usage batch dead-lettered");
        Ok(())
    }

    async fn terminate(&self, message: &Message) -> meterflow_common::Result<()> {
        message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| MeterflowError::Internal(format!("term failed: {}", e)))
    }
}

#[async_trait]
impl UsageBatchSource for JetStreamUsageSource {
    type Token = Message;

    async fn next_batch(&self) -> meterflow_common::Result<Option<DeliveredBatch<Message>>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(self.max_wait)
            .messages()
            .await
            .map_err(|e| MeterflowError::Internal(format!("fetch failed: {}", e)))?;

        let message = match messages.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Err(MeterflowError::Internal(format!("receive failed: {}", e)));
            }
            None => return Ok(None),
        };

        let delivery_id = Self::delivery_id(&message);
        match serde_json::from_slice::<Vec<UsageEvent>>(&message.payload) {
            Ok(events) => {
                debug!(%delivery_id, events = events.len(), "Received usage batch");
                Ok(Some(DeliveredBatch {
                    delivery_id,
                    events,
                    token: message,
                }))
            }
            Err(e) => {
                // Undecodable payloads can never succeed
                let reason = format!("undecodable batch: {}", e);
                self.dead_letter(&message, &delivery_id, &reason).await?;
                self.terminate(&message).await?;
                Ok(None)
            }
        }
    }

    async fn settle(
        &self,
        batch: DeliveredBatch<Message>,
        disposition: BatchDisposition,
    ) -> meterflow_common::Result<()> {
        let message = batch.token;
        match disposition {
            BatchDisposition::Ack => message
                .ack()
                .await
                .map_err(|e| MeterflowError::Internal(format!("ack failed: {}", e))),
            BatchDisposition::Retry => message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| MeterflowError::Internal(format!("nak failed: {}", e))),
            BatchDisposition::Reject { reason } => {
                if let Err(e) = self.dead_letter(&message, &batch.delivery_id, &reason).await {
                    // Leave the batch for redelivery rather than lose it
                    warn!(delivery_id = %batch.delivery_id, error = %e, "Dead-letter publish failed");
                    return message
                        .ack_with(AckKind::Nak(None))
                        .await
                        .map_err(|e| MeterflowError::Internal(format!("nak failed: {}", e)));
                }
                self.terminate(&message).await
            }
        }
    }
}
