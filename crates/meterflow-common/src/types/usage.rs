//! Usage events - metered consumption reported by metering clients
//!
//! A usage event is immutable once created. The pipeline never updates or
//! deletes stored usage; it only appends and reads by customer and time window.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeterflowError, Result};

/// Usage event representing metered consumption of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Opaque producer-assigned token
    pub event_id: String,
    /// Customer being metered
    pub customer_id: Uuid,
    /// Resource tag (e.g. "cpu", "storage")
    pub resource_type: String,
    /// Quantity consumed
    pub quantity: Decimal,
    /// Unit of `quantity` (e.g. "core-hour", "GB")
    pub unit: String,
    /// Price per unit; `None` means free
    #[serde(default)]
    pub unit_price: Option<Decimal>,
    /// Event time (not ingestion time)
    pub timestamp: DateTime<Utc>,
    /// Additional producer metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl UsageEvent {
    /// Create a new usage event stamped with the current time
    pub fn new(
        customer_id: Uuid,
        resource_type: impl Into<String>,
        quantity: Decimal,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            customer_id,
            resource_type: resource_type.into(),
            quantity,
            unit: unit.into(),
            unit_price: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the unit price
    pub fn with_unit_price(mut self, unit_price: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self
    }

    /// Set the event time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the event id
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Cost of this event, `quantity × unit_price` (zero when free)
    pub fn cost(&self) -> Result<Decimal> {
        match self.unit_price {
            Some(price) => self.quantity.checked_mul(price).ok_or_else(|| {
                MeterflowError::ArithmeticOverflow(format!(
                    "event {}: {} x {}",
                    self.event_id, self.quantity, price
                ))
            }),
            None => Ok(Decimal::ZERO),
        }
    }

    /// Validate the event
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_empty() {
            return Err(MeterflowError::Validation("event_id is required".into()));
        }
        if self.customer_id.is_nil() {
            return Err(MeterflowError::Validation(format!(
                "event {}: customer_id is required",
                self.event_id
            )));
        }
        if self.resource_type.is_empty() {
            return Err(MeterflowError::Validation(format!(
                "event {}: resource_type is required",
                self.event_id
            )));
        }
        if self.unit.is_empty() {
            return Err(MeterflowError::Validation(format!(
                "event {}: unit is required",
                self.event_id
            )));
        }
        if self.quantity < Decimal::ZERO {
            return Err(MeterflowError::Validation(format!(
                "event {}: quantity cannot be negative",
                self.event_id
            )));
        }
        if let Some(price) = self.unit_price {
            if price < Decimal::ZERO {
                return Err(MeterflowError::Validation(format!(
                    "event {}: unit_price cannot be negative",
                    self.event_id
                )));
            }
        }
        // An event whose cost cannot be represented can never be billed
        if let Err(e) = self.cost() {
            return Err(MeterflowError::Validation(format!(
                "event {}: cost not representable ({})",
                self.event_id, e
            )));
        }
        Ok(())
    }
}

/// Persisted usage event with store-assigned identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUsageRecord {
    /// Sequential store-assigned id
    pub id: u64,
    /// The event as delivered
    pub event: UsageEvent,
    /// When the store accepted the row
    pub ingested_at: DateTime<Utc>,
}

impl StoredUsageRecord {
    /// Whether the event time falls in `[start, end)`
    pub fn in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.event.timestamp >= start && self.event.timestamp < end
    }
}
