//! Billing records - one bill per customer per closed calendar period
//!
//! Key characteristics:
//! - At most one record per (customer, period start, period end)
//! - Status only moves forward: Pending → Issued → Paid
//! - Amounts are exact decimals, never negative
//! - Records are never mutated or deleted by the pipeline once written

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeterflowError, Result};
use crate::INVOICE_GRACE_DAYS;

/// Closed calendar date range `[start, end]` billed as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// Create a period, rejecting an end before the start
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(MeterflowError::Validation(format!(
                "period end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The full calendar month containing `date`
    pub fn month_of(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        let mut end = date;
        while let Some(next) = end.succ_opt() {
            if next.month() != date.month() {
                break;
            }
            end = next;
        }
        Self { start, end }
    }

    /// First instant of the period, 00:00:00 UTC on `start`
    pub fn window_start(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant after the period, 00:00:00 UTC on the day after `end`
    ///
    /// Reads use the half-open window `[window_start, window_end)` so every
    /// instant of the last day is included.
    pub fn window_end(&self) -> DateTime<Utc> {
        (self.end + Duration::days(1)).and_time(NaiveTime::MIN).and_utc()
    }

    /// Invoice due date for this period
    pub fn due_date(&self, grace_days: i64) -> NaiveDate {
        self.end + Duration::days(grace_days)
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Billing record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatus {
    Pending,
    Issued,
    Paid,
}

/// Billing record for one customer and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    /// System-assigned id (time-ordered)
    pub id: Uuid,
    pub customer_id: Uuid,
    pub period: BillingPeriod,
    /// Sum of resource costs
    pub total_amount: Decimal,
    pub status: BillingStatus,
    /// Globally unique invoice number
    pub invoice_number: String,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl BillingRecord {
    /// Create a pending record due `INVOICE_GRACE_DAYS` after the period ends
    pub fn pending(
        customer_id: Uuid,
        period: BillingPeriod,
        total_amount: Decimal,
        invoice_number: String,
    ) -> Result<Self> {
        if total_amount < Decimal::ZERO {
            return Err(MeterflowError::Validation(format!(
                "total amount {} for customer {} is negative",
                total_amount, customer_id
            )));
        }

        Ok(Self {
            id: Uuid::now_v7(),
            customer_id,
            period,
            total_amount,
            status: BillingStatus::Pending,
            invoice_number,
            due_date: period.due_date(INVOICE_GRACE_DAYS),
            paid_date: None,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        })
    }

    /// Override the due date grace interval
    pub fn with_grace_days(mut self, grace_days: i64) -> Self {
        self.due_date = self.period.due_date(grace_days);
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Billing record joined with customer display data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecordView {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub total_amount: Decimal,
    pub status: BillingStatus,
    pub invoice_number: String,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
}

impl BillingRecordView {
    pub fn new(record: &BillingRecord, customer_name: &str) -> Self {
        Self {
            id: record.id,
            customer_id: record.customer_id,
            customer_name: customer_name.to_string(),
            billing_period_start: record.period.start,
            billing_period_end: record.period.end,
            total_amount: record.total_amount,
            status: record.status,
            invoice_number: record.invoice_number.clone(),
            due_date: record.due_date,
            paid_date: record.paid_date,
        }
    }
}

/// Outbound notification emitted once per created billing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCalculatedEvent {
    pub event_id: Uuid,
    pub billing_record_id: Uuid,
    pub customer_id: Uuid,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub total_amount: Decimal,
    pub status: String,
    pub invoice_number: String,
    pub timestamp: DateTime<Utc>,
}

impl BillingCalculatedEvent {
    pub const STATUS: &'static str = "CALCULATED";

    pub fn from_record(record: &BillingRecord) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            billing_record_id: record.id,
            customer_id: record.customer_id,
            billing_period_start: record.period.start,
            billing_period_end: record.period.end,
            total_amount: record.total_amount,
            status: Self::STATUS.to_string(),
            invoice_number: record.invoice_number.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_month_of() {
        let period = BillingPeriod::month_of(date(2024, 2, 14));
        assert_eq!(period.start, date(2024, 2, 1));
        assert_eq!(period.end, date(2024, 2, 29));

        let period = BillingPeriod::month_of(date(2023, 12, 31));
        assert_eq!(period.start, date(2023, 12, 1));
        assert_eq!(period.end, date(2023, 12, 31));
    }

    #[test]
    fn test_period_window_covers_last_day() {
        let period = BillingPeriod::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        assert_eq!(period.window_start().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(period.window_end().to_rfc3339(), "2024-02-01T00:00:00+00:00");
        assert_eq!(period.to_string(), "2024-01-01..2024-01-31");
    }

    #[test]
    fn test_inverted_period_rejected() {
        assert!(BillingPeriod::new(date(2024, 1, 31), date(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_pending_record_due_date() {
        let period = BillingPeriod::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap();
        let record =
            BillingRecord::pending(Uuid::new_v4(), period, dec!(0.85), "INV-1".into()).unwrap();

        assert_eq!(record.status, BillingStatus::Pending);
        assert_eq!(record.due_date, date(2024, 3, 1));
        assert_eq!(record.paid_date, None);
    }

    #[test]
    fn test_negative_total_rejected() {
        let period = BillingPeriod::month_of(date(2024, 1, 1));
        assert!(BillingRecord::pending(Uuid::new_v4(), period, dec!(-1), "INV-1".into()).is_err());
    }

    #[test]
    fn test_event_from_record() {
        let period = BillingPeriod::month_of(date(2024, 1, 10));
        let record =
            BillingRecord::pending(Uuid::new_v4(), period, dec!(12.50), "INV-2".into()).unwrap();
        let event = BillingCalculatedEvent::from_record(&record);

        assert_eq!(event.billing_record_id, record.id);
        assert_eq!(event.total_amount, dec!(12.50));
        assert_eq!(event.status, "CALCULATED");
        assert_eq!(event.billing_period_end, date(2024, 1, 31));
    }
}
