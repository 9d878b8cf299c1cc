//! Error types for Meterflow
//!
//! Provides a unified error type and domain-specific error variants

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using MeterflowError
pub type Result<T> = std::result::Result<T, MeterflowError>;

/// Unified error type for Meterflow operations
#[derive(Debug, Error)]
pub enum MeterflowError {
    // Malformed input, rejected before any persistence
    #[error("Validation failed: {0}")]
    Validation(String),

    // A bill already exists for the customer and period
    #[error("Billing record already exists for customer {customer_id} period {period_start}..{period_end}")]
    DuplicateBillingPeriod {
        customer_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    },

    #[error("Customer not found: {0}")]
    CustomerNotFound(Uuid),

    #[error("Invoice number conflict: {0}")]
    InvoiceConflict(String),

    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    // Outbound notification could not be delivered
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decimal arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeterflowError {
    /// Expected outcome of a repeated calculation, not a fault
    pub fn is_duplicate_period(&self) -> bool {
        matches!(self, MeterflowError::DuplicateBillingPeriod { .. })
    }

    /// Whether retrying the same input can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MeterflowError::Store(StoreError::Unavailable(_)) | MeterflowError::Timeout(_) => true,
            MeterflowError::Ingestion(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Batch ingestion errors
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Sub-batch {sub_batch} of {total_sub_batches} failed after {committed} events committed: {source}")]
    SubBatchFailed {
        /// Zero-based index of the failing sub-batch
        sub_batch: usize,
        total_sub_batches: usize,
        /// Events durably written by earlier sub-batches
        committed: usize,
        #[source]
        source: StoreError,
    },

    #[error("Sub-batch {sub_batch} timed out after {committed} events committed")]
    SubBatchTimedOut { sub_batch: usize, committed: usize },
}

impl IngestionError {
    /// Events committed before the failure
    pub fn committed(&self) -> usize {
        match self {
            IngestionError::SubBatchFailed { committed, .. }
            | IngestionError::SubBatchTimedOut { committed, .. } => *committed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::SubBatchFailed { source, .. } => {
                matches!(source, StoreError::Unavailable(_))
            }
            IngestionError::SubBatchTimedOut { .. } => true,
        }
    }
}

/// Unique constraints enforced by the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueConstraint {
    /// (customer_id, period_start, period_end)
    BillingPeriod,
    /// invoice_number
    InvoiceNumber,
}

impl std::fmt::Display for UniqueConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UniqueConstraint::BillingPeriod => write!(f, "uq_billing_customer_period"),
            UniqueConstraint::InvoiceNumber => write!(f, "uq_billing_invoice_number"),
        }
    }
}

/// Durable store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(UniqueConstraint),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// Implement From for common external error types
impl From<serde_json::Error> for MeterflowError {
    fn from(err: serde_json::Error) -> Self {
        MeterflowError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for MeterflowError {
    fn from(err: anyhow::Error) -> Self {
        MeterflowError::Internal(err.to_string())
    }
}
