//! Read models served by the query surface

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-day, per-resource usage totals for a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageSummary {
    pub customer_id: Uuid,
    pub usage_date: NaiveDate,
    pub resource_type: String,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub event_count: u64,
}

/// Billed totals for a customer in one calendar month
///
/// `month` is the first day of the month the billing period starts in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyBillingSummary {
    pub customer_id: Uuid,
    pub month: NaiveDate,
    pub record_count: u64,
    pub total_amount: Decimal,
}

/// Daily aggregate cost series across all customers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTrend {
    /// ISO dates, ascending
    pub labels: Vec<String>,
    pub values: Vec<Decimal>,
}

impl CostTrend {
    pub fn push(&mut self, date: NaiveDate, cost: Decimal) {
        self.labels.push(date.to_string());
        self.values.push(cost);
    }
}

/// One page of a larger result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Zero-based page index
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
}

impl<T> Page<T> {
    /// Slice `all` into the requested page
    pub fn from_vec(all: Vec<T>, page: usize, size: usize) -> Self {
        let total_items = all.len();
        let items = if size == 0 {
            Vec::new()
        } else {
            all.into_iter().skip(page.saturating_mul(size)).take(size).collect()
        };
        Self {
            items,
            page,
            size,
            total_items,
        }
    }

    pub fn total_pages(&self) -> usize {
        if self.size == 0 {
            0
        } else {
            self.total_items.div_ceil(self.size)
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total_items: self.total_items,
        }
    }
}
