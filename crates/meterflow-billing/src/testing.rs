//! Shared fixtures for unit tests

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use meterflow_common::{BillingPeriod, Customer, UsageEvent};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::store::InMemoryStore;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn january() -> BillingPeriod {
    BillingPeriod::new(date(2024, 1, 1), date(2024, 1, 31)).unwrap()
}

/// Usage at noon UTC on `day`
pub fn usage_at(
    customer_id: Uuid,
    resource: &str,
    quantity: Decimal,
    unit_price: Option<Decimal>,
    day: NaiveDate,
) -> UsageEvent {
    let mut event = UsageEvent::new(customer_id, resource, quantity, "unit")
        .at(day.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()).and_utc());
    event.unit_price = unit_price;
    event
}

/// Store holding one active customer
pub async fn seeded_store() -> (Arc<InMemoryStore>, Customer) {
    let store = Arc::new(InMemoryStore::new());
    let customer = Customer::active("Acme Corp", "billing@acme.test", "pro");
    store.upsert_customer(customer.clone());
    (store, customer)
}
