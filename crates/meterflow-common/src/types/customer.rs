//! Customer reference data (read-only to the pipeline)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Customer account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerStatus {
    Active,
    Inactive,
    Suspended,
}

/// Customer as seen by billing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    /// Display name
    pub name: String,
    pub email: String,
    pub plan_type: String,
    pub status: CustomerStatus,
}

impl Customer {
    /// Create an active customer
    pub fn active(name: impl Into<String>, email: impl Into<String>, plan_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            plan_type: plan_type.into(),
            status: CustomerStatus::Active,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_status(mut self, status: CustomerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }

    /// Prefix used in invoice numbers: first 8 hex chars of the id, upper-cased
    pub fn invoice_prefix(&self) -> String {
        self.id.simple().to_string()[..8].to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_prefix() {
        let customer = Customer::active("Acme", "billing@acme.test", "pro")
            .with_id(Uuid::parse_str("6f1c1f9e-8d2b-4c43-9a51-1f0c2b7d9e10").unwrap());
        assert_eq!(customer.invoice_prefix(), "6F1C1F9E");
    }

    #[test]
    fn test_status() {
        let customer = Customer::active("Acme", "billing@acme.test", "pro");
        assert!(customer.is_active());
        assert!(!customer.with_status(CustomerStatus::Inactive).is_active());
    }
}
