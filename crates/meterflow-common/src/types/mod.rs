//! Core data types for Meterflow

pub mod billing;
pub mod customer;
pub mod summary;
pub mod usage;
