//! Billing Service - usage metering, aggregation, alerts and dunning.
//!
//! Events are aggregated per charge into current usage, which feeds usage alerts,
//! lifetime usage and the ongoing balance of the customer's prepaid wallets.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
pub mod worker;
