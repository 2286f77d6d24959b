//! Ledger Service - prepaid wallet credit ledger.
//!
//! Wallet balances are an append-only ledger of inbound and outbound transactions.
//! Debits are allocated against inbound credits in priority order and the ongoing
//! balance is projected from unbilled usage.

pub mod models;
pub mod services;
