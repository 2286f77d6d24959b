//! Ledger services.

pub mod allocator;
pub mod database;
pub mod ledger;
pub mod metrics;
pub mod top_up;

pub use database::Database;
pub use ledger::{
    CreatedTransactions, CreditRequest, Debit, DebitRequest, DepletionEdge, LedgerSettings,
    WalletLedger,
};
pub use top_up::{TopUpHandler, TopUpPayload, TOP_UP_JOB, TOP_UP_QUEUE};
