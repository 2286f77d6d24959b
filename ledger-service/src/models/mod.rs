//! Domain models for ledger-service.

pub mod currency;
pub mod recurring_rule;
pub mod transaction;
pub mod wallet;

pub use currency::subunit_to_unit;
pub use recurring_rule::{
    CreateRecurringRule, RecurringTransactionRule, RuleInterval, RuleMethod, RuleStatus,
    RuleTrigger,
};
pub use transaction::{
    NewWalletTransaction, TransactionKind, TransactionSource, TransactionStatus, TransactionType,
    WalletTransaction, WalletTransactionConsumption,
};
pub use wallet::{CreateWallet, OngoingUsage, Wallet, WalletStatus};
