//! Wallet transactions and their consumption links.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lowest precedence; lower values are consumed first.
pub const DEFAULT_PRIORITY: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Inbound,
    Outbound,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Inbound => "inbound",
            TransactionType::Outbound => "outbound",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(TransactionType::Inbound),
            "outbound" => Some(TransactionType::Outbound),
            _ => None,
        }
    }
}

/// Settlement state. `Settled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Settled,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Settled => "settled",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "settled" => Some(TransactionStatus::Settled),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// What the transaction represents; stored in `transaction_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchased,
    Granted,
    Voided,
    Invoiced,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchased => "purchased",
            TransactionKind::Granted => "granted",
            TransactionKind::Voided => "voided",
            TransactionKind::Invoiced => "invoiced",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "purchased" => Some(TransactionKind::Purchased),
            "granted" => Some(TransactionKind::Granted),
            "voided" => Some(TransactionKind::Voided),
            "invoiced" => Some(TransactionKind::Invoiced),
            _ => None,
        }
    }

    pub fn transaction_type(&self) -> TransactionType {
        match self {
            TransactionKind::Purchased | TransactionKind::Granted => TransactionType::Inbound,
            TransactionKind::Voided | TransactionKind::Invoiced => TransactionType::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    Manual,
    Interval,
    Threshold,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Manual => "manual",
            TransactionSource::Interval => "interval",
            TransactionSource::Threshold => "threshold",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub wallet_id: Uuid,
    pub transaction_type: String,
    pub status: String,
    pub transaction_status: String,
    pub source: String,
    pub amount_cents: i64,
    pub credit_amount: Decimal,
    /// Unconsumed part of a settled inbound transaction.
    pub remaining_amount_cents: Option<i64>,
    pub priority: i32,
    pub invoice_id: Option<Uuid>,
    pub name: Option<String>,
    pub metadata: serde_json::Value,
    pub settled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn parsed_type(&self) -> Option<TransactionType> {
        TransactionType::from_string(&self.transaction_type)
    }

    pub fn parsed_status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_string(&self.status)
    }

    pub fn parsed_kind(&self) -> Option<TransactionKind> {
        TransactionKind::from_string(&self.transaction_status)
    }

    pub fn is_pending(&self) -> bool {
        self.parsed_status() == Some(TransactionStatus::Pending)
    }
}

/// Insert parameters for a wallet transaction.
#[derive(Debug, Clone)]
pub struct NewWalletTransaction {
    pub organization_id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub source: TransactionSource,
    pub amount_cents: i64,
    pub credit_amount: Decimal,
    pub priority: i32,
    pub invoice_id: Option<Uuid>,
    pub name: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewWalletTransaction {
    /// Settled inbound rows start fully available for consumption.
    pub fn remaining_amount_cents(&self) -> Option<i64> {
        match (self.kind.transaction_type(), self.status) {
            (TransactionType::Inbound, TransactionStatus::Settled) => Some(self.amount_cents),
            _ => None,
        }
    }
}

/// Debit of one outbound transaction against one inbound transaction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletTransactionConsumption {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub inbound_wallet_transaction_id: Uuid,
    pub outbound_wallet_transaction_id: Uuid,
    pub consumed_amount_cents: i64,
    pub created_at: DateTime<Utc>,
}
