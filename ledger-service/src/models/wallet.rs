//! Prepaid wallet model.

use super::currency::subunit_to_unit;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

/// Credits are stored with five decimal places.
pub const CREDIT_SCALE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Active,
    Terminated,
}

impl WalletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "active",
            WalletStatus::Terminated => "terminated",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "terminated" => WalletStatus::Terminated,
            _ => WalletStatus::Active,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub name: Option<String>,
    pub status: String,
    pub currency: String,
    /// Cents-per-credit conversion rate, in major units.
    pub rate_amount: Decimal,
    pub balance_cents: i64,
    pub credits_balance: Decimal,
    pub consumed_credits: Decimal,
    pub consumed_amount_cents: i64,
    pub ongoing_balance_cents: i64,
    pub credits_ongoing_balance: Decimal,
    pub ongoing_usage_balance_cents: i64,
    pub credits_ongoing_usage_balance: Decimal,
    pub depleted_ongoing_balance: bool,
    pub paid_top_up_min_amount_cents: Option<i64>,
    pub paid_top_up_max_amount_cents: Option<i64>,
    pub ready_to_be_refreshed: bool,
    pub last_balance_sync_at: Option<DateTime<Utc>>,
    pub last_consumed_credit_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn parsed_status(&self) -> WalletStatus {
        WalletStatus::from_string(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.parsed_status() == WalletStatus::Active
    }

    pub fn ensure_active(&self) -> Result<(), AppError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(AppError::validation(
                "wallet_not_active",
                format!("wallet {} is terminated", self.id),
            ))
        }
    }

    pub fn subunit_to_unit(&self) -> Result<i64, AppError> {
        subunit_to_unit(&self.currency).ok_or_else(|| {
            AppError::InvariantViolation(anyhow::anyhow!(
                "wallet {} has unsupported currency {}",
                self.id,
                self.currency
            ))
        })
    }

    /// Convert credits to the currency's minor units, rounding down.
    pub fn credits_to_cents(&self, credits: Decimal) -> Result<i64, AppError> {
        let subunit = Decimal::from(self.subunit_to_unit()?);
        (credits * self.rate_amount * subunit)
            .floor()
            .to_i64()
            .ok_or_else(|| {
                AppError::validation(
                    "invalid_credit_amount",
                    format!("{} credits overflow", credits),
                )
            })
    }

    pub fn cents_to_credits(&self, cents: i64) -> Result<Decimal, AppError> {
        let subunit = Decimal::from(self.subunit_to_unit()?);
        Ok((Decimal::from(cents) / subunit / self.rate_amount).round_dp(CREDIT_SCALE))
    }
}

/// Input for creating a wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWallet {
    pub customer_id: Uuid,
    pub name: Option<String>,
    pub currency: String,
    pub rate_amount: Decimal,
    pub paid_top_up_min_amount_cents: Option<i64>,
    pub paid_top_up_max_amount_cents: Option<i64>,
}

/// Unbilled usage used to project the ongoing balance, in wallet currency cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingUsage {
    /// Current period usage of every active subscription of the customer.
    pub current_usage_cents: i64,
    /// Totals of draft invoices not yet finalized.
    pub draft_invoices_cents: i64,
    /// Usage already billed in advance and therefore already deducted.
    pub billed_usage_cents: i64,
}

impl OngoingUsage {
    pub fn total_cents(&self) -> i64 {
        (self.current_usage_cents + self.draft_invoices_cents - self.billed_usage_cents).max(0)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::wallet;
    use rust_decimal_macros::dec;

    #[test]
    fn credits_to_cents_floors_fractional_minor_units() {
        let w = wallet("USD", dec!(0.333));
        // 10 * 0.333 * 100 = 333.0
        assert_eq!(w.credits_to_cents(dec!(10)).unwrap(), 333);
        // 1 * 0.333 * 100 = 33.3
        assert_eq!(w.credits_to_cents(dec!(1)).unwrap(), 33);
    }

    #[test]
    fn conversion_uses_currency_subunit() {
        assert_eq!(wallet("JPY", dec!(1)).credits_to_cents(dec!(50)).unwrap(), 50);
        assert_eq!(wallet("KWD", dec!(1)).credits_to_cents(dec!(50)).unwrap(), 50_000);
        assert_eq!(wallet("USD", dec!(2)).cents_to_credits(5000).unwrap(), dec!(25));
    }

    #[test]
    fn terminated_wallet_rejects_mutation() {
        let mut w = wallet("USD", dec!(1));
        w.status = "terminated".to_string();
        let err = w.ensure_active().unwrap_err();
        assert_eq!(err.error_code(), "wallet_not_active");
    }
}
