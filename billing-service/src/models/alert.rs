//! Usage monitoring alerts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CurrentUsageAmount,
    BillableMetricCurrentUsageAmount,
    BillableMetricCurrentUsageUnits,
    LifetimeUsageAmount,
    WalletBalanceAmount,
    WalletCreditsBalance,
    WalletOngoingBalanceAmount,
    WalletCreditsOngoingBalance,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::CurrentUsageAmount => "current_usage_amount",
            AlertType::BillableMetricCurrentUsageAmount => "billable_metric_current_usage_amount",
            AlertType::BillableMetricCurrentUsageUnits => "billable_metric_current_usage_units",
            AlertType::LifetimeUsageAmount => "lifetime_usage_amount",
            AlertType::WalletBalanceAmount => "wallet_balance_amount",
            AlertType::WalletCreditsBalance => "wallet_credits_balance",
            AlertType::WalletOngoingBalanceAmount => "wallet_ongoing_balance_amount",
            AlertType::WalletCreditsOngoingBalance => "wallet_credits_ongoing_balance",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "current_usage_amount" => Some(AlertType::CurrentUsageAmount),
            "billable_metric_current_usage_amount" => {
                Some(AlertType::BillableMetricCurrentUsageAmount)
            }
            "billable_metric_current_usage_units" => {
                Some(AlertType::BillableMetricCurrentUsageUnits)
            }
            "lifetime_usage_amount" => Some(AlertType::LifetimeUsageAmount),
            "wallet_balance_amount" => Some(AlertType::WalletBalanceAmount),
            "wallet_credits_balance" => Some(AlertType::WalletCreditsBalance),
            "wallet_ongoing_balance_amount" => Some(AlertType::WalletOngoingBalanceAmount),
            "wallet_credits_ongoing_balance" => Some(AlertType::WalletCreditsOngoingBalance),
            _ => None,
        }
    }

    pub fn is_wallet_alert(&self) -> bool {
        matches!(
            self,
            AlertType::WalletBalanceAmount
                | AlertType::WalletCreditsBalance
                | AlertType::WalletOngoingBalanceAmount
                | AlertType::WalletCreditsOngoingBalance
        )
    }

    /// Usage alerts restart from zero at every billing period.
    pub fn resets_each_period(&self) -> bool {
        matches!(
            self,
            AlertType::CurrentUsageAmount
                | AlertType::BillableMetricCurrentUsageAmount
                | AlertType::BillableMetricCurrentUsageUnits
        )
    }

    pub fn direction(&self) -> CrossingDirection {
        if self.is_wallet_alert() {
            CrossingDirection::Decreasing
        } else {
            CrossingDirection::Increasing
        }
    }
}

/// Usage grows towards thresholds; wallet balances fall towards them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingDirection {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub alert_type: String,
    pub code: String,
    pub name: Option<String>,
    pub subscription_external_id: Option<String>,
    pub wallet_id: Option<Uuid>,
    pub billable_metric_id: Option<Uuid>,
    pub previous_value: Decimal,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    pub fn parsed_type(&self) -> Option<AlertType> {
        AlertType::from_string(&self.alert_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AlertThreshold {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub value: Decimal,
    pub code: Option<String>,
    pub recurring: bool,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of one crossed threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossedThreshold {
    pub code: Option<String>,
    pub value: Decimal,
    pub recurring: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TriggeredAlert {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub alert_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub wallet_id: Option<Uuid>,
    pub current_value: Decimal,
    pub previous_value: Decimal,
    pub crossed_thresholds: serde_json::Value,
    pub triggered_at: DateTime<Utc>,
}

/// Input for one alert threshold.
#[derive(Debug, Clone)]
pub struct CreateAlertThreshold {
    pub value: Decimal,
    pub code: Option<String>,
    pub recurring: bool,
}

/// Input for creating an alert.
#[derive(Debug, Clone)]
pub struct CreateAlert {
    pub alert_type: AlertType,
    pub code: String,
    pub name: Option<String>,
    pub subscription_external_id: Option<String>,
    pub wallet_id: Option<Uuid>,
    pub billable_metric_id: Option<Uuid>,
    pub thresholds: Vec<CreateAlertThreshold>,
}
