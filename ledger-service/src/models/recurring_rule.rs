//! Automatic top-up rules attached to a wallet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTrigger {
    Interval,
    Threshold,
}

impl RuleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTrigger::Interval => "interval",
            RuleTrigger::Threshold => "threshold",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "interval" => Some(RuleTrigger::Interval),
            "threshold" => Some(RuleTrigger::Threshold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMethod {
    /// Add the configured paid and granted credits.
    Fixed,
    /// Top up to `target_ongoing_balance`.
    Target,
}

impl RuleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMethod::Fixed => "fixed",
            RuleMethod::Target => "target",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(RuleMethod::Fixed),
            "target" => Some(RuleMethod::Target),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleInterval {
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl RuleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleInterval::Weekly => "weekly",
            RuleInterval::Monthly => "monthly",
            RuleInterval::Quarterly => "quarterly",
            RuleInterval::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(RuleInterval::Weekly),
            "monthly" => Some(RuleInterval::Monthly),
            "quarterly" => Some(RuleInterval::Quarterly),
            "yearly" => Some(RuleInterval::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Terminated,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecurringTransactionRule {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub wallet_id: Uuid,
    pub trigger_type: String,
    pub method: String,
    pub interval_unit: Option<String>,
    pub status: String,
    pub paid_credits: Decimal,
    pub granted_credits: Decimal,
    pub threshold_credits: Option<Decimal>,
    pub target_ongoing_balance: Option<Decimal>,
    pub started_at: Option<DateTime<Utc>>,
    pub expiration_at: Option<DateTime<Utc>>,
    pub ignore_paid_top_up_limits: bool,
    pub transaction_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTransactionRule {
    pub fn parsed_trigger(&self) -> Option<RuleTrigger> {
        RuleTrigger::from_string(&self.trigger_type)
    }

    pub fn parsed_method(&self) -> RuleMethod {
        RuleMethod::from_string(&self.method).unwrap_or(RuleMethod::Fixed)
    }

    pub fn parsed_interval(&self) -> Option<RuleInterval> {
        self.interval_unit.as_deref().and_then(RuleInterval::from_string)
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.status == RuleStatus::Active.as_str()
            && self.expiration_at.map(|exp| exp > at).unwrap_or(true)
    }

    /// Reference instant for interval schedules.
    pub fn anchor(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Input for creating a recurring rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecurringRule {
    pub wallet_id: Uuid,
    pub trigger: RuleTrigger,
    pub method: RuleMethod,
    pub interval: Option<RuleInterval>,
    pub paid_credits: Decimal,
    pub granted_credits: Decimal,
    pub threshold_credits: Option<Decimal>,
    pub target_ongoing_balance: Option<Decimal>,
    pub started_at: Option<DateTime<Utc>>,
    pub expiration_at: Option<DateTime<Utc>>,
    pub ignore_paid_top_up_limits: bool,
    pub transaction_name: Option<String>,
}
