//! Organizations, customers, plans and subscriptions.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Terminated,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Terminated => "terminated",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => SubscriptionStatus::Pending,
            "terminated" => SubscriptionStatus::Terminated,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Whether periods follow the calendar or the subscription start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingTime {
    Calendar,
    Anniversary,
}

impl BillingTime {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingTime::Calendar => "calendar",
            BillingTime::Anniversary => "anniversary",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "anniversary" => BillingTime::Anniversary,
            _ => BillingTime::Calendar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    Weekly,
    Monthly,
    Yearly,
}

impl PlanInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanInterval::Weekly => "weekly",
            PlanInterval::Monthly => "monthly",
            PlanInterval::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "weekly" => PlanInterval::Weekly,
            "yearly" => PlanInterval::Yearly,
            _ => PlanInterval::Monthly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_id: String,
    pub name: Option<String>,
    pub currency: String,
    /// Overrides the organization timezone when set.
    pub timezone: Option<String>,
    pub overdue_balance_cents: i64,
    pub applied_dunning_campaign_id: Option<Uuid>,
    pub exclude_from_dunning_campaign: bool,
    pub last_dunning_campaign_attempt: i32,
    pub last_dunning_campaign_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Customer timezone, falling back to the organization's, then UTC.
    pub fn applicable_timezone(&self, organization: &Organization) -> Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse::<Tz>().ok())
            .or_else(|| organization.timezone.parse::<Tz>().ok())
            .unwrap_or(Tz::UTC)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub name: String,
    pub interval: String,
    pub amount_cents: i64,
    pub amount_currency: String,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn parsed_interval(&self) -> PlanInterval {
        PlanInterval::from_string(&self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub external_id: String,
    pub status: String,
    pub billing_time: String,
    pub subscription_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn parsed_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn parsed_billing_time(&self) -> BillingTime {
        BillingTime::from_string(&self.billing_time)
    }

    pub fn is_active(&self) -> bool {
        self.parsed_status() == SubscriptionStatus::Active
    }

    /// Start of usage for recurring metrics.
    pub fn usage_started_at(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.subscription_at)
    }
}

/// Input for creating a customer.
#[derive(Debug, Clone)]
pub struct CreateCustomer {
    pub external_id: String,
    pub name: Option<String>,
    pub currency: String,
    pub timezone: Option<String>,
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub code: String,
    pub name: String,
    pub interval: PlanInterval,
    pub amount_cents: i64,
    pub amount_currency: String,
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub external_id: String,
    pub billing_time: BillingTime,
    pub subscription_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organization(timezone: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            timezone: timezone.to_string(),
            created_at: Utc::now(),
        }
    }

    fn customer(timezone: Option<&str>) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            external_id: "cus_1".to_string(),
            name: None,
            currency: "EUR".to_string(),
            timezone: timezone.map(str::to_string),
            overdue_balance_cents: 0,
            applied_dunning_campaign_id: None,
            exclude_from_dunning_campaign: false,
            last_dunning_campaign_attempt: 0,
            last_dunning_campaign_attempt_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn customer_timezone_wins_over_organization() {
        let org = organization("Europe/Paris");
        assert_eq!(
            customer(Some("America/New_York")).applicable_timezone(&org),
            chrono_tz::America::New_York
        );
        assert_eq!(customer(None).applicable_timezone(&org), chrono_tz::Europe::Paris);
        assert_eq!(
            customer(Some("Not/AZone")).applicable_timezone(&organization("bogus")),
            Tz::UTC
        );
    }
}
