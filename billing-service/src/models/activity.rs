//! Subscription activity flags and lifetime usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Dirty flag: usage of the subscription changed since the last processing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionActivity {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub enqueued: bool,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LifetimeUsage {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub current_usage_amount_cents: i64,
    pub invoiced_usage_amount_cents: i64,
    pub historical_usage_amount_cents: i64,
    pub current_usage_amount_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifetimeUsage {
    pub fn total_amount_cents(&self) -> i64 {
        self.historical_usage_amount_cents
            + self.invoiced_usage_amount_cents
            + self.current_usage_amount_cents
    }
}
