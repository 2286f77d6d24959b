//! Dunning campaigns and payment requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DunningCampaign {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub name: String,
    /// Organization default, used when the customer has no override.
    pub applied_to_organization: bool,
    pub max_attempts: i32,
    pub days_between_attempts: i32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DunningCampaignThreshold {
    pub id: Uuid,
    pub dunning_campaign_id: Uuid,
    pub currency: String,
    pub amount_cents: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub dunning_campaign_id: Option<Uuid>,
    /// Sequential per organization.
    pub number: i64,
    pub amount_cents: i64,
    pub amount_currency: String,
    pub payment_status: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a dunning campaign.
#[derive(Debug, Clone)]
pub struct CreateDunningCampaign {
    pub code: String,
    pub name: String,
    pub applied_to_organization: bool,
    pub max_attempts: i32,
    pub days_between_attempts: i32,
    /// Minimum overdue amount per currency.
    pub thresholds: Vec<(String, i64)>,
}
