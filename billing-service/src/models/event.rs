//! Usage events and what is derived from them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Raw usage record. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub transaction_id: String,
    pub external_subscription_id: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub properties: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// String value of a property, numbers rendered as text.
    pub fn property(&self, key: &str) -> Option<String> {
        property_as_string(&self.properties, key)
    }
}

pub(crate) fn property_as_string(properties: &serde_json::Value, key: &str) -> Option<String> {
    match properties.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Input for ingesting an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub transaction_id: String,
    pub external_subscription_id: String,
    pub code: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// Operation carried by unique count events in `operation_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantifiedOperation {
    Add,
    Remove,
}

impl QuantifiedOperation {
    pub fn from_properties(properties: &serde_json::Value) -> Self {
        match properties.get("operation_type").and_then(|v| v.as_str()) {
            Some("remove") => QuantifiedOperation::Remove,
            _ => QuantifiedOperation::Add,
        }
    }
}

/// Presence of a unique value between `added_at` and `removed_at`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuantifiedEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub billable_metric_id: Uuid,
    pub external_subscription_id: String,
    pub external_id: String,
    pub properties: serde_json::Value,
    pub added_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Running aggregation recorded for a pay-in-advance charge at event time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CachedAggregation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub event_id: Uuid,
    pub charge_id: Uuid,
    pub charge_filter_id: Option<Uuid>,
    pub external_subscription_id: String,
    pub grouped_by: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub current_aggregation: Decimal,
    /// Highest value reached in the period; billing happens only above it.
    pub max_aggregation: Decimal,
    pub max_aggregation_with_proration: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::Voided => "voided",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub status: String,
    pub total_amount_cents: i64,
    pub payment_overdue: bool,
    pub issuing_date: chrono::NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Fee {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub charge_id: Uuid,
    pub charge_filter_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub pay_in_advance: bool,
    pub units: Decimal,
    pub amount_cents: i64,
    pub amount_currency: String,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Input for recording an invoice produced by invoice generation.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub customer_id: Uuid,
    pub currency: String,
    pub status: InvoiceStatus,
    pub total_amount_cents: i64,
    pub payment_overdue: bool,
    pub issuing_date: chrono::NaiveDate,
}
