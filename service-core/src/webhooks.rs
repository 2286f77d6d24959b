//! Transactional outbox for webhook events.
//!
//! Rows are written in the same transaction as the state change they describe.
//! Delivery to customer endpoints happens elsewhere.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "wallet.updated")]
    WalletUpdated,
    #[serde(rename = "wallet.depleted_ongoing_balance")]
    WalletDepletedOngoingBalance,
    #[serde(rename = "wallet_transaction.created")]
    WalletTransactionCreated,
    #[serde(rename = "wallet_transaction.updated")]
    WalletTransactionUpdated,
    #[serde(rename = "alert.triggered")]
    AlertTriggered,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WalletUpdated => "wallet.updated",
            Self::WalletDepletedOngoingBalance => "wallet.depleted_ongoing_balance",
            Self::WalletTransactionCreated => "wallet_transaction.created",
            Self::WalletTransactionUpdated => "wallet_transaction.updated",
            Self::AlertTriggered => "alert.triggered",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "wallet.updated" => Some(Self::WalletUpdated),
            "wallet.depleted_ongoing_balance" => Some(Self::WalletDepletedOngoingBalance),
            "wallet_transaction.created" => Some(Self::WalletTransactionCreated),
            "wallet_transaction.updated" => Some(Self::WalletTransactionUpdated),
            "alert.triggered" => Some(Self::AlertTriggered),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub organization_id: Uuid,
    pub event_type: WebhookEventType,
    pub object_type: &'static str,
    pub object_id: Uuid,
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn new<T: Serialize>(
        organization_id: Uuid,
        event_type: WebhookEventType,
        object_type: &'static str,
        object_id: Uuid,
        object: &T,
    ) -> Result<Self, AppError> {
        Ok(Self {
            organization_id,
            event_type,
            object_type,
            object_id,
            payload: serde_json::to_value(object)?,
        })
    }
}

/// Outbox row as persisted.
#[derive(Debug, Clone, FromRow)]
pub struct StoredWebhookEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub event_type: String,
    pub object_type: String,
    pub object_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

#[instrument(skip(conn, event), fields(event_type = %event.event_type, object_id = %event.object_id))]
pub async fn record_webhook(
    conn: &mut PgConnection,
    event: &WebhookEvent,
) -> Result<Uuid, AppError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO webhook_events (id, organization_id, event_type, object_type, object_id, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(event.organization_id)
    .bind(event.event_type.as_str())
    .bind(event.object_type)
    .bind(event.object_id)
    .bind(&event.payload)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to record webhook", e))?;

    debug!(webhook_id = %id, "Webhook recorded");
    Ok(id)
}

/// Undispatched events for an object, oldest first.
pub async fn pending_for_object(
    conn: &mut PgConnection,
    object_id: Uuid,
) -> Result<Vec<StoredWebhookEvent>, AppError> {
    sqlx::query_as::<_, StoredWebhookEvent>(
        r#"
        SELECT id, organization_id, event_type, object_type, object_id, payload, created_at, dispatched_at
        FROM webhook_events
        WHERE object_id = $1 AND dispatched_at IS NULL
        ORDER BY created_at, id
        "#,
    )
    .bind(object_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to list webhooks", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip_through_storage_strings() {
        for t in [
            WebhookEventType::WalletUpdated,
            WebhookEventType::WalletDepletedOngoingBalance,
            WebhookEventType::AlertTriggered,
        ] {
            assert_eq!(WebhookEventType::from_string(t.as_str()), Some(t));
        }
        assert_eq!(WebhookEventType::from_string("invoice.created"), None);
    }
}
