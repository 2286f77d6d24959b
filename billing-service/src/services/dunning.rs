//! Dunning: payment requests for customers with overdue invoices.

use super::database::{self, Database};
use super::metrics::record_dunning_attempt;
use crate::models::{Customer, DunningCampaign, DunningCampaignThreshold, PaymentRequest};
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use service_core::locks::{acquire_advisory_xact_lock, DEFAULT_LOCK_TIMEOUT};
use service_core::retry::{retry_async, RetryConfig};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum DunningDecision {
    NoCampaign,
    /// No threshold in the customer's currency is reached.
    BelowThreshold,
    MaxAttemptsReached,
    TooSoon { next_attempt_at: DateTime<Utc> },
    Attempt { threshold_amount_cents: i64 },
}

impl DunningDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningDecision::NoCampaign => "no_campaign",
            DunningDecision::BelowThreshold => "below_threshold",
            DunningDecision::MaxAttemptsReached => "max_attempts_reached",
            DunningDecision::TooSoon { .. } => "too_soon",
            DunningDecision::Attempt { .. } => "attempt",
        }
    }
}

/// Whether `customer` should get a payment request now under `campaign`.
pub fn evaluate(
    customer: &Customer,
    campaign: Option<&DunningCampaign>,
    thresholds: &[DunningCampaignThreshold],
    now: DateTime<Utc>,
) -> DunningDecision {
    let Some(campaign) = campaign else {
        return DunningDecision::NoCampaign;
    };

    let threshold = thresholds
        .iter()
        .filter(|t| t.deleted_at.is_none())
        .filter(|t| t.currency == customer.currency)
        .filter(|t| t.amount_cents <= customer.overdue_balance_cents)
        .map(|t| t.amount_cents)
        .max();
    let Some(threshold_amount_cents) = threshold else {
        return DunningDecision::BelowThreshold;
    };

    if customer.last_dunning_campaign_attempt >= campaign.max_attempts {
        return DunningDecision::MaxAttemptsReached;
    }

    if let Some(last_attempt_at) = customer.last_dunning_campaign_attempt_at {
        let next_attempt_at =
            last_attempt_at + Duration::days(i64::from(campaign.days_between_attempts));
        if now < next_attempt_at {
            return DunningDecision::TooSoon { next_attempt_at };
        }
    }

    DunningDecision::Attempt {
        threshold_amount_cents,
    }
}

/// Sequence lock for payment request numbers of one organization.
fn payment_request_lock(organization_id: Uuid) -> String {
    format!("payment_requests:{}", organization_id)
}

#[derive(Clone)]
pub struct DunningProcessor {
    db: Database,
}

impl DunningProcessor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a payment request for the customer's overdue invoices when due.
    ///
    /// The attempt counter and the payment request commit together. Lock timeouts on
    /// the numbering sequence are retried.
    #[instrument(skip(self))]
    pub async fn process_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let result = retry_async(&RetryConfig::for_locks(), "dunning.process_customer", || {
            self.attempt(customer_id, Utc::now())
        })
        .await;
        if result.is_err() {
            record_dunning_attempt("failed");
        }
        result
    }

    /// Process every customer with an overdue balance, up to `limit`. Returns requests created.
    #[instrument(skip(self))]
    pub async fn process_overdue(&self, limit: i64) -> Result<usize, AppError> {
        let customers = self.db.customers_with_overdue_balance(limit).await?;
        let mut created = 0;
        for customer in customers {
            match self.process_customer(customer.id).await {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    customer_id = %customer.id,
                    code = e.error_code(),
                    error = %e,
                    "Dunning attempt failed"
                ),
            }
        }
        Ok(created)
    }

    async fn attempt(
        &self,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let mut tx = self.db.begin().await?;
        let customer = database::lock_customer(&mut tx, customer_id).await?;
        if customer.exclude_from_dunning_campaign {
            return Ok(None);
        }

        let Some((campaign, thresholds)) =
            database::applicable_dunning_campaign(&mut tx, &customer).await?
        else {
            record_dunning_attempt(DunningDecision::NoCampaign.as_str());
            return Ok(None);
        };

        let decision = evaluate(&customer, Some(&campaign), &thresholds, now);
        if !matches!(decision, DunningDecision::Attempt { .. }) {
            debug!(decision = decision.as_str(), "Customer not eligible for dunning");
            record_dunning_attempt(decision.as_str());
            return Ok(None);
        }

        let invoices = database::overdue_invoices(&mut tx, customer.id, &customer.currency).await?;
        if invoices.is_empty() {
            debug!("No overdue invoices in customer currency");
            return Ok(None);
        }
        let amount_cents: i64 = invoices.iter().map(|i| i.total_amount_cents).sum();
        let invoice_ids: Vec<Uuid> = invoices.iter().map(|i| i.id).collect();

        acquire_advisory_xact_lock(
            &mut tx,
            &payment_request_lock(customer.organization_id),
            DEFAULT_LOCK_TIMEOUT,
        )
        .await?;
        let number =
            database::next_payment_request_number(&mut tx, customer.organization_id).await?;
        let request = database::insert_payment_request(
            &mut tx,
            &customer,
            campaign.id,
            number,
            amount_cents,
            &customer.currency,
            &invoice_ids,
        )
        .await?;
        let customer = database::record_dunning_attempt(&mut tx, customer.id, now).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit dunning attempt", e))?;

        record_dunning_attempt("attempted");
        info!(
            payment_request_id = %request.id,
            number = request.number,
            amount_cents = amount_cents,
            attempt = customer.last_dunning_campaign_attempt,
            "Payment request created"
        );
        Ok(Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn customer(overdue: i64, attempts: i32, last_attempt_at: Option<DateTime<Utc>>) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            external_id: "cus_1".to_string(),
            name: None,
            currency: "EUR".to_string(),
            timezone: None,
            overdue_balance_cents: overdue,
            applied_dunning_campaign_id: None,
            exclude_from_dunning_campaign: false,
            last_dunning_campaign_attempt: attempts,
            last_dunning_campaign_attempt_at: last_attempt_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn campaign() -> DunningCampaign {
        DunningCampaign {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "default".to_string(),
            name: "Default".to_string(),
            applied_to_organization: true,
            max_attempts: 3,
            days_between_attempts: 5,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    fn threshold(
        campaign: &DunningCampaign,
        currency: &str,
        amount_cents: i64,
    ) -> DunningCampaignThreshold {
        DunningCampaignThreshold {
            id: Uuid::new_v4(),
            dunning_campaign_id: campaign.id,
            currency: currency.to_string(),
            amount_cents,
            deleted_at: None,
        }
    }

    #[test]
    fn largest_reached_threshold_in_customer_currency() {
        let campaign = campaign();
        let thresholds = vec![
            threshold(&campaign, "EUR", 1000),
            threshold(&campaign, "EUR", 5000),
            threshold(&campaign, "USD", 100),
        ];
        let now = Utc::now();
        assert_eq!(
            evaluate(&customer(6000, 0, None), Some(&campaign), &thresholds, now),
            DunningDecision::Attempt {
                threshold_amount_cents: 5000
            }
        );
        assert_eq!(
            evaluate(&customer(500, 0, None), Some(&campaign), &thresholds, now),
            DunningDecision::BelowThreshold
        );
        assert_eq!(
            evaluate(&customer(6000, 0, None), None, &thresholds, now),
            DunningDecision::NoCampaign
        );
    }

    #[test]
    fn attempts_are_capped_and_spaced() {
        let campaign = campaign();
        let thresholds = vec![threshold(&campaign, "EUR", 1000)];
        let last = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(
            evaluate(&customer(2000, 3, Some(last)), Some(&campaign), &thresholds, last),
            DunningDecision::MaxAttemptsReached
        );
        assert_eq!(
            evaluate(
                &customer(2000, 1, Some(last)),
                Some(&campaign),
                &thresholds,
                last + Duration::days(4)
            ),
            DunningDecision::TooSoon {
                next_attempt_at: last + Duration::days(5)
            }
        );
        assert!(matches!(
            evaluate(
                &customer(2000, 1, Some(last)),
                Some(&campaign),
                &thresholds,
                last + Duration::days(5)
            ),
            DunningDecision::Attempt { .. }
        ));
    }
}
