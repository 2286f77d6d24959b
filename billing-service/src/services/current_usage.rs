//! Priced usage of the current billing period.

use super::aggregation::{AggregationEngine, AggregationOptions, AggregationScope, GroupKey};
use super::charge_filters::{matching_and_ignored, unfiltered_ignored, MatchingAndIgnored};
use super::charge_models::{self, PricingInput};
use super::database::Database;
use super::periods::BillingPeriod;
use crate::models::{BillableMetric, Charge, Subscription};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Usage of one charge, filter and group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeUsage {
    pub charge_id: Uuid,
    pub billable_metric_id: Uuid,
    pub charge_filter_id: Option<Uuid>,
    pub grouped_by: GroupKey,
    pub units: Decimal,
    pub events_count: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionUsage {
    pub subscription_id: Uuid,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub currency: String,
    pub amount_cents: i64,
    pub charges: Vec<ChargeUsage>,
}

impl SubscriptionUsage {
    fn for_metric(&self, billable_metric_id: Uuid) -> impl Iterator<Item = &ChargeUsage> {
        self.charges
            .iter()
            .filter(move |c| c.billable_metric_id == billable_metric_id)
    }

    /// Largest fee amount of a metric.
    pub fn max_amount_for_metric(&self, billable_metric_id: Uuid) -> i64 {
        self.for_metric(billable_metric_id)
            .map(|c| c.amount_cents)
            .max()
            .unwrap_or(0)
    }

    /// Largest unit count of a metric.
    pub fn max_units_for_metric(&self, billable_metric_id: Uuid) -> Decimal {
        self.for_metric(billable_metric_id)
            .map(|c| c.units)
            .max()
            .unwrap_or(Decimal::ZERO)
    }
}

/// One priced slice of a charge.
struct PricedScope {
    charge_filter_id: Option<Uuid>,
    filters: MatchingAndIgnored,
    properties: serde_json::Value,
}

#[derive(Clone)]
pub struct CurrentUsageService {
    db: Database,
    engine: AggregationEngine,
}

impl CurrentUsageService {
    pub fn new(db: Database, engine: AggregationEngine) -> Self {
        Self { db, engine }
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Billing period of `subscription` containing `at`, in the customer's timezone.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    pub async fn period_for(
        &self,
        subscription: &Subscription,
        at: DateTime<Utc>,
    ) -> Result<(BillingPeriod, String), AppError> {
        let organization = self
            .db
            .get_organization(subscription.organization_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Organization {} not found",
                    subscription.organization_id
                ))
            })?;
        let customer = self
            .db
            .get_customer(subscription.organization_id, subscription.customer_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Customer {} not found",
                    subscription.customer_id
                ))
            })?;
        let plan = self.db.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Plan {} not found", subscription.plan_id))
        })?;

        let period = BillingPeriod::for_subscription(
            subscription,
            plan.parsed_interval(),
            customer.applicable_timezone(&organization),
            at,
        );
        Ok((period, customer.currency))
    }

    /// Aggregate and price every charge of the subscription's plan.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    pub async fn compute(
        &self,
        subscription: &Subscription,
        at: DateTime<Utc>,
    ) -> Result<SubscriptionUsage, AppError> {
        let (period, currency) = self.period_for(subscription, at).await?;
        let charges = self.db.charges_for_plan(subscription.plan_id).await?;

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;

        let mut usage = Vec::new();
        for charge in charges {
            let Some(metric) = self.db.get_billable_metric(charge.billable_metric_id).await? else {
                continue;
            };
            let charge_usage = self
                .charge_usage(&mut conn, subscription, &metric, &charge, &period, &currency)
                .await?;
            usage.extend(charge_usage);
        }

        let amount_cents = usage.iter().map(|c| c.amount_cents).sum();
        debug!(charges = usage.len(), amount_cents = amount_cents, "Current usage computed");

        Ok(SubscriptionUsage {
            subscription_id: subscription.id,
            from_datetime: period.charges_from,
            to_datetime: period.charges_to,
            currency,
            amount_cents,
            charges: usage,
        })
    }

    async fn charge_usage(
        &self,
        conn: &mut PgConnection,
        subscription: &Subscription,
        metric: &BillableMetric,
        charge: &Charge,
        period: &BillingPeriod,
        currency: &str,
    ) -> Result<Vec<ChargeUsage>, AppError> {
        let model = charge.parsed_charge_model().ok_or_else(|| {
            AppError::validation(
                "invalid_charge_model",
                format!("unknown charge model '{}'", charge.charge_model),
            )
        })?;
        let (charge_filters, definitions) = self.db.filter_definitions(charge.id).await?;

        let mut slices = Vec::with_capacity(definitions.len() + 1);
        for definition in &definitions {
            let properties = charge_filters
                .iter()
                .find(|f| f.id == definition.filter_id)
                .map(|f| f.properties.clone())
                .unwrap_or_else(|| charge.properties.clone());
            slices.push(PricedScope {
                charge_filter_id: Some(definition.filter_id),
                filters: matching_and_ignored(&definitions, definition),
                properties,
            });
        }
        slices.push(PricedScope {
            charge_filter_id: None,
            filters: unfiltered_ignored(&definitions),
            properties: charge.properties.clone(),
        });

        let base = AggregationScope::new(
            subscription.clone(),
            metric.clone(),
            charge.clone(),
            *period,
        )?;
        let options = AggregationOptions {
            current_usage: true,
        };

        let mut usage = Vec::new();
        for slice in slices {
            let scope = base
                .clone()
                .with_filter(slice.charge_filter_id, slice.filters);
            for result in self.engine.aggregate_grouped(conn, &scope, options).await? {
                let amount = charge_models::apply(
                    model,
                    &slice.properties,
                    PricingInput {
                        units: result.aggregation,
                        events_count: result.count,
                    },
                )?;
                usage.push(ChargeUsage {
                    charge_id: charge.id,
                    billable_metric_id: metric.id,
                    charge_filter_id: slice.charge_filter_id,
                    grouped_by: result.grouped_by,
                    units: result.aggregation,
                    events_count: result.count,
                    amount_cents: charge_models::to_cents(amount, currency)?,
                });
            }
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn line(metric: Uuid, units: Decimal, amount_cents: i64) -> ChargeUsage {
        ChargeUsage {
            charge_id: Uuid::new_v4(),
            billable_metric_id: metric,
            charge_filter_id: None,
            grouped_by: GroupKey::new(),
            units,
            events_count: 1,
            amount_cents,
        }
    }

    #[test]
    fn metric_lookups_take_the_largest_line() {
        let api_calls = Uuid::new_v4();
        let storage = Uuid::new_v4();
        let usage = SubscriptionUsage {
            subscription_id: Uuid::new_v4(),
            from_datetime: Utc::now(),
            to_datetime: Utc::now(),
            currency: "USD".to_string(),
            amount_cents: 1700,
            charges: vec![
                line(api_calls, dec!(10), 500),
                line(api_calls, dec!(4), 700),
                line(storage, dec!(2.5), 500),
            ],
        };

        assert_eq!(usage.max_amount_for_metric(api_calls), 700);
        assert_eq!(usage.max_units_for_metric(api_calls), dec!(10));
        assert_eq!(usage.max_units_for_metric(Uuid::new_v4()), Decimal::ZERO);
    }
}
