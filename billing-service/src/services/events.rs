//! Event ingestion: storage, unique-value tracking, activity and pay-in-advance fees.

use super::aggregation::{cached_aggregation_lock, AggregationScope, GroupKey};
use super::charge_filters::{match_filter, matching_and_ignored, unfiltered_ignored};
use super::charge_models::{self, PricingInput};
use super::current_usage::CurrentUsageService;
use super::database::{self, Database};
use super::metrics::record_event_ingested;
use crate::models::{
    AggregationType, BillableMetric, Charge, Event, Fee, NewEvent, QuantifiedOperation,
    Subscription,
};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::context::RequestContext;
use service_core::error::AppError;
use service_core::locks::{acquire_advisory_xact_lock, DEFAULT_LOCK_TIMEOUT};
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Ingested { event: Event, fees: Vec<Fee> },
    /// The transaction id was already ingested for this subscription.
    Duplicate,
}

#[derive(Clone)]
pub struct EventIngestor {
    db: Database,
    usage: CurrentUsageService,
}

fn require(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            "value_is_mandatory",
            format!("'{}' is required", field),
        ));
    }
    Ok(())
}

/// Numeric value of `field`, `None` when absent or null.
///
/// Strings must be plain decimals and numbers must fit a [`Decimal`], so every
/// stored value casts to `NUMERIC` when aggregated.
fn numeric_property(
    properties: &serde_json::Value,
    field: &str,
) -> Result<Option<Decimal>, AppError> {
    let invalid = |raw: &str| {
        AppError::validation(
            "invalid_field_value",
            format!("'{}' must be numeric, got '{}'", field, raw),
        )
    };
    match properties.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => {
            let raw = n.to_string();
            let parsed = if raw.contains(|c: char| c.eq_ignore_ascii_case(&'e')) {
                Decimal::from_scientific(&raw)
            } else {
                raw.parse::<Decimal>()
            };
            parsed.map(Some).map_err(|_| invalid(&raw))
        }
        Some(serde_json::Value::String(s)) => {
            let raw = s.trim();
            let plain = raw
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'));
            if !plain || !raw.chars().any(|c| c.is_ascii_digit()) {
                return Err(invalid(raw));
            }
            raw.parse::<Decimal>().map(Some).map_err(|_| invalid(raw))
        }
        Some(other) => Err(invalid(&other.to_string())),
    }
}

/// Reject events whose aggregated field would not cast to a number.
fn validate_field_value(
    aggregation_type: AggregationType,
    metric: &BillableMetric,
    properties: &serde_json::Value,
) -> Result<(), AppError> {
    if !aggregation_type.reads_numeric_field() {
        return Ok(());
    }
    match metric.field_name.as_deref() {
        Some(field) => numeric_property(properties, field).map(|_| ()),
        None => Ok(()),
    }
}

/// Change an event brings to the running aggregation of a pay-in-advance charge.
fn event_delta(
    aggregation_type: AggregationType,
    metric: &BillableMetric,
    event: &Event,
    unique_delta: Decimal,
) -> Result<Decimal, AppError> {
    match aggregation_type {
        AggregationType::Count => Ok(Decimal::ONE),
        AggregationType::UniqueCount => Ok(unique_delta),
        AggregationType::Sum => {
            let field = metric.field_name.as_deref().unwrap_or_default();
            Ok(numeric_property(&event.properties, field)?.unwrap_or(Decimal::ZERO))
        }
        _ => Ok(Decimal::ZERO),
    }
}

impl EventIngestor {
    pub fn new(db: Database, usage: CurrentUsageService) -> Self {
        Self { db, usage }
    }

    /// Store one event and derive everything it affects, in one transaction.
    ///
    /// Re-sending a transaction id is a no-op reported as [`IngestOutcome::Duplicate`].
    #[instrument(skip(self, ctx, input), fields(
        org = %ctx.organization_id,
        code = %input.code,
        transaction_id = %input.transaction_id,
    ))]
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        input: NewEvent,
    ) -> Result<IngestOutcome, AppError> {
        let result = self.ingest_inner(ctx, input).await;
        let outcome = match &result {
            Ok(IngestOutcome::Ingested { .. }) => "accepted",
            Ok(IngestOutcome::Duplicate) => "duplicate",
            Err(_) => "rejected",
        };
        record_event_ingested(outcome);
        result
    }

    async fn ingest_inner(
        &self,
        ctx: &RequestContext,
        input: NewEvent,
    ) -> Result<IngestOutcome, AppError> {
        require(&input.transaction_id, "transaction_id")?;
        require(&input.external_subscription_id, "external_subscription_id")?;
        require(&input.code, "code")?;

        let org = ctx.organization_id;
        let subscription = self
            .db
            .find_subscription_by_external_id(org, &input.external_subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    input.external_subscription_id
                ))
            })?;
        let metric = self.db.find_billable_metric(org, &input.code).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Billable metric {} not found", input.code))
        })?;
        let aggregation_type = metric.parsed_aggregation_type().ok_or_else(|| {
            AppError::AggregationFailure(anyhow::anyhow!(
                "unknown aggregation type '{}'",
                metric.aggregation_type
            ))
        })?;
        validate_field_value(aggregation_type, &metric, &input.properties)?;
        let timestamp = input.timestamp.unwrap_or_else(Utc::now);

        let mut tx = self.db.begin().await?;
        let Some(event) = database::insert_event(&mut tx, org, &input, timestamp).await? else {
            debug!("Duplicate event ignored");
            return Ok(IngestOutcome::Duplicate);
        };

        let unique_delta = if aggregation_type == AggregationType::UniqueCount {
            Self::track_unique_value(&mut tx, &metric, &event).await?
        } else {
            Decimal::ZERO
        };

        database::track_subscription_activity(&mut tx, org, subscription.id).await?;

        let charges: Vec<Charge> = self
            .db
            .charges_for_plan(subscription.plan_id)
            .await?
            .into_iter()
            .filter(|c| c.billable_metric_id == metric.id && c.pay_in_advance)
            .collect();

        let mut fees = Vec::new();
        if !charges.is_empty() {
            let delta = event_delta(aggregation_type, &metric, &event, unique_delta)?;
            for charge in &charges {
                if let Some(fee) = self
                    .bill_in_advance(&mut tx, &subscription, &metric, charge, &event, delta)
                    .await?
                {
                    fees.push(fee);
                }
            }
        }

        ledger_service::services::database::flag_customer_wallets_for_refresh(
            &mut tx,
            org,
            subscription.customer_id,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit event", e))?;

        info!(event_id = %event.id, fees = fees.len(), "Event ingested");
        Ok(IngestOutcome::Ingested { event, fees })
    }

    /// Start or end the presence of the event's unique value. Returns the count change.
    async fn track_unique_value(
        conn: &mut PgConnection,
        metric: &BillableMetric,
        event: &Event,
    ) -> Result<Decimal, AppError> {
        let field = metric.field_name.as_deref().unwrap_or_default();
        let Some(external_id) = event.property(field) else {
            return Ok(Decimal::ZERO);
        };

        let changed = match QuantifiedOperation::from_properties(&event.properties) {
            QuantifiedOperation::Add => database::add_quantified_event(
                conn,
                event.organization_id,
                metric.id,
                &event.external_subscription_id,
                &external_id,
                &event.properties,
                event.timestamp,
            )
            .await?
            .map(|_| Decimal::ONE),
            QuantifiedOperation::Remove => database::remove_quantified_event(
                conn,
                metric.id,
                &event.external_subscription_id,
                &external_id,
                event.timestamp,
            )
            .await?
            .map(|_| Decimal::NEGATIVE_ONE),
        };
        Ok(changed.unwrap_or(Decimal::ZERO))
    }

    /// Record the running aggregation for one charge and a fee for any growth.
    async fn bill_in_advance(
        &self,
        conn: &mut PgConnection,
        subscription: &Subscription,
        metric: &BillableMetric,
        charge: &Charge,
        event: &Event,
        delta: Decimal,
    ) -> Result<Option<Fee>, AppError> {
        let model = charge.parsed_charge_model().ok_or_else(|| {
            AppError::validation(
                "invalid_charge_model",
                format!("unknown charge model '{}'", charge.charge_model),
            )
        })?;
        let (period, currency) = self.usage.period_for(subscription, event.timestamp).await?;
        let (charge_filters, definitions) = self.db.filter_definitions(charge.id).await?;

        let matched = match_filter(&definitions, &event.properties);
        let (charge_filter_id, filters, properties) = match matched {
            Some(definition) => (
                Some(definition.filter_id),
                matching_and_ignored(&definitions, definition),
                charge_filters
                    .iter()
                    .find(|f| f.id == definition.filter_id)
                    .map(|f| f.properties.clone())
                    .unwrap_or_else(|| charge.properties.clone()),
            ),
            None => (None, unfiltered_ignored(&definitions), charge.properties.clone()),
        };

        let mut scope =
            AggregationScope::new(subscription.clone(), metric.clone(), charge.clone(), period)?
                .with_filter(charge_filter_id, filters);
        let keys = charge.grouped_by();
        if !keys.is_empty() {
            let group: GroupKey = keys
                .iter()
                .map(|k| (k.clone(), event.property(k)))
                .collect();
            scope = scope.with_group(group);
        }

        acquire_advisory_xact_lock(
            conn,
            &cached_aggregation_lock(charge.id, &subscription.external_id),
            DEFAULT_LOCK_TIMEOUT,
        )
        .await?;
        let values = self
            .usage
            .engine()
            .aggregate_pay_in_advance(conn, &scope, event, delta)
            .await?;

        if values.billed <= Decimal::ZERO {
            return Ok(None);
        }

        let billed_total = values
            .max_aggregation_with_proration
            .unwrap_or(values.max_aggregation);
        let already_billed = billed_total - values.billed;
        let amount = charge_models::apply(model, &properties, PricingInput::units(billed_total))?
            - charge_models::apply(model, &properties, PricingInput::units(already_billed))?;

        let fee = Fee {
            id: Uuid::new_v4(),
            organization_id: subscription.organization_id,
            subscription_id: subscription.id,
            charge_id: charge.id,
            charge_filter_id,
            invoice_id: None,
            event_id: Some(event.id),
            pay_in_advance: true,
            units: values.billed,
            amount_cents: charge_models::to_cents(amount, &currency)?,
            amount_currency: currency,
            period_from: period.from,
            period_to: period.to,
            created_at: Utc::now(),
        };
        database::insert_fee(conn, &fee).await?;
        debug!(
            charge_id = %charge.id,
            units = %fee.units,
            amount_cents = fee.amount_cents,
            "Pay-in-advance fee recorded"
        );
        Ok(Some(fee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn metric(aggregation_type: AggregationType, field_name: Option<&str>) -> BillableMetric {
        BillableMetric {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            code: "storage".to_string(),
            name: "Storage".to_string(),
            aggregation_type: aggregation_type.as_str().to_string(),
            field_name: field_name.map(str::to_string),
            recurring: false,
            custom_aggregator: None,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    fn event(properties: serde_json::Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            transaction_id: "tx_1".to_string(),
            external_subscription_id: "sub_1".to_string(),
            code: "storage".to_string(),
            timestamp: Utc::now(),
            properties,
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sum_delta_reads_the_field() {
        let sum = metric(AggregationType::Sum, Some("gb"));
        let delta = |properties: serde_json::Value| {
            event_delta(AggregationType::Sum, &sum, &event(properties), Decimal::ZERO)
        };
        assert_eq!(delta(json!({"gb": "2.5"})).unwrap(), dec!(2.5));
        assert_eq!(delta(json!({"gb": 4})).unwrap(), dec!(4));
        assert_eq!(delta(json!({})).unwrap(), Decimal::ZERO);
        let err = delta(json!({"gb": "lots"})).unwrap_err();
        assert_eq!(err.error_code(), "invalid_field_value");
    }

    #[test]
    fn numeric_fields_are_checked_for_every_numeric_aggregation() {
        for aggregation_type in [
            AggregationType::Sum,
            AggregationType::Max,
            AggregationType::Latest,
            AggregationType::WeightedSum,
        ] {
            let m = metric(aggregation_type, Some("gb"));
            for bad in [
                json!({"gb": "lots"}),
                json!({"gb": true}),
                json!({"gb": {"v": 1}}),
                json!({"gb": "1_000"}),
                json!({"gb": "."}),
            ] {
                let err = validate_field_value(aggregation_type, &m, &bad).unwrap_err();
                assert_eq!(err.error_code(), "invalid_field_value");
            }
            assert!(validate_field_value(aggregation_type, &m, &json!({"gb": " 2.5 "})).is_ok());
            assert!(validate_field_value(aggregation_type, &m, &json!({"gb": -3})).is_ok());
            assert!(validate_field_value(aggregation_type, &m, &json!({"gb": 0.00001})).is_ok());
            assert!(validate_field_value(aggregation_type, &m, &json!({"gb": null})).is_ok());
            assert!(validate_field_value(aggregation_type, &m, &json!({})).is_ok());
        }

        let unique = metric(AggregationType::UniqueCount, Some("user_id"));
        let value = json!({"user_id": "u1"});
        assert!(validate_field_value(AggregationType::UniqueCount, &unique, &value).is_ok());
    }

    #[test]
    fn count_and_unique_count_deltas() {
        let count = metric(AggregationType::Count, None);
        assert_eq!(
            event_delta(AggregationType::Count, &count, &event(json!({})), Decimal::ZERO).unwrap(),
            Decimal::ONE
        );
        let unique = metric(AggregationType::UniqueCount, Some("user_id"));
        let removal = event_delta(
            AggregationType::UniqueCount,
            &unique,
            &event(json!({})),
            Decimal::NEGATIVE_ONE,
        );
        assert_eq!(removal.unwrap(), Decimal::NEGATIVE_ONE);
    }

    #[test]
    fn blank_identifiers_are_rejected() {
        assert_eq!(require("  ", "code").unwrap_err().error_code(), "value_is_mandatory");
        assert!(require("api_calls", "code").is_ok());
    }
}
