//! Validated creation of the metering catalog: customers, plans, subscriptions,
//! billable metrics, charges, alerts and dunning campaigns.

use crate::models::{
    AggregationType, Alert, AlertType, BillableMetric, Charge, ChargeModel, CreateAlert,
    CreateBillableMetric, CreateCharge, CreateCustomer, CreateDunningCampaign, CreatePlan,
    CreateSubscription, Customer, DunningCampaign, Plan, Subscription, ALL_FILTER_VALUES,
};
use crate::services::charge_models;
use crate::services::database::{self, Database};
use crate::services::usage_alerts::wallet_value;
use ledger_service::services::Database as LedgerDatabase;
use rust_decimal::Decimal;
use service_core::context::RequestContext;
use service_core::error::AppError;
use std::collections::HashSet;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct CatalogService {
    db: Database,
}

impl CatalogService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id))]
    pub async fn create_customer(
        &self,
        ctx: &RequestContext,
        input: CreateCustomer,
    ) -> Result<Customer, AppError> {
        if ledger_service::models::subunit_to_unit(&input.currency).is_none() {
            return Err(AppError::validation(
                "invalid_currency",
                format!("unsupported currency '{}'", input.currency),
            ));
        }
        if let Some(ref zone) = input.timezone {
            if zone.parse::<chrono_tz::Tz>().is_err() {
                return Err(AppError::validation(
                    "invalid_timezone",
                    format!("unknown timezone '{}'", zone),
                ));
            }
        }
        let mut conn = self.acquire().await?;
        database::insert_customer(&mut conn, ctx.organization_id, &input).await
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id))]
    pub async fn create_plan(
        &self,
        ctx: &RequestContext,
        input: CreatePlan,
    ) -> Result<Plan, AppError> {
        if input.amount_cents < 0 {
            return Err(AppError::validation(
                "invalid_amount",
                "plan amount must not be negative",
            ));
        }
        let mut conn = self.acquire().await?;
        database::insert_plan(&mut conn, ctx.organization_id, &input).await
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id))]
    pub async fn create_subscription(
        &self,
        ctx: &RequestContext,
        input: CreateSubscription,
    ) -> Result<Subscription, AppError> {
        if self
            .db
            .get_customer(ctx.organization_id, input.customer_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "customer {} not found",
                input.customer_id
            )));
        }
        match self.db.get_plan(input.plan_id).await? {
            Some(plan) if plan.organization_id == ctx.organization_id => {}
            _ => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "plan {} not found",
                    input.plan_id
                )))
            }
        }
        let mut conn = self.acquire().await?;
        database::insert_subscription(&mut conn, ctx.organization_id, &input).await
    }

    /// Create a billable metric and its filter keys.
    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, code = %input.code))]
    pub async fn create_billable_metric(
        &self,
        ctx: &RequestContext,
        input: CreateBillableMetric,
    ) -> Result<BillableMetric, AppError> {
        validate_metric(&input)?;

        let mut tx = self.db.begin().await?;
        let metric = database::insert_billable_metric(&mut tx, ctx.organization_id, &input).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit billable metric", e))?;

        info!(
            metric_id = %metric.id,
            aggregation_type = %metric.aggregation_type,
            "Billable metric created"
        );
        Ok(metric)
    }

    /// Soft-delete a metric. Historical fees keep pointing at it.
    #[instrument(skip(self, ctx), fields(org = %ctx.organization_id))]
    pub async fn discard_billable_metric(
        &self,
        ctx: &RequestContext,
        metric_id: Uuid,
    ) -> Result<(), AppError> {
        let metric = self.owned_metric(ctx, metric_id).await?;
        let mut tx = self.db.begin().await?;
        database::discard_billable_metric(&mut tx, metric.id).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit metric discard", e))?;
        info!(metric_id = %metric.id, "Billable metric discarded");
        Ok(())
    }

    /// Create a charge with its filters.
    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, plan_id = %input.plan_id))]
    pub async fn create_charge(
        &self,
        ctx: &RequestContext,
        input: CreateCharge,
    ) -> Result<Charge, AppError> {
        let metric = self.owned_metric(ctx, input.billable_metric_id).await?;
        let aggregation_type = metric.parsed_aggregation_type().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "unknown aggregation type '{}'",
                metric.aggregation_type
            ))
        })?;
        validate_charge(&input, &metric, aggregation_type)?;

        let mut tx = self.db.begin().await?;
        let metric_filters = database::metric_filters(&mut tx, metric.id).await?;
        for filter in &input.filters {
            for (key, values) in &filter.values {
                let Some((_, _, allowed)) = metric_filters.iter().find(|(_, k, _)| k == key)
                else {
                    return Err(AppError::validation(
                        "invalid_charge_filter",
                        format!("metric has no filter '{}'", key),
                    ));
                };
                let unknown = values
                    .iter()
                    .find(|v| v.as_str() != ALL_FILTER_VALUES && !allowed.contains(v));
                if let Some(value) = unknown {
                    return Err(AppError::validation(
                        "invalid_charge_filter",
                        format!("value '{}' is not allowed for '{}'", value, key),
                    ));
                }
            }
        }

        let charge =
            database::insert_charge(&mut tx, ctx.organization_id, &input, &metric_filters).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit charge", e))?;

        info!(
            charge_id = %charge.id,
            charge_model = %charge.charge_model,
            filters = input.filters.len(),
            "Charge created"
        );
        Ok(charge)
    }

    /// Soft-delete a charge filter. Fees already attributed to it are untouched.
    #[instrument(skip(self, _ctx))]
    pub async fn discard_charge_filter(
        &self,
        _ctx: &RequestContext,
        charge_filter_id: Uuid,
    ) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        if !database::discard_charge_filter(&mut tx, charge_filter_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "charge filter {} not found",
                charge_filter_id
            )));
        }
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit filter discard", e))?;
        Ok(())
    }

    /// Create an alert and its thresholds.
    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, alert_type = input.alert_type.as_str()))]
    pub async fn create_alert(
        &self,
        ctx: &RequestContext,
        input: CreateAlert,
    ) -> Result<Alert, AppError> {
        validate_alert(&input)?;
        if let Some(metric_id) = input.billable_metric_id {
            self.owned_metric(ctx, metric_id).await?;
        }
        // Wallet alerts watch for decreases, starting from the balance at creation.
        let previous_value = match input.wallet_id {
            Some(wallet_id) if input.alert_type.is_wallet_alert() => {
                let wallet = LedgerDatabase::from_pool(self.db.pool().clone())
                    .get_wallet(wallet_id)
                    .await?
                    .filter(|w| w.organization_id == ctx.organization_id)
                    .ok_or_else(|| {
                        AppError::NotFound(anyhow::anyhow!("wallet {} not found", wallet_id))
                    })?;
                wallet_value(input.alert_type, &wallet).unwrap_or_default()
            }
            _ => Decimal::ZERO,
        };

        let mut tx = self.db.begin().await?;
        let alert =
            database::insert_alert(&mut tx, ctx.organization_id, &input, previous_value).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit alert", e))?;

        info!(alert_id = %alert.id, thresholds = input.thresholds.len(), "Alert created");
        Ok(alert)
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, code = %input.code))]
    pub async fn create_dunning_campaign(
        &self,
        ctx: &RequestContext,
        input: CreateDunningCampaign,
    ) -> Result<DunningCampaign, AppError> {
        if input.max_attempts < 1 {
            return Err(AppError::validation(
                "invalid_max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        if input.days_between_attempts < 0 {
            return Err(AppError::validation(
                "invalid_days_between_attempts",
                "days_between_attempts must not be negative",
            ));
        }
        let mut currencies = HashSet::new();
        for (currency, amount_cents) in &input.thresholds {
            if *amount_cents < 0 || !currencies.insert(currency.as_str()) {
                return Err(AppError::validation(
                    "invalid_dunning_threshold",
                    format!("invalid threshold for {}", currency),
                ));
            }
        }

        let mut tx = self.db.begin().await?;
        let campaign =
            database::insert_dunning_campaign(&mut tx, ctx.organization_id, &input).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit dunning campaign", e))?;
        Ok(campaign)
    }

    async fn owned_metric(
        &self,
        ctx: &RequestContext,
        metric_id: Uuid,
    ) -> Result<BillableMetric, AppError> {
        match self.db.get_billable_metric(metric_id).await? {
            Some(metric) if metric.organization_id == ctx.organization_id => Ok(metric),
            _ => Err(AppError::NotFound(anyhow::anyhow!(
                "billable metric {} not found",
                metric_id
            ))),
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, AppError> {
        self.db
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))
    }
}

pub fn validate_metric(input: &CreateBillableMetric) -> Result<(), AppError> {
    let needs_field = !matches!(
        input.aggregation_type,
        AggregationType::Count | AggregationType::Custom
    );
    if needs_field && input.field_name.as_deref().map_or(true, str::is_empty) {
        return Err(AppError::validation(
            "field_name_required",
            format!("{} aggregation needs a field_name", input.aggregation_type.as_str()),
        ));
    }
    if input.aggregation_type == AggregationType::Custom && input.custom_aggregator.is_none() {
        return Err(AppError::validation(
            "custom_aggregator_required",
            "custom aggregation needs an aggregator name",
        ));
    }
    if input.recurring
        && matches!(
            input.aggregation_type,
            AggregationType::Max | AggregationType::Latest
        )
    {
        return Err(AppError::validation(
            "invalid_recurring_metric",
            format!("{} metrics cannot be recurring", input.aggregation_type.as_str()),
        ));
    }
    if let Some((key, _)) = input.filters.iter().find(|(_, values)| values.is_empty()) {
        return Err(AppError::validation(
            "invalid_metric_filter",
            format!("filter '{}' has no values", key),
        ));
    }
    Ok(())
}

pub fn validate_charge(
    input: &CreateCharge,
    metric: &BillableMetric,
    aggregation_type: AggregationType,
) -> Result<(), AppError> {
    if input.prorated && !(metric.recurring && aggregation_type.supports_proration()) {
        return Err(AppError::validation(
            "invalid_prorated_charge",
            "proration needs a recurring sum or unique_count metric",
        ));
    }
    if input.prorated && input.charge_model != ChargeModel::Standard && !input.pay_in_advance {
        return Err(AppError::validation(
            "invalid_prorated_charge",
            "only standard charges in arrears can be prorated",
        ));
    }
    if input.pay_in_advance
        && matches!(
            aggregation_type,
            AggregationType::Max | AggregationType::Latest | AggregationType::WeightedSum
        )
    {
        return Err(AppError::validation(
            "invalid_pay_in_advance_charge",
            format!(
                "{} metrics cannot be billed in advance",
                aggregation_type.as_str()
            ),
        ));
    }
    if let Some(filter) = input.filters.iter().find(|f| f.values.is_empty()) {
        return Err(AppError::validation(
            "invalid_charge_filter",
            format!(
                "filter '{}' has no values",
                filter.invoice_display_name.as_deref().unwrap_or_default()
            ),
        ));
    }
    if let Some((key, _)) = input
        .filters
        .iter()
        .flat_map(|f| f.values.iter())
        .find(|(_, values)| values.is_empty())
    {
        return Err(AppError::validation(
            "invalid_charge_filter",
            format!("filter key '{}' has no values", key),
        ));
    }

    // Price a nominal quantity so malformed properties fail at creation.
    charge_models::apply(
        input.charge_model,
        &input.properties,
        charge_models::PricingInput::units(Decimal::ONE),
    )?;
    for filter in &input.filters {
        if !filter.properties.is_null() && filter.properties != serde_json::json!({}) {
            charge_models::apply(
                input.charge_model,
                &filter.properties,
                charge_models::PricingInput::units(Decimal::ONE),
            )?;
        }
    }
    Ok(())
}

pub fn validate_alert(input: &CreateAlert) -> Result<(), AppError> {
    if input.thresholds.is_empty() {
        return Err(AppError::validation(
            "invalid_thresholds",
            "an alert needs at least one threshold",
        ));
    }
    if input.thresholds.iter().filter(|t| t.recurring).count() > 1 {
        return Err(AppError::validation(
            "invalid_thresholds",
            "only one recurring threshold is allowed",
        ));
    }
    if input.thresholds.iter().any(|t| t.value <= Decimal::ZERO && t.recurring) {
        return Err(AppError::validation(
            "invalid_thresholds",
            "recurring threshold must be positive",
        ));
    }
    let mut seen = HashSet::new();
    for threshold in input.thresholds.iter().filter(|t| !t.recurring) {
        if !seen.insert(threshold.value.normalize()) {
            return Err(AppError::validation(
                "invalid_thresholds",
                format!("duplicate threshold {}", threshold.value),
            ));
        }
    }

    let alert_type = input.alert_type;
    if alert_type.is_wallet_alert() {
        if input.wallet_id.is_none() {
            return Err(AppError::validation(
                "wallet_required",
                format!("{} alerts need a wallet", alert_type.as_str()),
            ));
        }
    } else if input.subscription_external_id.is_none() {
        return Err(AppError::validation(
            "subscription_required",
            format!("{} alerts need a subscription", alert_type.as_str()),
        ));
    }

    let needs_metric = matches!(
        alert_type,
        AlertType::BillableMetricCurrentUsageAmount | AlertType::BillableMetricCurrentUsageUnits
    );
    if needs_metric != input.billable_metric_id.is_some() {
        return Err(AppError::validation(
            "invalid_billable_metric",
            format!(
                "{} alerts {} a billable metric",
                alert_type.as_str(),
                if needs_metric { "need" } else { "do not take" }
            ),
        ));
    }
    Ok(())
}
