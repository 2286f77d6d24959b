//! Database service for billing-service.
//!
//! Pool-backed reads live on [`Database`]. Writes that must share a transaction are
//! free functions over `&mut PgConnection`. Soft-deleted rows are filtered with an
//! explicit `deleted_at IS NULL` at every read.

use crate::models::{
    Alert, AlertThreshold, BillableMetric, CachedAggregation, Charge, ChargeFilter,
    ChargeFilterValue, CreateAlert, CreateBillableMetric, CreateCharge, CreateCustomer,
    CreateDunningCampaign, CreateInvoice, CreatePlan, CreateSubscription, CrossedThreshold,
    Customer, DunningCampaign, DunningCampaignThreshold, Event, Fee, Invoice, LifetimeUsage,
    NewEvent, Organization, PaymentRequest, Plan, QuantifiedEvent, Subscription,
    SubscriptionActivity, TriggeredAlert,
};
use crate::services::charge_filters::FilterDefinition;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const CUSTOMER_COLUMNS: &str = "id, organization_id, external_id, name, currency, timezone, \
     overdue_balance_cents, applied_dunning_campaign_id, exclude_from_dunning_campaign, \
     last_dunning_campaign_attempt, last_dunning_campaign_attempt_at, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, organization_id, customer_id, plan_id, external_id, \
     status, billing_time, subscription_at, started_at, terminated_at, created_at, updated_at";

const METRIC_COLUMNS: &str = "id, organization_id, code, name, aggregation_type, field_name, \
     recurring, custom_aggregator, deleted_at, created_at";

const CHARGE_COLUMNS: &str = "id, organization_id, plan_id, billable_metric_id, charge_model, \
     pay_in_advance, prorated, properties, deleted_at, created_at";

const EVENT_COLUMNS: &str = "id, organization_id, transaction_id, external_subscription_id, code, \
     timestamp, properties, metadata, created_at";

const CACHED_AGGREGATION_COLUMNS: &str = "id, organization_id, event_id, charge_id, \
     charge_filter_id, external_subscription_id, grouped_by, timestamp, current_aggregation, \
     max_aggregation, max_aggregation_with_proration, created_at";

const ALERT_COLUMNS: &str = "id, organization_id, alert_type, code, name, \
     subscription_external_id, wallet_id, billable_metric_id, previous_value, last_processed_at, \
     deleted_at, created_at, updated_at";

const LIFETIME_USAGE_COLUMNS: &str = "id, organization_id, subscription_id, \
     current_usage_amount_cents, invoiced_usage_amount_cents, historical_usage_amount_cents, \
     current_usage_amount_refreshed_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, organization_id, customer_id, currency, status, \
     total_amount_cents, payment_overdue, issuing_date, created_at";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run the metering migrations. Shared and ledger migrations must run first.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running billing migrations");
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Billing migrations completed");
        Ok(())
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::from_db("Failed to begin transaction", e))
    }

    // =========================================================================
    // Customers and subscriptions
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>, AppError> {
        sqlx::query_as::<_, Organization>(
            "SELECT id, name, timezone, created_at FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get organization", e))
    }

    #[instrument(skip(self))]
    pub async fn get_customer(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, Customer>(&format!(
            "SELECT {} FROM customers WHERE organization_id = $1 AND id = $2",
            CUSTOMER_COLUMNS
        ))
        .bind(organization_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get customer", e))?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self))]
    pub async fn get_subscription(
        &self,
        organization_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE organization_id = $1 AND id = $2",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(organization_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get subscription", e))
    }

    #[instrument(skip(self))]
    pub async fn find_subscription_by_external_id(
        &self,
        organization_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription_by_external_id"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE organization_id = $1 AND external_id = $2",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(organization_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to find subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self))]
    pub async fn active_subscriptions_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE customer_id = $1 AND status = 'active' \
             ORDER BY subscription_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list customer subscriptions", e))
    }

    #[instrument(skip(self))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, organization_id, code, name, interval, amount_cents, amount_currency, \
             created_at FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get plan", e))
    }

    // =========================================================================
    // Metrics and charges
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn find_billable_metric(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<Option<BillableMetric>, AppError> {
        sqlx::query_as::<_, BillableMetric>(&format!(
            "SELECT {} FROM billable_metrics \
             WHERE organization_id = $1 AND code = $2 AND deleted_at IS NULL",
            METRIC_COLUMNS
        ))
        .bind(organization_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to find billable metric", e))
    }

    #[instrument(skip(self))]
    pub async fn get_billable_metric(
        &self,
        metric_id: Uuid,
    ) -> Result<Option<BillableMetric>, AppError> {
        sqlx::query_as::<_, BillableMetric>(&format!(
            "SELECT {} FROM billable_metrics WHERE id = $1 AND deleted_at IS NULL",
            METRIC_COLUMNS
        ))
        .bind(metric_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get billable metric", e))
    }

    /// Live charges of a plan, oldest first.
    #[instrument(skip(self))]
    pub async fn charges_for_plan(&self, plan_id: Uuid) -> Result<Vec<Charge>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["charges_for_plan"])
            .start_timer();

        let charges = sqlx::query_as::<_, Charge>(&format!(
            "SELECT {} FROM charges WHERE plan_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, id",
            CHARGE_COLUMNS
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list charges", e))?;

        timer.observe_duration();
        Ok(charges)
    }

    /// Live filters of a charge, in creation order.
    #[instrument(skip(self))]
    pub async fn charge_filters(&self, charge_id: Uuid) -> Result<Vec<ChargeFilter>, AppError> {
        sqlx::query_as::<_, ChargeFilter>(
            r#"
            SELECT id, charge_id, invoice_display_name, properties, deleted_at, created_at
            FROM charge_filters
            WHERE charge_id = $1 AND deleted_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(charge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list charge filters", e))
    }

    /// Filters of a charge with their constraints, in creation order.
    #[instrument(skip(self))]
    pub async fn filter_definitions(
        &self,
        charge_id: Uuid,
    ) -> Result<(Vec<ChargeFilter>, Vec<FilterDefinition>), AppError> {
        let filters = self.charge_filters(charge_id).await?;
        let values = sqlx::query_as::<_, ChargeFilterValue>(
            r#"
            SELECT v.id, v.charge_filter_id, v.billable_metric_filter_id, bmf.key, v.values
            FROM charge_filter_values v
            JOIN charge_filters f ON f.id = v.charge_filter_id
            JOIN billable_metric_filters bmf ON bmf.id = v.billable_metric_filter_id
            WHERE f.charge_id = $1
              AND f.deleted_at IS NULL
              AND v.deleted_at IS NULL
              AND bmf.deleted_at IS NULL
            "#,
        )
        .bind(charge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list charge filter values", e))?;

        let order: Vec<Uuid> = filters.iter().map(|f| f.id).collect();
        let definitions = FilterDefinition::from_values(&order, &values);
        Ok((filters, definitions))
    }

    // =========================================================================
    // Invoices and fees
    // =========================================================================

    /// Total of the customer's draft invoices in `currency`.
    #[instrument(skip(self))]
    pub async fn draft_invoices_cents(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(total_amount_cents), 0)::BIGINT
            FROM invoices
            WHERE customer_id = $1 AND currency = $2 AND status = 'draft'
            "#,
        )
        .bind(customer_id)
        .bind(currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to total draft invoices", e))
    }

    /// Pay-in-advance fees of a subscription within a period, already billed.
    #[instrument(skip(self))]
    pub async fn pay_in_advance_fees_cents(
        &self,
        subscription_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(amount_cents), 0)::BIGINT
            FROM fees
            WHERE subscription_id = $1 AND pay_in_advance
              AND period_from >= $2 AND period_to <= $3
            "#,
        )
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to total pay-in-advance fees", e))
    }

    /// Usage already invoiced for a subscription, outside draft invoices.
    #[instrument(skip(self))]
    pub async fn invoiced_usage_cents(&self, subscription_id: Uuid) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(f.amount_cents), 0)::BIGINT
            FROM fees f
            JOIN invoices i ON i.id = f.invoice_id
            WHERE f.subscription_id = $1 AND i.status = 'finalized'
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to total invoiced usage", e))
    }

    #[instrument(skip(self))]
    pub async fn fees_for_event(&self, event_id: Uuid) -> Result<Vec<Fee>, AppError> {
        sqlx::query_as::<_, Fee>(
            r#"
            SELECT id, organization_id, subscription_id, charge_id, charge_filter_id, invoice_id,
                   event_id, pay_in_advance, units, amount_cents, amount_currency, period_from,
                   period_to, created_at
            FROM fees WHERE event_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list event fees", e))
    }

    // =========================================================================
    // Usage monitoring
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn alerts_for_subscription(
        &self,
        organization_id: Uuid,
        subscription_external_id: &str,
    ) -> Result<Vec<Alert>, AppError> {
        sqlx::query_as::<_, Alert>(&format!(
            "SELECT {} FROM alerts \
             WHERE organization_id = $1 AND subscription_external_id = $2 AND deleted_at IS NULL \
             ORDER BY created_at, id",
            ALERT_COLUMNS
        ))
        .bind(organization_id)
        .bind(subscription_external_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list subscription alerts", e))
    }

    #[instrument(skip(self))]
    pub async fn alerts_for_wallet(&self, wallet_id: Uuid) -> Result<Vec<Alert>, AppError> {
        sqlx::query_as::<_, Alert>(&format!(
            "SELECT {} FROM alerts WHERE wallet_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, id",
            ALERT_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list wallet alerts", e))
    }

    #[instrument(skip(self))]
    pub async fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>, AppError> {
        sqlx::query_as::<_, Alert>(&format!(
            "SELECT {} FROM alerts WHERE id = $1 AND deleted_at IS NULL",
            ALERT_COLUMNS
        ))
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get alert", e))
    }

    #[instrument(skip(self))]
    pub async fn alert_thresholds(&self, alert_id: Uuid) -> Result<Vec<AlertThreshold>, AppError> {
        sqlx::query_as::<_, AlertThreshold>(
            r#"
            SELECT id, alert_id, value, code, recurring, created_at
            FROM alert_thresholds WHERE alert_id = $1
            ORDER BY value, id
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list alert thresholds", e))
    }

    #[instrument(skip(self))]
    pub async fn triggered_alerts(&self, alert_id: Uuid) -> Result<Vec<TriggeredAlert>, AppError> {
        sqlx::query_as::<_, TriggeredAlert>(
            r#"
            SELECT id, organization_id, alert_id, subscription_id, wallet_id, current_value,
                   previous_value, crossed_thresholds, triggered_at
            FROM triggered_alerts WHERE alert_id = $1
            ORDER BY triggered_at, id
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list triggered alerts", e))
    }

    #[instrument(skip(self))]
    pub async fn get_lifetime_usage(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<LifetimeUsage>, AppError> {
        sqlx::query_as::<_, LifetimeUsage>(&format!(
            "SELECT {} FROM lifetime_usages WHERE subscription_id = $1",
            LIFETIME_USAGE_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get lifetime usage", e))
    }

    // =========================================================================
    // Dunning
    // =========================================================================

    /// Customers with an overdue balance who are not excluded from dunning.
    #[instrument(skip(self))]
    pub async fn customers_with_overdue_balance(
        &self,
        limit: i64,
    ) -> Result<Vec<Customer>, AppError> {
        sqlx::query_as::<_, Customer>(&format!(
            "SELECT {} FROM customers \
             WHERE overdue_balance_cents > 0 AND NOT exclude_from_dunning_campaign \
             ORDER BY last_dunning_campaign_attempt_at NULLS FIRST, id LIMIT $1",
            CUSTOMER_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list overdue customers", e))
    }

    #[instrument(skip(self))]
    pub async fn payment_requests_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<PaymentRequest>, AppError> {
        sqlx::query_as::<_, PaymentRequest>(
            r#"
            SELECT id, organization_id, customer_id, dunning_campaign_id, number, amount_cents,
                   amount_currency, payment_status, created_at
            FROM payment_requests WHERE customer_id = $1
            ORDER BY number
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list payment requests", e))
    }
}

// -----------------------------------------------------------------------------
// Catalog writes
// -----------------------------------------------------------------------------

#[instrument(skip(conn))]
pub async fn insert_organization(
    conn: &mut PgConnection,
    id: Uuid,
    name: &str,
    timezone: &str,
) -> Result<Organization, AppError> {
    sqlx::query_as::<_, Organization>(
        r#"
        INSERT INTO organizations (id, name, timezone) VALUES ($1, $2, $3)
        RETURNING id, name, timezone, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(timezone)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert organization", e))
}

#[instrument(skip(conn, input), fields(external_id = %input.external_id))]
pub async fn insert_customer(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateCustomer,
) -> Result<Customer, AppError> {
    sqlx::query_as::<_, Customer>(&format!(
        "INSERT INTO customers (id, organization_id, external_id, name, currency, timezone) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
        CUSTOMER_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(&input.external_id)
    .bind(&input.name)
    .bind(&input.currency)
    .bind(&input.timezone)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert customer", e))
}

#[instrument(skip(conn, input), fields(code = %input.code))]
pub async fn insert_plan(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreatePlan,
) -> Result<Plan, AppError> {
    sqlx::query_as::<_, Plan>(
        r#"
        INSERT INTO plans (id, organization_id, code, name, interval, amount_cents, amount_currency)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, organization_id, code, name, interval, amount_cents, amount_currency, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(&input.code)
    .bind(&input.name)
    .bind(input.interval.as_str())
    .bind(input.amount_cents)
    .bind(&input.amount_currency)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert plan", e))
}

#[instrument(skip(conn, input), fields(external_id = %input.external_id))]
pub async fn insert_subscription(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateSubscription,
) -> Result<Subscription, AppError> {
    sqlx::query_as::<_, Subscription>(&format!(
        "INSERT INTO subscriptions (id, organization_id, customer_id, plan_id, external_id, \
         status, billing_time, subscription_at, started_at) \
         VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $7) RETURNING {}",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.customer_id)
    .bind(input.plan_id)
    .bind(&input.external_id)
    .bind(input.billing_time.as_str())
    .bind(input.subscription_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert subscription", e))
}

#[instrument(skip(conn))]
pub async fn terminate_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    terminated_at: DateTime<Utc>,
) -> Result<Subscription, AppError> {
    sqlx::query_as::<_, Subscription>(&format!(
        "UPDATE subscriptions SET status = 'terminated', terminated_at = $2, updated_at = NOW() \
         WHERE id = $1 RETURNING {}",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(subscription_id)
    .bind(terminated_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to terminate subscription", e))
}

#[instrument(skip(conn, input), fields(code = %input.code))]
pub async fn insert_billable_metric(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateBillableMetric,
) -> Result<BillableMetric, AppError> {
    let metric = sqlx::query_as::<_, BillableMetric>(&format!(
        "INSERT INTO billable_metrics (id, organization_id, code, name, aggregation_type, \
         field_name, recurring, custom_aggregator) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {}",
        METRIC_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(&input.code)
    .bind(&input.name)
    .bind(input.aggregation_type.as_str())
    .bind(&input.field_name)
    .bind(input.recurring)
    .bind(&input.custom_aggregator)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert billable metric", e))?;

    for (key, values) in &input.filters {
        sqlx::query(
            r#"
            INSERT INTO billable_metric_filters (id, billable_metric_id, key, values)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(metric.id)
        .bind(key)
        .bind(values)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to insert billable metric filter", e))?;
    }

    Ok(metric)
}

/// Soft-delete a metric together with its filters.
#[instrument(skip(conn))]
pub async fn discard_billable_metric(
    conn: &mut PgConnection,
    metric_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE billable_metrics SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(metric_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to discard billable metric", e))?;
    sqlx::query(
        "UPDATE billable_metric_filters SET deleted_at = NOW() \
         WHERE billable_metric_id = $1 AND deleted_at IS NULL",
    )
    .bind(metric_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to discard billable metric filters", e))?;
    Ok(())
}

/// Live filter keys of a metric with their ids and allowed values.
pub async fn metric_filters(
    conn: &mut PgConnection,
    metric_id: Uuid,
) -> Result<Vec<(Uuid, String, Vec<String>)>, AppError> {
    sqlx::query_as::<_, (Uuid, String, Vec<String>)>(
        r#"
        SELECT id, key, values FROM billable_metric_filters
        WHERE billable_metric_id = $1 AND deleted_at IS NULL
        ORDER BY key
        "#,
    )
    .bind(metric_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to list billable metric filters", e))
}

/// Insert a charge and its filters. `filter_keys` maps metric filter keys to their ids.
#[instrument(skip(conn, input, filter_keys), fields(plan_id = %input.plan_id))]
pub async fn insert_charge(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateCharge,
    filter_keys: &[(Uuid, String, Vec<String>)],
) -> Result<Charge, AppError> {
    let charge = sqlx::query_as::<_, Charge>(&format!(
        "INSERT INTO charges (id, organization_id, plan_id, billable_metric_id, charge_model, \
         pay_in_advance, prorated, properties) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {}",
        CHARGE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.plan_id)
    .bind(input.billable_metric_id)
    .bind(input.charge_model.as_str())
    .bind(input.pay_in_advance)
    .bind(input.prorated)
    .bind(&input.properties)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert charge", e))?;

    for filter in &input.filters {
        let filter_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO charge_filters (id, charge_id, invoice_display_name, properties, created_at)
            VALUES ($1, $2, $3, $4, clock_timestamp())
            "#,
        )
        .bind(filter_id)
        .bind(charge.id)
        .bind(&filter.invoice_display_name)
        .bind(&filter.properties)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to insert charge filter", e))?;

        for (key, values) in &filter.values {
            let Some((metric_filter_id, _, _)) = filter_keys.iter().find(|(_, k, _)| k == key)
            else {
                return Err(AppError::validation(
                    "invalid_charge_filter",
                    format!("unknown filter key '{}'", key),
                ));
            };
            sqlx::query(
                r#"
                INSERT INTO charge_filter_values (id, charge_filter_id, billable_metric_filter_id, values)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(filter_id)
            .bind(metric_filter_id)
            .bind(values)
            .execute(&mut *conn)
            .await
            .map_err(|e| AppError::from_db("Failed to insert charge filter value", e))?;
        }
    }

    Ok(charge)
}

/// Soft-delete one charge filter and its values.
#[instrument(skip(conn))]
pub async fn discard_charge_filter(
    conn: &mut PgConnection,
    charge_filter_id: Uuid,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        "UPDATE charge_filters SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(charge_filter_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to discard charge filter", e))?;
    sqlx::query(
        "UPDATE charge_filter_values SET deleted_at = NOW() \
         WHERE charge_filter_id = $1 AND deleted_at IS NULL",
    )
    .bind(charge_filter_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to discard charge filter values", e))?;
    Ok(result.rows_affected() > 0)
}

#[instrument(skip(conn, input), fields(code = %input.code))]
pub async fn insert_alert(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateAlert,
    previous_value: Decimal,
) -> Result<Alert, AppError> {
    let alert = sqlx::query_as::<_, Alert>(&format!(
        "INSERT INTO alerts (id, organization_id, alert_type, code, name, \
         subscription_external_id, wallet_id, billable_metric_id, previous_value) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {}",
        ALERT_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.alert_type.as_str())
    .bind(&input.code)
    .bind(&input.name)
    .bind(&input.subscription_external_id)
    .bind(input.wallet_id)
    .bind(input.billable_metric_id)
    .bind(previous_value)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert alert", e))?;

    for threshold in &input.thresholds {
        sqlx::query(
            r#"
            INSERT INTO alert_thresholds (id, alert_id, value, code, recurring)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(alert.id)
        .bind(threshold.value)
        .bind(&threshold.code)
        .bind(threshold.recurring)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to insert alert threshold", e))?;
    }

    Ok(alert)
}

#[instrument(skip(conn, input), fields(customer_id = %input.customer_id))]
pub async fn insert_invoice(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateInvoice,
) -> Result<Invoice, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        "INSERT INTO invoices (id, organization_id, customer_id, currency, status, \
         total_amount_cents, payment_overdue, issuing_date) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
        INVOICE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.customer_id)
    .bind(&input.currency)
    .bind(input.status.as_str())
    .bind(input.total_amount_cents)
    .bind(input.payment_overdue)
    .bind(input.issuing_date)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert invoice", e))
}

#[instrument(skip(conn, input), fields(code = %input.code))]
pub async fn insert_dunning_campaign(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateDunningCampaign,
) -> Result<DunningCampaign, AppError> {
    let campaign = sqlx::query_as::<_, DunningCampaign>(
        r#"
        INSERT INTO dunning_campaigns (id, organization_id, code, name, applied_to_organization,
                                       max_attempts, days_between_attempts)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, organization_id, code, name, applied_to_organization, max_attempts,
                  days_between_attempts, deleted_at, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(&input.code)
    .bind(&input.name)
    .bind(input.applied_to_organization)
    .bind(input.max_attempts)
    .bind(input.days_between_attempts)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert dunning campaign", e))?;

    for (currency, amount_cents) in &input.thresholds {
        sqlx::query(
            r#"
            INSERT INTO dunning_campaign_thresholds (id, dunning_campaign_id, currency, amount_cents)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign.id)
        .bind(currency)
        .bind(amount_cents)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to insert dunning threshold", e))?;
    }

    Ok(campaign)
}

// -----------------------------------------------------------------------------
// Events
// -----------------------------------------------------------------------------

/// Insert an event unless its transaction id was already ingested. `None` on duplicates.
#[instrument(skip(conn, input), fields(transaction_id = %input.transaction_id))]
pub async fn insert_event(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &NewEvent,
    timestamp: DateTime<Utc>,
) -> Result<Option<Event>, AppError> {
    let properties = if input.properties.is_null() {
        serde_json::json!({})
    } else {
        input.properties.clone()
    };
    sqlx::query_as::<_, Event>(&format!(
        "INSERT INTO events (id, organization_id, transaction_id, external_subscription_id, \
         code, timestamp, properties) VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (organization_id, external_subscription_id, transaction_id) DO NOTHING \
         RETURNING {}",
        EVENT_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(&input.transaction_id)
    .bind(&input.external_subscription_id)
    .bind(&input.code)
    .bind(timestamp)
    .bind(properties)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert event", e))
}

#[instrument(skip(conn, metadata))]
pub async fn update_event_metadata(
    conn: &mut PgConnection,
    event_id: Uuid,
    metadata: &serde_json::Value,
) -> Result<(), AppError> {
    sqlx::query("UPDATE events SET metadata = metadata || $2 WHERE id = $1")
        .bind(event_id)
        .bind(metadata)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to update event metadata", e))?;
    Ok(())
}

/// Start the presence of a unique value. Returns `None` when it is already present.
#[instrument(skip(conn, properties))]
pub async fn add_quantified_event(
    conn: &mut PgConnection,
    organization_id: Uuid,
    billable_metric_id: Uuid,
    external_subscription_id: &str,
    external_id: &str,
    properties: &serde_json::Value,
    added_at: DateTime<Utc>,
) -> Result<Option<QuantifiedEvent>, AppError> {
    sqlx::query_as::<_, QuantifiedEvent>(
        r#"
        INSERT INTO quantified_events (id, organization_id, billable_metric_id,
                                       external_subscription_id, external_id, properties, added_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (billable_metric_id, external_subscription_id, external_id)
            WHERE removed_at IS NULL DO NOTHING
        RETURNING id, organization_id, billable_metric_id, external_subscription_id, external_id,
                  properties, added_at, removed_at, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(billable_metric_id)
    .bind(external_subscription_id)
    .bind(external_id)
    .bind(properties)
    .bind(added_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to add quantified event", e))
}

/// End the presence of a unique value. Returns `None` when it was not present.
#[instrument(skip(conn))]
pub async fn remove_quantified_event(
    conn: &mut PgConnection,
    billable_metric_id: Uuid,
    external_subscription_id: &str,
    external_id: &str,
    removed_at: DateTime<Utc>,
) -> Result<Option<QuantifiedEvent>, AppError> {
    sqlx::query_as::<_, QuantifiedEvent>(
        r#"
        UPDATE quantified_events SET removed_at = GREATEST($4, added_at)
        WHERE billable_metric_id = $1 AND external_subscription_id = $2 AND external_id = $3
          AND removed_at IS NULL
        RETURNING id, organization_id, billable_metric_id, external_subscription_id, external_id,
                  properties, added_at, removed_at, created_at
        "#,
    )
    .bind(billable_metric_id)
    .bind(external_subscription_id)
    .bind(external_id)
    .bind(removed_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to remove quantified event", e))
}

// -----------------------------------------------------------------------------
// Pay-in-advance aggregation cache and fees
// -----------------------------------------------------------------------------

/// Most recent cached aggregation for a charge, filter and group before `before`.
#[instrument(skip(conn, grouped_by))]
pub async fn latest_cached_aggregation(
    conn: &mut PgConnection,
    charge_id: Uuid,
    charge_filter_id: Option<Uuid>,
    external_subscription_id: &str,
    grouped_by: &serde_json::Value,
    from: DateTime<Utc>,
    before: DateTime<Utc>,
) -> Result<Option<CachedAggregation>, AppError> {
    sqlx::query_as::<_, CachedAggregation>(&format!(
        "SELECT {} FROM cached_aggregations \
         WHERE charge_id = $1 AND charge_filter_id IS NOT DISTINCT FROM $2 \
           AND external_subscription_id = $3 AND grouped_by = $4 \
           AND timestamp >= $5 AND timestamp <= $6 \
         ORDER BY timestamp DESC, created_at DESC LIMIT 1",
        CACHED_AGGREGATION_COLUMNS
    ))
    .bind(charge_id)
    .bind(charge_filter_id)
    .bind(external_subscription_id)
    .bind(grouped_by)
    .bind(from)
    .bind(before)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to get cached aggregation", e))
}

#[instrument(skip(conn, cached), fields(event_id = %cached.event_id, charge_id = %cached.charge_id))]
pub async fn insert_cached_aggregation(
    conn: &mut PgConnection,
    cached: &CachedAggregation,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO cached_aggregations (id, organization_id, event_id, charge_id, charge_filter_id,
                                         external_subscription_id, grouped_by, timestamp,
                                         current_aggregation, max_aggregation,
                                         max_aggregation_with_proration)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (event_id, charge_id) DO NOTHING
        "#,
    )
    .bind(cached.id)
    .bind(cached.organization_id)
    .bind(cached.event_id)
    .bind(cached.charge_id)
    .bind(cached.charge_filter_id)
    .bind(&cached.external_subscription_id)
    .bind(&cached.grouped_by)
    .bind(cached.timestamp)
    .bind(cached.current_aggregation)
    .bind(cached.max_aggregation)
    .bind(cached.max_aggregation_with_proration)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert cached aggregation", e))?;
    Ok(())
}

#[instrument(skip(conn, fee), fields(charge_id = %fee.charge_id, amount_cents = fee.amount_cents))]
pub async fn insert_fee(conn: &mut PgConnection, fee: &Fee) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO fees (id, organization_id, subscription_id, charge_id, charge_filter_id,
                          invoice_id, event_id, pay_in_advance, units, amount_cents,
                          amount_currency, period_from, period_to)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(fee.id)
    .bind(fee.organization_id)
    .bind(fee.subscription_id)
    .bind(fee.charge_id)
    .bind(fee.charge_filter_id)
    .bind(fee.invoice_id)
    .bind(fee.event_id)
    .bind(fee.pay_in_advance)
    .bind(fee.units)
    .bind(fee.amount_cents)
    .bind(&fee.amount_currency)
    .bind(fee.period_from)
    .bind(fee.period_to)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert fee", e))?;
    Ok(())
}

// -----------------------------------------------------------------------------
// Alerts
// -----------------------------------------------------------------------------

#[instrument(skip(conn))]
pub async fn lock_alert(conn: &mut PgConnection, alert_id: Uuid) -> Result<Alert, AppError> {
    sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        ALERT_COLUMNS
    ))
    .bind(alert_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to lock alert", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("alert {} not found", alert_id)))
}

/// Advance `last_processed_at`, and `previous_value` when given.
#[instrument(skip(conn))]
pub async fn update_alert_evaluation(
    conn: &mut PgConnection,
    alert_id: Uuid,
    previous_value: Option<Decimal>,
    processed_at: DateTime<Utc>,
) -> Result<Alert, AppError> {
    sqlx::query_as::<_, Alert>(&format!(
        "UPDATE alerts SET previous_value = COALESCE($2, previous_value), \
         last_processed_at = $3, updated_at = NOW() WHERE id = $1 RETURNING {}",
        ALERT_COLUMNS
    ))
    .bind(alert_id)
    .bind(previous_value)
    .bind(processed_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to update alert", e))
}

#[instrument(skip(conn, crossed), fields(alert_id = %alert.id))]
pub async fn insert_triggered_alert(
    conn: &mut PgConnection,
    alert: &Alert,
    subscription_id: Option<Uuid>,
    current_value: Decimal,
    crossed: &[CrossedThreshold],
    triggered_at: DateTime<Utc>,
) -> Result<TriggeredAlert, AppError> {
    sqlx::query_as::<_, TriggeredAlert>(
        r#"
        INSERT INTO triggered_alerts (id, organization_id, alert_id, subscription_id, wallet_id,
                                      current_value, previous_value, crossed_thresholds,
                                      triggered_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, organization_id, alert_id, subscription_id, wallet_id, current_value,
                  previous_value, crossed_thresholds, triggered_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(alert.organization_id)
    .bind(alert.id)
    .bind(subscription_id)
    .bind(alert.wallet_id)
    .bind(current_value)
    .bind(alert.previous_value)
    .bind(serde_json::to_value(crossed)?)
    .bind(triggered_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert triggered alert", e))
}

/// Put usage alerts of a subscription back to zero for a new billing period.
#[instrument(skip(conn))]
pub async fn reset_usage_alerts(
    conn: &mut PgConnection,
    organization_id: Uuid,
    subscription_external_id: &str,
    alert_types: &[&str],
) -> Result<u64, AppError> {
    let types: Vec<String> = alert_types.iter().map(|t| t.to_string()).collect();
    let result = sqlx::query(
        r#"
        UPDATE alerts SET previous_value = 0, updated_at = NOW()
        WHERE organization_id = $1 AND subscription_external_id = $2
          AND alert_type = ANY($3) AND deleted_at IS NULL
        "#,
    )
    .bind(organization_id)
    .bind(subscription_external_id)
    .bind(&types)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to reset alerts", e))?;
    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------------
// Subscription activity and lifetime usage
// -----------------------------------------------------------------------------

/// Flag a subscription as active. Returns `false` when already flagged.
#[instrument(skip(conn))]
pub async fn track_subscription_activity(
    conn: &mut PgConnection,
    organization_id: Uuid,
    subscription_id: Uuid,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO subscription_activities (id, organization_id, subscription_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (subscription_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(subscription_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to track subscription activity", e))?;
    Ok(result.rows_affected() > 0)
}

/// Mark up to `limit` pending activities as enqueued and return them.
#[instrument(skip(conn))]
pub async fn claim_pending_activities(
    conn: &mut PgConnection,
    limit: i64,
) -> Result<Vec<SubscriptionActivity>, AppError> {
    sqlx::query_as::<_, SubscriptionActivity>(
        r#"
        UPDATE subscription_activities SET enqueued = TRUE, enqueued_at = NOW()
        WHERE id IN (
            SELECT id FROM subscription_activities
            WHERE NOT enqueued
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, organization_id, subscription_id, enqueued, enqueued_at, created_at
        "#,
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to claim subscription activities", e))
}

#[instrument(skip(conn))]
pub async fn delete_subscription_activity(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM subscription_activities WHERE subscription_id = $1")
        .bind(subscription_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to delete subscription activity", e))?;
    Ok(())
}

#[instrument(skip(conn))]
pub async fn upsert_lifetime_usage(
    conn: &mut PgConnection,
    organization_id: Uuid,
    subscription_id: Uuid,
    current_usage_amount_cents: i64,
    invoiced_usage_amount_cents: i64,
) -> Result<LifetimeUsage, AppError> {
    sqlx::query_as::<_, LifetimeUsage>(&format!(
        "INSERT INTO lifetime_usages (id, organization_id, subscription_id, \
         current_usage_amount_cents, invoiced_usage_amount_cents, \
         current_usage_amount_refreshed_at) VALUES ($1, $2, $3, $4, $5, NOW()) \
         ON CONFLICT (subscription_id) DO UPDATE SET \
           current_usage_amount_cents = EXCLUDED.current_usage_amount_cents, \
           invoiced_usage_amount_cents = EXCLUDED.invoiced_usage_amount_cents, \
           current_usage_amount_refreshed_at = NOW(), updated_at = NOW() \
         RETURNING {}",
        LIFETIME_USAGE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(subscription_id)
    .bind(current_usage_amount_cents)
    .bind(invoiced_usage_amount_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to upsert lifetime usage", e))
}

// -----------------------------------------------------------------------------
// Dunning
// -----------------------------------------------------------------------------

#[instrument(skip(conn))]
pub async fn lock_customer(
    conn: &mut PgConnection,
    customer_id: Uuid,
) -> Result<Customer, AppError> {
    sqlx::query_as::<_, Customer>(&format!(
        "SELECT {} FROM customers WHERE id = $1 FOR UPDATE",
        CUSTOMER_COLUMNS
    ))
    .bind(customer_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to lock customer", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("customer {} not found", customer_id)))
}

/// Campaign applying to a customer: its own override, else the organization default.
#[instrument(skip(conn, customer), fields(customer_id = %customer.id))]
pub async fn applicable_dunning_campaign(
    conn: &mut PgConnection,
    customer: &Customer,
) -> Result<Option<(DunningCampaign, Vec<DunningCampaignThreshold>)>, AppError> {
    let campaign = sqlx::query_as::<_, DunningCampaign>(
        r#"
        SELECT id, organization_id, code, name, applied_to_organization, max_attempts,
               days_between_attempts, deleted_at, created_at
        FROM dunning_campaigns
        WHERE organization_id = $1 AND deleted_at IS NULL
          AND (id = $2 OR ($2 IS NULL AND applied_to_organization))
        LIMIT 1
        "#,
    )
    .bind(customer.organization_id)
    .bind(customer.applied_dunning_campaign_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to find dunning campaign", e))?;

    let Some(campaign) = campaign else {
        return Ok(None);
    };

    let thresholds = sqlx::query_as::<_, DunningCampaignThreshold>(
        r#"
        SELECT id, dunning_campaign_id, currency, amount_cents, deleted_at
        FROM dunning_campaign_thresholds
        WHERE dunning_campaign_id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(campaign.id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to list dunning thresholds", e))?;

    Ok(Some((campaign, thresholds)))
}

#[instrument(skip(conn))]
pub async fn overdue_invoices(
    conn: &mut PgConnection,
    customer_id: Uuid,
    currency: &str,
) -> Result<Vec<Invoice>, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices \
         WHERE customer_id = $1 AND currency = $2 AND status = 'finalized' AND payment_overdue \
         ORDER BY issuing_date, id",
        INVOICE_COLUMNS
    ))
    .bind(customer_id)
    .bind(currency)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to list overdue invoices", e))
}

/// Next payment request number. Call while holding the organization's sequence lock.
pub async fn next_payment_request_number(
    conn: &mut PgConnection,
    organization_id: Uuid,
) -> Result<i64, AppError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(number), 0)::BIGINT + 1 FROM payment_requests WHERE organization_id = $1",
    )
    .bind(organization_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to compute payment request number", e))
}

#[instrument(skip(conn, invoice_ids))]
pub async fn insert_payment_request(
    conn: &mut PgConnection,
    customer: &Customer,
    dunning_campaign_id: Uuid,
    number: i64,
    amount_cents: i64,
    currency: &str,
    invoice_ids: &[Uuid],
) -> Result<PaymentRequest, AppError> {
    let request = sqlx::query_as::<_, PaymentRequest>(
        r#"
        INSERT INTO payment_requests (id, organization_id, customer_id, dunning_campaign_id,
                                      number, amount_cents, amount_currency)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, organization_id, customer_id, dunning_campaign_id, number, amount_cents,
                  amount_currency, payment_status, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(customer.organization_id)
    .bind(customer.id)
    .bind(dunning_campaign_id)
    .bind(number)
    .bind(amount_cents)
    .bind(currency)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert payment request", e))?;

    sqlx::query(
        r#"
        INSERT INTO payment_request_invoices (payment_request_id, invoice_id)
        SELECT $1, UNNEST($2::UUID[])
        "#,
    )
    .bind(request.id)
    .bind(invoice_ids)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to link payment request invoices", e))?;

    Ok(request)
}

#[instrument(skip(conn))]
pub async fn record_dunning_attempt(
    conn: &mut PgConnection,
    customer_id: Uuid,
    attempted_at: DateTime<Utc>,
) -> Result<Customer, AppError> {
    sqlx::query_as::<_, Customer>(&format!(
        "UPDATE customers SET last_dunning_campaign_attempt = last_dunning_campaign_attempt + 1, \
         last_dunning_campaign_attempt_at = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
        CUSTOMER_COLUMNS
    ))
    .bind(customer_id)
    .bind(attempted_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to record dunning attempt", e))
}

/// Test and setup helper: set a customer's overdue balance.
#[instrument(skip(conn))]
pub async fn set_overdue_balance(
    conn: &mut PgConnection,
    customer_id: Uuid,
    overdue_balance_cents: i64,
) -> Result<(), AppError> {
    sqlx::query("UPDATE customers SET overdue_balance_cents = $2, updated_at = NOW() WHERE id = $1")
        .bind(customer_id)
        .bind(overdue_balance_cents)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to set overdue balance", e))?;
    Ok(())
}
