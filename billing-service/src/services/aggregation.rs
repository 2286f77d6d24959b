//! Usage aggregation over events and quantified events.
//!
//! A scope names one charge (optionally one of its filters, optionally one group)
//! over one billing period. Queries are built with [`QueryBuilder`] so every
//! property key and filter value travels as a bind parameter.

use crate::models::{
    AggregationType, BillableMetric, CachedAggregation, Charge, Event, Subscription,
};
use crate::services::charge_filters::{FilterValues, MatchingAndIgnored};
use crate::services::database;
use crate::services::metrics::record_aggregation;
use crate::services::periods::BillingPeriod;
use crate::services::proration::{
    ceil_decimal, pay_in_advance_coefficient, persisted_ratio, PRORATION_SCALE,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Values of the `grouped_by` keys of one group. `None` when the event lacks the key.
pub type GroupKey = BTreeMap<String, Option<String>>;

/// One charge, filter and group over one billing period.
#[derive(Debug, Clone)]
pub struct AggregationScope {
    pub subscription: Subscription,
    pub metric: BillableMetric,
    pub aggregation_type: AggregationType,
    pub charge: Charge,
    pub charge_filter_id: Option<Uuid>,
    pub filters: MatchingAndIgnored,
    pub period: BillingPeriod,
    pub group: Option<GroupKey>,
}

impl AggregationScope {
    pub fn new(
        subscription: Subscription,
        metric: BillableMetric,
        charge: Charge,
        period: BillingPeriod,
    ) -> Result<Self, AppError> {
        let aggregation_type = metric.parsed_aggregation_type().ok_or_else(|| {
            AppError::AggregationFailure(anyhow::anyhow!(
                "unknown aggregation type '{}'",
                metric.aggregation_type
            ))
        })?;
        Ok(Self {
            subscription,
            metric,
            aggregation_type,
            charge,
            charge_filter_id: None,
            filters: MatchingAndIgnored::default(),
            period,
            group: None,
        })
    }

    /// Restrict to the events won by a charge filter, or to the unfiltered remainder.
    pub fn with_filter(
        mut self,
        charge_filter_id: Option<Uuid>,
        filters: MatchingAndIgnored,
    ) -> Self {
        self.charge_filter_id = charge_filter_id;
        self.filters = filters;
        self
    }

    pub fn with_group(mut self, group: GroupKey) -> Self {
        self.group = Some(group);
        self
    }

    fn is_prorated(&self) -> bool {
        self.charge.prorated && self.metric.recurring && self.aggregation_type.supports_proration()
    }

    /// Recurring counts and sums carry quantities from the subscription start.
    fn usage_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let carries_over = self.metric.recurring
            && matches!(
                self.aggregation_type,
                AggregationType::Count | AggregationType::Sum
            );
        if carries_over {
            (self.subscription.usage_started_at(), self.period.charges_to)
        } else {
            (self.period.charges_from, self.period.charges_to)
        }
    }

    fn grouped_by_json(&self) -> serde_json::Value {
        match &self.group {
            Some(group) => serde_json::to_value(group).unwrap_or_else(|_| serde_json::json!({})),
            None => serde_json::json!({}),
        }
    }

    fn field_name(&self) -> Result<String, AppError> {
        self.metric.field_name.clone().ok_or_else(|| {
            AppError::AggregationFailure(anyhow::anyhow!(
                "{} metric '{}' has no field_name",
                self.aggregation_type.as_str(),
                self.metric.code
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationOptions {
    /// Real-time usage rather than an invoice run.
    pub current_usage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultOptions {
    /// Units before proration, for prorated charges.
    pub full_units_number: Option<Decimal>,
    pub prorated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationResult {
    pub aggregation: Decimal,
    /// Units already billed in advance this period.
    pub pay_in_advance_aggregation: Decimal,
    pub current_usage_units: Decimal,
    pub count: i64,
    pub grouped_by: GroupKey,
    pub options: ResultOptions,
}

/// Running aggregation after one pay-in-advance event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvanceValues {
    pub current_aggregation: Decimal,
    pub max_aggregation: Decimal,
    pub max_aggregation_with_proration: Option<Decimal>,
    /// Units to bill for the event.
    pub billed: Decimal,
}

/// Next high-water marks given the previous cached values and the event's delta.
///
/// Only growth above the period maximum is billed. With a proration coefficient the
/// billed units are scaled and rounded up to five decimals.
pub fn advance_values(
    previous: Option<&CachedAggregation>,
    delta: Decimal,
    coefficient: Option<Decimal>,
) -> AdvanceValues {
    let previous_current = previous.map_or(Decimal::ZERO, |p| p.current_aggregation);
    let previous_max = previous.map_or(Decimal::ZERO, |p| p.max_aggregation);

    let current_aggregation = previous_current + delta;
    let (max_aggregation, raw_billed) = if current_aggregation > previous_max {
        (current_aggregation, current_aggregation - previous_max)
    } else {
        (previous_max, Decimal::ZERO)
    };

    match coefficient {
        None => AdvanceValues {
            current_aggregation,
            max_aggregation,
            max_aggregation_with_proration: None,
            billed: raw_billed,
        },
        Some(coefficient) => {
            let billed = ceil_decimal(raw_billed * coefficient, PRORATION_SCALE);
            let previous_prorated = previous
                .and_then(|p| p.max_aggregation_with_proration)
                .unwrap_or(Decimal::ZERO);
            AdvanceValues {
                current_aggregation,
                max_aggregation,
                max_aggregation_with_proration: Some(previous_prorated + billed),
                billed,
            }
        }
    }
}

/// Current usage of a prorated charge billed in advance.
///
/// Without an earlier event the raw units stand. Otherwise units added since the last
/// event are added to what was already billed with proration.
pub fn prorated_advance_usage(
    current_units: Decimal,
    previous: Option<&CachedAggregation>,
) -> Decimal {
    match previous {
        None => current_units,
        Some(previous) => {
            current_units - previous.current_aggregation
                + previous
                    .max_aggregation_with_proration
                    .unwrap_or(previous.max_aggregation)
        }
    }
}

/// Time-weighted average of a running total over `[from, to]`.
///
/// `values` are deltas ordered by timestamp. `initial` is the running total at `from`.
pub fn weighted_sum(
    initial: Decimal,
    values: &[(DateTime<Utc>, Decimal)],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Decimal {
    let duration = (to - from).num_seconds();
    if duration <= 0 {
        return Decimal::ZERO;
    }

    let mut running = initial;
    let mut cursor = from;
    let mut area = Decimal::ZERO;
    for (timestamp, delta) in values {
        let at = (*timestamp).clamp(from, to);
        area += running * Decimal::from((at - cursor).num_seconds());
        running += *delta;
        cursor = at;
    }
    area += running * Decimal::from((to - cursor).num_seconds());

    area / Decimal::from(duration)
}

/// A named aggregation strategy for `custom` metrics.
pub trait CustomAggregator: Send + Sync {
    fn name(&self) -> &'static str;

    fn aggregate(&self, events: &[Event], field_name: Option<&str>) -> Result<Decimal, AppError>;
}

/// Aggregates usage for charges. Cheap to clone.
#[derive(Clone, Default)]
pub struct AggregationEngine {
    aggregators: Arc<HashMap<&'static str, Arc<dyn CustomAggregator>>>,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregator(self, aggregator: impl CustomAggregator + 'static) -> Self {
        let mut aggregators: HashMap<_, _> = self.aggregators.as_ref().clone();
        aggregators.insert(aggregator.name(), Arc::new(aggregator) as Arc<dyn CustomAggregator>);
        Self {
            aggregators: Arc::new(aggregators),
        }
    }

    pub fn custom_aggregator(&self, name: &str) -> Result<Arc<dyn CustomAggregator>, AppError> {
        self.aggregators.get(name).cloned().ok_or_else(|| {
            AppError::AggregationFailure(anyhow::anyhow!("unknown custom aggregator '{}'", name))
        })
    }

    /// Aggregate one scope.
    #[instrument(skip(self, conn, scope), fields(
        charge_id = %scope.charge.id,
        aggregation_type = scope.aggregation_type.as_str(),
        charge_filter_id = ?scope.charge_filter_id,
    ))]
    pub async fn aggregate(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
        options: AggregationOptions,
    ) -> Result<AggregationResult, AppError> {
        let started = Instant::now();
        let result = self.aggregate_inner(conn, scope, options).await;
        let status = if result.is_ok() { "success" } else { "failure" };
        record_aggregation(
            scope.aggregation_type.as_str(),
            status,
            started.elapsed().as_secs_f64(),
        );
        if let Err(ref e) = result {
            warn!(code = e.error_code(), error = %e, "Aggregation failed");
        }
        result
    }

    /// One result per distinct combination of the charge's `grouped_by` values.
    #[instrument(skip(self, conn, scope), fields(charge_id = %scope.charge.id))]
    pub async fn aggregate_grouped(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
        options: AggregationOptions,
    ) -> Result<Vec<AggregationResult>, AppError> {
        let keys = scope.charge.grouped_by();
        if keys.is_empty() {
            return Ok(vec![self.aggregate(conn, scope, options).await?]);
        }

        let groups = distinct_groups(conn, scope, &keys).await?;
        debug!(groups = groups.len(), "Aggregating grouped charge");

        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let grouped = scope.clone().with_group(group);
            results.push(self.aggregate(conn, &grouped, options).await?);
        }
        Ok(results)
    }

    /// Record the running aggregation after `event` and return the units to bill now.
    ///
    /// Callers hold the advisory lock returned by [`cached_aggregation_lock`] for the
    /// transaction so concurrent events of one charge are serialized.
    #[instrument(skip(self, conn, scope, event), fields(charge_id = %scope.charge.id, event_id = %event.id))]
    pub async fn aggregate_pay_in_advance(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
        event: &Event,
        delta: Decimal,
    ) -> Result<AdvanceValues, AppError> {
        let previous = database::latest_cached_aggregation(
            conn,
            scope.charge.id,
            scope.charge_filter_id,
            &scope.subscription.external_id,
            &scope.grouped_by_json(),
            scope.period.from,
            event.timestamp,
        )
        .await?;

        let coefficient = scope.is_prorated().then(|| {
            pay_in_advance_coefficient(
                event.timestamp,
                scope.period.to,
                scope.period.charges_duration_in_days(),
            )
        });
        let values = advance_values(previous.as_ref(), delta, coefficient);

        let cached = CachedAggregation {
            id: Uuid::new_v4(),
            organization_id: scope.subscription.organization_id,
            event_id: event.id,
            charge_id: scope.charge.id,
            charge_filter_id: scope.charge_filter_id,
            external_subscription_id: scope.subscription.external_id.clone(),
            grouped_by: scope.grouped_by_json(),
            timestamp: event.timestamp,
            current_aggregation: values.current_aggregation,
            max_aggregation: values.max_aggregation,
            max_aggregation_with_proration: values.max_aggregation_with_proration,
            created_at: Utc::now(),
        };
        database::insert_cached_aggregation(conn, &cached).await?;
        database::update_event_metadata(
            conn,
            event.id,
            &serde_json::json!({
                "current_aggregation": values.current_aggregation,
                "max_aggregation": values.max_aggregation,
                "max_aggregation_with_proration": values.max_aggregation_with_proration,
            }),
        )
        .await?;

        debug!(
            billed = %values.billed,
            current = %values.current_aggregation,
            max = %values.max_aggregation,
            "Pay-in-advance aggregation recorded"
        );
        Ok(values)
    }

    async fn aggregate_inner(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
        options: AggregationOptions,
    ) -> Result<AggregationResult, AppError> {
        let (value, count) = self.base_value(conn, scope).await?;

        let mut result = AggregationResult {
            aggregation: value,
            current_usage_units: value,
            count,
            grouped_by: scope.group.clone().unwrap_or_default(),
            ..Default::default()
        };

        let previous = if scope.charge.pay_in_advance {
            database::latest_cached_aggregation(
                conn,
                scope.charge.id,
                scope.charge_filter_id,
                &scope.subscription.external_id,
                &scope.grouped_by_json(),
                scope.period.from,
                scope.period.to,
            )
            .await?
        } else {
            None
        };

        if scope.is_prorated() {
            let prorated = match scope.aggregation_type {
                AggregationType::Sum => prorated_sum(conn, scope).await?,
                _ => prorated_unique_count(conn, scope).await?,
            };
            result.aggregation = prorated;
            result.options = ResultOptions {
                full_units_number: Some(value),
                prorated: true,
            };

            if options.current_usage {
                result.aggregation = if scope.charge.pay_in_advance {
                    prorated_advance_usage(value, previous.as_ref())
                } else {
                    prorated.max(Decimal::ZERO)
                };
            }
        }

        if let Some(previous) = previous {
            result.pay_in_advance_aggregation = if scope.is_prorated() {
                previous
                    .max_aggregation_with_proration
                    .unwrap_or(previous.max_aggregation)
            } else {
                previous.max_aggregation
            };
        }

        Ok(result)
    }

    /// Non-prorated value and number of events.
    async fn base_value(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
    ) -> Result<(Decimal, i64), AppError> {
        let (from, to) = scope.usage_window();
        match scope.aggregation_type {
            AggregationType::Count => {
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::NUMERIC, COUNT(*)");
                push_event_scope(&mut qb, scope, from, to);
                fetch_pair(conn, qb, "count").await
            }
            AggregationType::Sum => {
                let field = scope.field_name()?;
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
                push_value(&mut qb, "e", &field);
                qb.push("), 0), COUNT(*)");
                push_event_scope(&mut qb, scope, from, to);
                fetch_pair(conn, qb, "sum").await
            }
            AggregationType::Max => {
                let field = scope.field_name()?;
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(MAX(");
                push_value(&mut qb, "e", &field);
                qb.push("), 0), COUNT(*)");
                push_event_scope(&mut qb, scope, from, to);
                fetch_pair(conn, qb, "max").await
            }
            AggregationType::Latest => {
                let field = scope.field_name()?;
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE((SELECT ");
                push_value(&mut qb, "e", &field);
                push_event_scope(&mut qb, scope, from, to);
                qb.push(" ORDER BY e.timestamp DESC, e.created_at DESC LIMIT 1), 0), (SELECT COUNT(*)");
                push_event_scope(&mut qb, scope, from, to);
                qb.push(")");
                let (value, count) = fetch_pair(conn, qb, "latest").await?;
                Ok((value.max(Decimal::ZERO), count))
            }
            AggregationType::UniqueCount if scope.metric.recurring => {
                let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::NUMERIC, COUNT(*)");
                push_quantified_scope(&mut qb, scope);
                qb.push(" AND q.added_at <= ")
                    .push_bind(to)
                    .push(" AND (q.removed_at IS NULL OR q.removed_at >= ")
                    .push_bind(from)
                    .push(")");
                fetch_pair(conn, qb, "unique_count").await
            }
            AggregationType::UniqueCount => {
                // Each value counts when its last operation in the window is an add.
                let field = scope.field_name()?;
                let mut qb = QueryBuilder::<Postgres>::new(
                    "SELECT (COUNT(*) FILTER (WHERE last.operation <> 'remove'))::NUMERIC, \
                     COALESCE(SUM(last.events), 0)::BIGINT \
                     FROM (SELECT DISTINCT ON (v.value) v.operation, \
                     COUNT(*) OVER (PARTITION BY v.value) AS events \
                     FROM (SELECT e.properties ->> ",
                );
                qb.push_bind(field);
                qb.push(
                    " AS value, COALESCE(e.properties ->> 'operation_type', 'add') AS operation, \
                     e.timestamp, e.created_at",
                );
                push_event_scope(&mut qb, scope, from, to);
                qb.push(
                    ") v WHERE v.value IS NOT NULL \
                     ORDER BY v.value, v.timestamp DESC, v.created_at DESC) last",
                );
                fetch_pair(conn, qb, "unique_count").await
            }
            AggregationType::WeightedSum => self.weighted_sum_value(conn, scope).await,
            AggregationType::Custom => self.custom_value(conn, scope).await,
        }
    }

    async fn weighted_sum_value(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
    ) -> Result<(Decimal, i64), AppError> {
        let field = scope.field_name()?;
        let from = scope.period.charges_from;
        let to = scope.period.charges_to;

        let initial = if scope.metric.recurring {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
            push_value(&mut qb, "e", &field);
            qb.push("), 0), COUNT(*)");
            push_event_scope(&mut qb, scope, scope.subscription.usage_started_at(), from);
            qb.push(" AND e.timestamp < ").push_bind(from);
            fetch_pair(conn, qb, "weighted_sum").await?.0
        } else {
            Decimal::ZERO
        };

        let mut qb = QueryBuilder::<Postgres>::new("SELECT e.timestamp, COALESCE(");
        push_value(&mut qb, "e", &field);
        qb.push(", 0)");
        push_event_scope(&mut qb, scope, from, to);
        qb.push(" ORDER BY e.timestamp, e.created_at");

        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| aggregation_error("weighted_sum", e))?;
        let values = rows
            .iter()
            .map(|row| Ok((row.try_get::<DateTime<Utc>, _>(0)?, row.try_get::<Decimal, _>(1)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| aggregation_error("weighted_sum", e))?;

        Ok((weighted_sum(initial, &values, from, to), values.len() as i64))
    }

    async fn custom_value(
        &self,
        conn: &mut PgConnection,
        scope: &AggregationScope,
    ) -> Result<(Decimal, i64), AppError> {
        let name = scope.metric.custom_aggregator.as_deref().ok_or_else(|| {
            AppError::AggregationFailure(anyhow::anyhow!(
                "custom metric '{}' has no aggregator",
                scope.metric.code
            ))
        })?;
        let aggregator = self.custom_aggregator(name)?;

        let (from, to) = scope.usage_window();
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT e.id, e.organization_id, e.transaction_id, e.external_subscription_id, \
             e.code, e.timestamp, e.properties, e.metadata, e.created_at",
        );
        push_event_scope(&mut qb, scope, from, to);
        qb.push(" ORDER BY e.timestamp, e.created_at");

        let events = qb
            .build_query_as::<Event>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| aggregation_error("custom", e))?;

        let value = aggregator.aggregate(&events, scope.metric.field_name.as_deref())?;
        Ok((value, events.len() as i64))
    }
}

/// Lock name serializing pay-in-advance aggregation of one charge and subscription.
pub fn cached_aggregation_lock(charge_id: Uuid, external_subscription_id: &str) -> String {
    format!("cached_aggregation:{}:{}", charge_id, external_subscription_id)
}

/// Persisted quantity prorated over the window plus each in-window event prorated
/// from its own day to the end of the window.
async fn prorated_sum(
    conn: &mut PgConnection,
    scope: &AggregationScope,
) -> Result<Decimal, AppError> {
    let field = scope.field_name()?;
    let period = &scope.period;
    let full_days = period.charges_duration_in_days();
    let zone = period.timezone.name().to_string();

    let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
    push_value(&mut qb, "e", &field);
    qb.push("), 0), COUNT(*)");
    push_event_scope(
        &mut qb,
        scope,
        scope.subscription.usage_started_at(),
        period.charges_from,
    );
    qb.push(" AND e.timestamp < ").push_bind(period.charges_from);
    let (persisted, _) = fetch_pair(conn, qb, "prorated_sum").await?;

    let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
    push_value(&mut qb, "e", &field);
    qb.push(" * (DATE(")
        .push_bind(period.charges_to)
        .push("::TIMESTAMPTZ AT TIME ZONE ")
        .push_bind(zone.clone())
        .push("::TEXT) - DATE(e.timestamp AT TIME ZONE ")
        .push_bind(zone)
        .push("::TEXT) + 1)::NUMERIC / ")
        .push_bind(Decimal::from(full_days))
        .push("), 0), COUNT(*)");
    push_event_scope(&mut qb, scope, period.charges_from, period.charges_to);
    let (in_window, _) = fetch_pair(conn, qb, "prorated_sum").await?;

    let ratio = persisted_ratio(period.charges_from, period.charges_to, full_days, period.timezone);
    Ok(ceil_decimal(persisted * ratio + in_window, PRORATION_SCALE))
}

/// Presence of unique values relative to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    /// Added before the window, still present after it.
    Persisted,
    /// Added inside the window, still present after it.
    Added,
    /// Added before the window, removed inside it.
    Removed,
    /// Added and removed inside the window.
    AddedAndRemoved,
}

impl Presence {
    const ALL: [Presence; 4] = [
        Presence::Persisted,
        Presence::Added,
        Presence::Removed,
        Presence::AddedAndRemoved,
    ];

    fn push_condition(
        self,
        qb: &mut QueryBuilder<'_, Postgres>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) {
        match self {
            Presence::Persisted => {
                qb.push(" AND q.added_at < ").push_bind(from);
                qb.push(" AND (q.removed_at IS NULL OR q.removed_at > ").push_bind(to).push(")");
            }
            Presence::Added => {
                qb.push(" AND q.added_at >= ").push_bind(from);
                qb.push(" AND q.added_at <= ").push_bind(to);
                qb.push(" AND (q.removed_at IS NULL OR q.removed_at > ").push_bind(to).push(")");
            }
            Presence::Removed => {
                qb.push(" AND q.added_at < ").push_bind(from);
                qb.push(" AND q.removed_at >= ").push_bind(from);
                qb.push(" AND q.removed_at <= ").push_bind(to);
            }
            Presence::AddedAndRemoved => {
                qb.push(" AND q.added_at >= ").push_bind(from);
                qb.push(" AND q.removed_at <= ").push_bind(to);
            }
        }
    }

    /// SQL day count of one row, both boundary days included.
    fn push_days(
        self,
        qb: &mut QueryBuilder<'_, Postgres>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        zone: &str,
    ) {
        let (start, end): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = match self {
            Presence::Persisted => (Some(from), Some(to)),
            Presence::Added => (None, Some(to)),
            Presence::Removed => (Some(from), None),
            Presence::AddedAndRemoved => (None, None),
        };
        qb.push("(DATE(");
        match end {
            Some(end) => qb.push_bind(end).push("::TIMESTAMPTZ"),
            None => qb.push("q.removed_at"),
        };
        qb.push(" AT TIME ZONE ").push_bind(zone.to_string()).push("::TEXT) - DATE(");
        match start {
            Some(start) => qb.push_bind(start).push("::TIMESTAMPTZ"),
            None => qb.push("q.added_at"),
        };
        qb.push(" AT TIME ZONE ").push_bind(zone.to_string()).push("::TEXT) + 1)");
    }
}

/// Sum of the four presence slices, each weighted by the days it covers.
async fn prorated_unique_count(
    conn: &mut PgConnection,
    scope: &AggregationScope,
) -> Result<Decimal, AppError> {
    let period = &scope.period;
    let from = period.charges_from;
    let to = period.charges_to;
    let full_days = period.charges_duration_in_days();
    let zone = period.timezone.name();

    let mut total = Decimal::ZERO;
    for presence in Presence::ALL {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COALESCE(SUM(");
        if presence == Presence::Persisted {
            qb.push("1");
        } else {
            presence.push_days(&mut qb, from, to, zone);
        }
        qb.push("), 0)::NUMERIC, COUNT(*)");
        push_quantified_scope(&mut qb, scope);
        presence.push_condition(&mut qb, from, to);
        let (value, _) = fetch_pair(conn, qb, "prorated_unique_count").await?;

        total += if presence == Presence::Persisted {
            value * persisted_ratio(from, to, full_days, period.timezone)
        } else if full_days > 0 {
            value / Decimal::from(full_days)
        } else {
            Decimal::ZERO
        };
    }

    Ok(ceil_decimal(total, PRORATION_SCALE))
}

/// Distinct value combinations of `keys` among the scope's usage.
async fn distinct_groups(
    conn: &mut PgConnection,
    scope: &AggregationScope,
    keys: &[String],
) -> Result<Vec<GroupKey>, AppError> {
    let recurring_unique =
        scope.aggregation_type == AggregationType::UniqueCount && scope.metric.recurring;
    let alias = if recurring_unique { "q" } else { "e" };

    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(alias).push(".properties ->> ").push_bind(key.clone());
    }
    if recurring_unique {
        push_quantified_scope(&mut qb, scope);
        qb.push(" AND q.added_at <= ")
            .push_bind(scope.period.charges_to)
            .push(" AND (q.removed_at IS NULL OR q.removed_at >= ")
            .push_bind(scope.period.charges_from)
            .push(")");
    } else {
        let (from, to) = scope.usage_window();
        push_event_scope(&mut qb, scope, from, to);
    }
    qb.push(" GROUP BY ");
    for i in 0..keys.len() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push((i + 1).to_string());
    }
    qb.push(" ORDER BY ");
    for i in 0..keys.len() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push((i + 1).to_string()).push(" NULLS LAST");
    }

    let rows = qb
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| aggregation_error("grouped", e))?;

    rows.iter()
        .map(|row| {
            keys.iter()
                .enumerate()
                .map(|(i, key)| Ok((key.clone(), row.try_get::<Option<String>, _>(i)?)))
                .collect::<Result<GroupKey, sqlx::Error>>()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| aggregation_error("grouped", e))
}

fn push_event_scope(
    qb: &mut QueryBuilder<'_, Postgres>,
    scope: &AggregationScope,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) {
    qb.push(" FROM events e WHERE e.organization_id = ")
        .push_bind(scope.subscription.organization_id);
    qb.push(" AND e.external_subscription_id = ")
        .push_bind(scope.subscription.external_id.clone());
    qb.push(" AND e.code = ").push_bind(scope.metric.code.clone());
    qb.push(" AND e.timestamp >= ").push_bind(from);
    qb.push(" AND e.timestamp <= ").push_bind(to);
    push_property_filters(qb, "e", &scope.filters, scope.group.as_ref());
}

fn push_quantified_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &AggregationScope) {
    qb.push(" FROM quantified_events q WHERE q.organization_id = ")
        .push_bind(scope.subscription.organization_id);
    qb.push(" AND q.billable_metric_id = ").push_bind(scope.metric.id);
    qb.push(" AND q.external_subscription_id = ")
        .push_bind(scope.subscription.external_id.clone());
    push_property_filters(qb, "q", &scope.filters, scope.group.as_ref());
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, alias: &str, field: &str) {
    qb.push("(")
        .push(alias)
        .push(".properties ->> ")
        .push_bind(field.to_string())
        .push(")::NUMERIC");
}

fn push_property_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    alias: &str,
    filters: &MatchingAndIgnored,
    group: Option<&GroupKey>,
) {
    for (key, values) in &filters.matching {
        qb.push(" AND ");
        push_condition(qb, alias, key, values);
    }

    for ignored in filters.ignored.iter().filter(|i| !i.is_empty()) {
        qb.push(" AND NOT (");
        push_all_conditions(qb, alias, ignored);
        qb.push(")");
    }

    if let Some(group) = group {
        for (key, value) in group {
            qb.push(" AND (")
                .push(alias)
                .push(".properties ->> ")
                .push_bind(key.clone());
            match value {
                Some(value) => qb.push(") = ").push_bind(value.clone()),
                None => qb.push(") IS NULL"),
            };
        }
    }
}

fn push_all_conditions(qb: &mut QueryBuilder<'_, Postgres>, alias: &str, values: &FilterValues) {
    for (i, (key, allowed)) in values.iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        push_condition(qb, alias, key, allowed);
    }
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, alias: &str, key: &str, values: &[String]) {
    qb.push("(")
        .push(alias)
        .push(".properties ->> ")
        .push_bind(key.to_string());
    if values.iter().any(|v| v == crate::models::ALL_FILTER_VALUES) {
        qb.push(") IS NOT NULL");
    } else {
        qb.push(") = ANY(").push_bind(values.to_vec()).push(")");
    }
}

async fn fetch_pair(
    conn: &mut PgConnection,
    mut qb: QueryBuilder<'_, Postgres>,
    context: &str,
) -> Result<(Decimal, i64), AppError> {
    let row = qb
        .build()
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| aggregation_error(context, e))?;
    let value: Decimal = row.try_get(0).map_err(|e| aggregation_error(context, e))?;
    let count: i64 = row.try_get(1).map_err(|e| aggregation_error(context, e))?;
    Ok((value, count))
}

/// Data and syntax errors from a generated query are aggregation failures.
fn aggregation_error(context: &str, err: sqlx::Error) -> AppError {
    let malformed = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("42")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => true,
        _ => false,
    };
    if malformed {
        AppError::AggregationFailure(anyhow::anyhow!("{} aggregation: {}", context, err))
    } else {
        AppError::from_db(context, err)
    }
}
