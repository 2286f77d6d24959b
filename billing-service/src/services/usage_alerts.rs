//! Usage and wallet alerts: value extraction, threshold crossing and triggering.

use super::current_usage::SubscriptionUsage;
use super::database::{self, Database};
use super::metrics::record_alert_triggered;
use crate::models::{
    Alert, AlertThreshold, AlertType, CrossedThreshold, CrossingDirection, LifetimeUsage,
    TriggeredAlert,
};
use chrono::{DateTime, Utc};
use ledger_service::models::Wallet;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::webhooks::{record_webhook, WebhookEvent, WebhookEventType};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const ALL_ALERT_TYPES: [AlertType; 8] = [
    AlertType::CurrentUsageAmount,
    AlertType::BillableMetricCurrentUsageAmount,
    AlertType::BillableMetricCurrentUsageUnits,
    AlertType::LifetimeUsageAmount,
    AlertType::WalletBalanceAmount,
    AlertType::WalletCreditsBalance,
    AlertType::WalletOngoingBalanceAmount,
    AlertType::WalletCreditsOngoingBalance,
];

/// Most recurring series values reported by one evaluation.
const MAX_RECURRING_CROSSINGS: i64 = 1000;

/// Thresholds crossed moving from `previous` to `current`.
///
/// Increasing alerts report one-time thresholds in `(previous, current]`; decreasing
/// alerts report those in `[current, previous)`. A recurring threshold of step `r`
/// adds the series `base + k*r` where `base` is the highest one-time threshold, or
/// the positive multiples of `r` for decreasing alerts. Series values equal to a
/// one-time threshold are reported once, as one-time. At most
/// [`MAX_RECURRING_CROSSINGS`] series values are reported, those nearest `current`.
pub fn find_thresholds_crossed(
    thresholds: &[AlertThreshold],
    previous: Decimal,
    current: Decimal,
    direction: CrossingDirection,
) -> Vec<CrossedThreshold> {
    let one_time: Vec<&AlertThreshold> = thresholds.iter().filter(|t| !t.recurring).collect();
    let recurring = thresholds
        .iter()
        .find(|t| t.recurring && t.value > Decimal::ZERO);

    let in_range = |value: Decimal| match direction {
        CrossingDirection::Increasing => previous < value && value <= current,
        CrossingDirection::Decreasing => current <= value && value < previous,
    };
    let moved = match direction {
        CrossingDirection::Increasing => current > previous,
        CrossingDirection::Decreasing => current < previous,
    };
    if !moved {
        return Vec::new();
    }

    let mut crossed: Vec<CrossedThreshold> = one_time
        .iter()
        .filter(|t| in_range(t.value))
        .map(|t| CrossedThreshold {
            code: t.code.clone(),
            value: t.value,
            recurring: false,
        })
        .collect();

    if let Some(recurring) = recurring {
        let step = recurring.value;
        let is_one_time = |value: Decimal| one_time.iter().any(|t| t.value == value);
        let series_value = |value: Decimal| CrossedThreshold {
            code: recurring.code.clone(),
            value,
            recurring: true,
        };

        let base = match direction {
            CrossingDirection::Increasing => one_time
                .iter()
                .map(|t| t.value)
                .max()
                .unwrap_or(Decimal::ZERO),
            CrossingDirection::Decreasing => Decimal::ZERO,
        };
        let Some((low_k, high_k)) = series_bounds(direction, base, step, previous, current) else {
            warn!(%previous, %current, %step, "Recurring threshold series out of range");
            return sorted(crossed, direction);
        };

        let mut k = low_k;
        while k <= high_k {
            let value = base + k * step;
            if in_range(value) && !is_one_time(value) {
                crossed.push(series_value(value));
            }
            k += Decimal::ONE;
        }
    }

    sorted(crossed, direction)
}

/// Range of `k` such that `base + k * step` lies in the crossed interval, keeping the
/// [`MAX_RECURRING_CROSSINGS`] values nearest `current`. `None` on decimal overflow.
fn series_bounds(
    direction: CrossingDirection,
    base: Decimal,
    step: Decimal,
    previous: Decimal,
    current: Decimal,
) -> Option<(Decimal, Decimal)> {
    let max_crossings = Decimal::from(MAX_RECURRING_CROSSINGS);
    match direction {
        CrossingDirection::Increasing => {
            let low_k = if previous > base {
                previous.checked_sub(base)?.checked_div(step)?.floor() + Decimal::ONE
            } else {
                Decimal::ONE
            };
            let high_k = current.checked_sub(base)?.checked_div(step)?.floor();
            Some((low_k.max(high_k - max_crossings + Decimal::ONE), high_k))
        }
        CrossingDirection::Decreasing => {
            let low_k = current.checked_div(step)?.ceil().max(Decimal::ONE);
            let high_k = previous.checked_div(step)?.ceil() - Decimal::ONE;
            Some((low_k, high_k.min(low_k + max_crossings - Decimal::ONE)))
        }
    }
}

fn sorted(
    mut crossed: Vec<CrossedThreshold>,
    direction: CrossingDirection,
) -> Vec<CrossedThreshold> {
    match direction {
        CrossingDirection::Increasing => crossed.sort_by(|a, b| a.value.cmp(&b.value)),
        CrossingDirection::Decreasing => crossed.sort_by(|a, b| b.value.cmp(&a.value)),
    }
    crossed
}

/// What an alert can be evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertInputs<'a> {
    pub usage: Option<&'a SubscriptionUsage>,
    pub lifetime_usage: Option<&'a LifetimeUsage>,
    pub wallet: Option<&'a Wallet>,
}

/// Extracts the value an alert compares against its thresholds.
pub trait ValueSource: Send + Sync {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError>;
}

fn missing(alert: &Alert, what: &str) -> AppError {
    AppError::InternalError(anyhow::anyhow!(
        "{} alert {} evaluated without {}",
        alert.alert_type,
        alert.id,
        what
    ))
}

fn usage<'a>(alert: &Alert, inputs: &AlertInputs<'a>) -> Result<&'a SubscriptionUsage, AppError> {
    inputs.usage.ok_or_else(|| missing(alert, "current usage"))
}

fn metric_id(alert: &Alert) -> Result<Uuid, AppError> {
    alert.billable_metric_id.ok_or_else(|| {
        AppError::validation(
            "invalid_billable_metric",
            format!("alert {} has no billable metric", alert.code),
        )
    })
}

fn wallet<'a>(alert: &Alert, inputs: &AlertInputs<'a>) -> Result<&'a Wallet, AppError> {
    inputs.wallet.ok_or_else(|| missing(alert, "a wallet"))
}

struct UsageAmount;

impl ValueSource for UsageAmount {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        Ok(Decimal::from(usage(alert, inputs)?.amount_cents))
    }
}

struct MetricUsageAmount;

impl ValueSource for MetricUsageAmount {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        let metric_id = metric_id(alert)?;
        Ok(Decimal::from(usage(alert, inputs)?.max_amount_for_metric(metric_id)))
    }
}

struct MetricUsageUnits;

impl ValueSource for MetricUsageUnits {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        let metric_id = metric_id(alert)?;
        Ok(usage(alert, inputs)?.max_units_for_metric(metric_id))
    }
}

struct LifetimeAmount;

impl ValueSource for LifetimeAmount {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        let lifetime = inputs
            .lifetime_usage
            .ok_or_else(|| missing(alert, "lifetime usage"))?;
        Ok(Decimal::from(lifetime.total_amount_cents()))
    }
}

struct WalletBalance;

impl ValueSource for WalletBalance {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        Ok(Decimal::from(wallet(alert, inputs)?.balance_cents))
    }
}

struct WalletCredits;

impl ValueSource for WalletCredits {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        Ok(wallet(alert, inputs)?.credits_balance)
    }
}

struct WalletOngoingBalance;

impl ValueSource for WalletOngoingBalance {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        Ok(Decimal::from(wallet(alert, inputs)?.ongoing_balance_cents))
    }
}

struct WalletOngoingCredits;

impl ValueSource for WalletOngoingCredits {
    fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        Ok(wallet(alert, inputs)?.credits_ongoing_balance)
    }
}

/// Current value of a wallet alert type for `wallet`. `None` for usage alerts.
pub fn wallet_value(alert_type: AlertType, wallet: &Wallet) -> Option<Decimal> {
    match alert_type {
        AlertType::WalletBalanceAmount => Some(Decimal::from(wallet.balance_cents)),
        AlertType::WalletCreditsBalance => Some(wallet.credits_balance),
        AlertType::WalletOngoingBalanceAmount => Some(Decimal::from(wallet.ongoing_balance_cents)),
        AlertType::WalletCreditsOngoingBalance => Some(wallet.credits_ongoing_balance),
        _ => None,
    }
}

impl AlertType {
    pub fn value_source(&self) -> &'static dyn ValueSource {
        match self {
            AlertType::CurrentUsageAmount => &UsageAmount,
            AlertType::BillableMetricCurrentUsageAmount => &MetricUsageAmount,
            AlertType::BillableMetricCurrentUsageUnits => &MetricUsageUnits,
            AlertType::LifetimeUsageAmount => &LifetimeAmount,
            AlertType::WalletBalanceAmount => &WalletBalance,
            AlertType::WalletCreditsBalance => &WalletCredits,
            AlertType::WalletOngoingBalanceAmount => &WalletOngoingBalance,
            AlertType::WalletCreditsOngoingBalance => &WalletOngoingCredits,
        }
    }

    pub fn find_value(&self, alert: &Alert, inputs: &AlertInputs<'_>) -> Result<Decimal, AppError> {
        self.value_source().find_value(alert, inputs)
    }
}

/// Outcome of one alert evaluation.
#[derive(Debug, Clone)]
pub struct AlertEvaluation {
    pub alert: Alert,
    pub current_value: Decimal,
    pub triggered: Option<TriggeredAlert>,
}

#[derive(Clone)]
pub struct AlertMonitor {
    db: Database,
}

impl AlertMonitor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Evaluate one alert under a row lock.
    ///
    /// Crossing any threshold records a triggered alert, an `alert.triggered` webhook
    /// and the new previous value in one transaction. Otherwise only
    /// `last_processed_at` moves. Usage alerts last processed before `period_from`
    /// start again from zero.
    #[instrument(skip(self, inputs), fields(alert_id = %alert_id))]
    pub async fn process(
        &self,
        alert_id: Uuid,
        inputs: &AlertInputs<'_>,
        subscription_id: Option<Uuid>,
        period_from: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<AlertEvaluation, AppError> {
        let mut tx = self.db.begin().await?;
        let alert = database::lock_alert(&mut tx, alert_id).await?;
        let alert_type = alert.parsed_type().ok_or_else(|| {
            AppError::validation(
                "invalid_alert_type",
                format!("unknown alert type '{}'", alert.alert_type),
            )
        })?;

        let current_value = alert_type.find_value(&alert, inputs)?;
        let rolled_over = alert_type.resets_each_period()
            && matches!(
                (alert.last_processed_at, period_from),
                (Some(processed), Some(from)) if processed < from
            );
        let previous_value = if rolled_over {
            Decimal::ZERO
        } else {
            alert.previous_value
        };

        let thresholds = self.db.alert_thresholds(alert.id).await?;
        let crossed = find_thresholds_crossed(
            &thresholds,
            previous_value,
            current_value,
            alert_type.direction(),
        );

        if crossed.is_empty() {
            let alert = database::update_alert_evaluation(
                &mut tx,
                alert.id,
                rolled_over.then_some(Decimal::ZERO),
                at,
            )
            .await?;
            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit alert evaluation", e))?;
            debug!(current = %current_value, previous = %previous_value, "No threshold crossed");
            return Ok(AlertEvaluation {
                alert,
                current_value,
                triggered: None,
            });
        }

        let snapshot = Alert {
            previous_value,
            ..alert.clone()
        };
        let triggered = database::insert_triggered_alert(
            &mut tx,
            &snapshot,
            subscription_id,
            current_value,
            &crossed,
            at,
        )
        .await?;

        let event = WebhookEvent::new(
            alert.organization_id,
            WebhookEventType::AlertTriggered,
            "triggered_alert",
            triggered.id,
            &triggered,
        )?;
        record_webhook(&mut tx, &event).await?;

        let alert =
            database::update_alert_evaluation(&mut tx, alert.id, Some(current_value), at).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit triggered alert", e))?;

        record_alert_triggered(alert_type.as_str());
        info!(
            alert_type = alert_type.as_str(),
            crossed = crossed.len(),
            current = %current_value,
            previous = %previous_value,
            "Alert triggered"
        );

        Ok(AlertEvaluation {
            alert,
            current_value,
            triggered: Some(triggered),
        })
    }

    /// Evaluate `alerts` in order, stopping at the first failure.
    pub async fn process_all(
        &self,
        alerts: &[Alert],
        inputs: &AlertInputs<'_>,
        subscription_id: Option<Uuid>,
        period_from: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<Vec<AlertEvaluation>, AppError> {
        let mut evaluations = Vec::with_capacity(alerts.len());
        for alert in alerts {
            evaluations.push(
                self.process(alert.id, inputs, subscription_id, period_from, at)
                    .await?,
            );
        }
        Ok(evaluations)
    }

    /// Reset the period-bound alerts of a subscription for a new billing period.
    #[instrument(skip(self))]
    pub async fn reset_for_subscription(
        &self,
        organization_id: Uuid,
        subscription_external_id: &str,
    ) -> Result<u64, AppError> {
        let types: Vec<&str> = ALL_ALERT_TYPES
            .iter()
            .filter(|t| t.resets_each_period())
            .map(|t| t.as_str())
            .collect();

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
        let reset = database::reset_usage_alerts(
            &mut conn,
            organization_id,
            subscription_external_id,
            &types,
        )
        .await?;
        info!(reset = reset, "Usage alerts reset for new period");
        Ok(reset)
    }
}
