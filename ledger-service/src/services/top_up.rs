//! Recurring top-up rules: threshold scheduling, interval scans and the top-up job.

use super::database::{self, Database};
use super::ledger::{CreditRequest, WalletLedger};
use super::metrics::TOP_UPS_TOTAL;
use crate::models::{
    RecurringTransactionRule, RuleInterval, RuleMethod, RuleTrigger, TransactionSource, Wallet,
};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::context::RequestContext;
use service_core::error::AppError;
use service_core::jobs::{Job, JobHandler, JobQueue, JobSpec, PgJobQueue};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const TOP_UP_QUEUE: &str = "wallets";
pub const TOP_UP_JOB: &str = "wallet_top_up";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpPayload {
    pub wallet_id: Uuid,
    pub rule_id: Uuid,
}

/// Paid credits a rule adds to `wallet`.
///
/// Target rules fill the gap between the ongoing balance and the target, never negative.
pub fn compute_paid_credits(rule: &RecurringTransactionRule, wallet: &Wallet) -> Decimal {
    match rule.parsed_method() {
        RuleMethod::Fixed => rule.paid_credits,
        RuleMethod::Target => {
            let target = rule.target_ongoing_balance.unwrap_or(Decimal::ZERO);
            (target - wallet.credits_ongoing_balance).max(Decimal::ZERO)
        }
    }
}

pub fn compute_granted_credits(rule: &RecurringTransactionRule) -> Decimal {
    match rule.parsed_method() {
        RuleMethod::Fixed => rule.granted_credits,
        RuleMethod::Target => Decimal::ZERO,
    }
}

/// Check paid credits against the wallet's top-up limits.
pub fn validate_paid_credits(
    wallet: &Wallet,
    paid_credits: Decimal,
    ignore_limits: bool,
) -> Result<(), AppError> {
    if ignore_limits {
        return Ok(());
    }
    let amount_cents = wallet.credits_to_cents(paid_credits)?;
    if let Some(min) = wallet.paid_top_up_min_amount_cents {
        if amount_cents < min {
            return Err(AppError::validation(
                "amount_below_minimum",
                format!("top-up of {} cents is below the minimum of {}", amount_cents, min),
            ));
        }
    }
    if let Some(max) = wallet.paid_top_up_max_amount_cents {
        if amount_cents > max {
            return Err(AppError::validation(
                "amount_above_maximum",
                format!("top-up of {} cents is above the maximum of {}", amount_cents, max),
            ));
        }
    }
    Ok(())
}

pub fn threshold_reached(rule: &RecurringTransactionRule, wallet: &Wallet) -> bool {
    rule.threshold_credits
        .map(|threshold| wallet.credits_ongoing_balance <= threshold)
        .unwrap_or(false)
}

/// Schedule a debounced top-up when the wallet's ongoing credits fall to its threshold.
///
/// The unique key embeds the balance so one balance state schedules at most one job.
/// Returns the job id when a job was enqueued.
#[instrument(skip(conn, wallet), fields(wallet_id = %wallet.id))]
pub async fn threshold_top_up(
    conn: &mut PgConnection,
    wallet: &Wallet,
    debounce: Duration,
) -> Result<Option<Uuid>, AppError> {
    if !wallet.is_active() {
        return Ok(None);
    }
    let Some(rule) =
        database::active_rule_for_wallet(conn, wallet.id, RuleTrigger::Threshold).await?
    else {
        return Ok(None);
    };
    if !threshold_reached(&rule, wallet) {
        return Ok(None);
    }
    if database::has_pending_top_up(conn, wallet.id, TransactionSource::Threshold.as_str()).await? {
        debug!("Threshold top-up already awaiting payment");
        return Ok(None);
    }

    let spec = JobSpec::new(
        TOP_UP_QUEUE,
        TOP_UP_JOB,
        &TopUpPayload {
            wallet_id: wallet.id,
            rule_id: rule.id,
        },
    )?
    .unique(format!(
        "threshold_top_up:{}:{}",
        wallet.id,
        wallet.credits_ongoing_balance.normalize()
    ))
    .delay(debounce);

    let job_id = PgJobQueue::enqueue_in(conn, &spec).await?;
    if job_id.is_some() {
        TOP_UPS_TOTAL
            .with_label_values(&[RuleTrigger::Threshold.as_str()])
            .inc();
    }
    Ok(job_id)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// The anchor day, clamped to the length of `date`'s month.
fn billing_day_matches(anchor: NaiveDate, date: NaiveDate) -> bool {
    date.day() == anchor.day().min(days_in_month(date.year(), date.month()))
}

/// Whether an interval rule runs on `date`. The anchor day itself never runs.
pub fn is_due_on(rule: &RecurringTransactionRule, date: NaiveDate) -> bool {
    let anchor = rule.anchor().date_naive();
    if date <= anchor {
        return false;
    }
    match rule.parsed_interval() {
        Some(RuleInterval::Weekly) => date.weekday() == anchor.weekday(),
        Some(RuleInterval::Monthly) => billing_day_matches(anchor, date),
        Some(RuleInterval::Quarterly) => {
            let months = (date.year() - anchor.year()) * 12 + date.month() as i32
                - anchor.month() as i32;
            months % 3 == 0 && billing_day_matches(anchor, date)
        }
        Some(RuleInterval::Yearly) => {
            date.month() == anchor.month() && billing_day_matches(anchor, date)
        }
        None => false,
    }
}

/// Enqueue a top-up for every interval rule due on `date`. Returns the number enqueued.
#[instrument(skip(db, queue))]
pub async fn create_interval_top_ups(
    db: &Database,
    queue: &dyn JobQueue,
    date: NaiveDate,
) -> Result<usize, AppError> {
    let rules = db.active_interval_rules(Utc::now()).await?;
    let mut enqueued = 0;

    for rule in rules.iter().filter(|r| is_due_on(r, date)) {
        let spec = JobSpec::new(
            TOP_UP_QUEUE,
            TOP_UP_JOB,
            &TopUpPayload {
                wallet_id: rule.wallet_id,
                rule_id: rule.id,
            },
        )?
        .unique(format!("interval_top_up:{}:{}", rule.id, date));

        if queue.enqueue(spec).await?.is_some() {
            enqueued += 1;
            TOP_UPS_TOTAL
                .with_label_values(&[RuleTrigger::Interval.as_str()])
                .inc();
        }
    }

    info!(rules = rules.len(), enqueued = enqueued, "Interval top-ups scheduled");
    Ok(enqueued)
}

/// Runs [`TOP_UP_JOB`] jobs.
pub struct TopUpHandler {
    ledger: WalletLedger,
}

impl TopUpHandler {
    pub fn new(ledger: WalletLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl JobHandler for TopUpHandler {
    fn name(&self) -> &'static str {
        TOP_UP_JOB
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> Result<(), AppError> {
        let payload: TopUpPayload = job.payload_as()?;

        let mut conn = self
            .ledger
            .db()
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
        let Some(rule) = database::get_rule(&mut conn, payload.rule_id).await? else {
            info!(rule_id = %payload.rule_id, "Recurring rule gone, skipping top-up");
            return Ok(());
        };
        drop(conn);

        if !rule.is_active_at(Utc::now()) {
            return Ok(());
        }
        let Some(wallet) = self.ledger.db().get_wallet(payload.wallet_id).await? else {
            return Ok(());
        };
        if !wallet.is_active() {
            return Ok(());
        }

        let trigger = rule.parsed_trigger();
        if trigger == Some(RuleTrigger::Threshold) && !threshold_reached(&rule, &wallet) {
            debug!("Ongoing balance recovered before top-up ran");
            return Ok(());
        }

        let paid_credits = compute_paid_credits(&rule, &wallet);
        let granted_credits = compute_granted_credits(&rule);
        if paid_credits.is_zero() && granted_credits.is_zero() {
            return Ok(());
        }

        let source = match trigger {
            Some(RuleTrigger::Threshold) => TransactionSource::Threshold,
            _ => TransactionSource::Interval,
        };
        let request = CreditRequest {
            wallet_id: wallet.id,
            paid_credits,
            granted_credits,
            source,
            priority: None,
            name: rule.transaction_name.clone(),
            metadata: None,
            ignore_paid_top_up_limits: rule.ignore_paid_top_up_limits
                || rule.parsed_method() == RuleMethod::Target,
            reset_consumed_credits: false,
        };

        let ctx = RequestContext::system(wallet.organization_id);
        self.ledger.create_transactions(&ctx, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::wallet::fixtures::wallet;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn rule(method: RuleMethod, interval: Option<RuleInterval>) -> RecurringTransactionRule {
        let created = Utc.with_ymd_and_hms(2024, 1, 31, 10, 0, 0).unwrap();
        RecurringTransactionRule {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            trigger_type: if interval.is_some() { "interval" } else { "threshold" }.to_string(),
            method: method.as_str().to_string(),
            interval_unit: interval.map(|i| i.as_str().to_string()),
            status: "active".to_string(),
            paid_credits: dec!(10),
            granted_credits: dec!(5),
            threshold_credits: Some(dec!(2)),
            target_ongoing_balance: Some(dec!(100)),
            started_at: None,
            expiration_at: None,
            ignore_paid_top_up_limits: false,
            transaction_name: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn target_method_fills_gap_to_target() {
        let mut w = wallet("USD", dec!(1));
        w.credits_ongoing_balance = dec!(35.5);
        let r = rule(RuleMethod::Target, None);
        assert_eq!(compute_paid_credits(&r, &w), dec!(64.5));
        assert_eq!(compute_granted_credits(&r), Decimal::ZERO);

        w.credits_ongoing_balance = dec!(150);
        assert_eq!(compute_paid_credits(&r, &w), Decimal::ZERO);
    }

    #[test]
    fn fixed_method_uses_configured_credits() {
        let w = wallet("USD", dec!(1));
        let r = rule(RuleMethod::Fixed, None);
        assert_eq!(compute_paid_credits(&r, &w), dec!(10));
        assert_eq!(compute_granted_credits(&r), dec!(5));
    }

    #[test]
    fn paid_credits_respect_wallet_limits() {
        let mut w = wallet("USD", dec!(1));
        w.paid_top_up_min_amount_cents = Some(500);
        w.paid_top_up_max_amount_cents = Some(10_000);

        let err = validate_paid_credits(&w, dec!(4), false).unwrap_err();
        assert_eq!(err.error_code(), "amount_below_minimum");
        let err = validate_paid_credits(&w, dec!(101), false).unwrap_err();
        assert_eq!(err.error_code(), "amount_above_maximum");
        assert!(validate_paid_credits(&w, dec!(50), false).is_ok());
        assert!(validate_paid_credits(&w, dec!(101), true).is_ok());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut w = wallet("USD", dec!(1));
        let r = rule(RuleMethod::Fixed, None);
        w.credits_ongoing_balance = dec!(2);
        assert!(threshold_reached(&r, &w));
        w.credits_ongoing_balance = dec!(2.00001);
        assert!(!threshold_reached(&r, &w));
    }

    #[test]
    fn monthly_rule_clamps_to_short_months() {
        let r = rule(RuleMethod::Fixed, Some(RuleInterval::Monthly));
        assert!(!is_due_on(&r, date(2024, 1, 31)));
        assert!(is_due_on(&r, date(2024, 2, 29)));
        assert!(!is_due_on(&r, date(2024, 2, 28)));
        assert!(is_due_on(&r, date(2024, 3, 31)));
        assert!(is_due_on(&r, date(2024, 4, 30)));
    }

    #[test]
    fn weekly_quarterly_and_yearly_schedules() {
        // 2024-01-31 is a Wednesday
        let weekly = rule(RuleMethod::Fixed, Some(RuleInterval::Weekly));
        assert!(is_due_on(&weekly, date(2024, 2, 7)));
        assert!(!is_due_on(&weekly, date(2024, 2, 8)));

        let quarterly = rule(RuleMethod::Fixed, Some(RuleInterval::Quarterly));
        assert!(!is_due_on(&quarterly, date(2024, 2, 29)));
        assert!(is_due_on(&quarterly, date(2024, 4, 30)));
        assert!(is_due_on(&quarterly, date(2024, 7, 31)));

        let yearly = rule(RuleMethod::Fixed, Some(RuleInterval::Yearly));
        assert!(is_due_on(&yearly, date(2025, 1, 31)));
        assert!(!is_due_on(&yearly, date(2025, 2, 28)));
    }
}
