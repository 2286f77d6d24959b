//! Billing period boundaries for calendar and anniversary subscriptions.

use crate::models::{BillingTime, PlanInterval, Subscription};
use crate::services::proration::{charges_duration_in_days, in_timezone, ProrationPeriod};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// One billing period, resolved to UTC instants from local dates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillingPeriod {
    /// First instant of the period.
    pub from: DateTime<Utc>,
    /// Last second of the period.
    pub to: DateTime<Utc>,
    /// Usage window: the period clipped to the subscription lifetime.
    pub charges_from: DateTime<Utc>,
    pub charges_to: DateTime<Utc>,
    pub timezone: Tz,
}

impl BillingPeriod {
    /// Period of `subscription` containing `at`.
    pub fn for_subscription(
        subscription: &Subscription,
        interval: PlanInterval,
        timezone: Tz,
        at: DateTime<Utc>,
    ) -> Self {
        let date = in_timezone(at, timezone).date_naive();
        let anchor = match subscription.parsed_billing_time() {
            BillingTime::Calendar => None,
            BillingTime::Anniversary => {
                Some(in_timezone(subscription.subscription_at, timezone).date_naive())
            }
        };
        let start = period_start(date, interval, anchor);
        let next = next_period_start(start, interval, anchor);

        let from = local_start_of_day(start, timezone);
        let to = local_start_of_day(next, timezone) - Duration::seconds(1);

        let charges_from = from.max(subscription.usage_started_at());
        let charges_to = subscription
            .terminated_at
            .map_or(to, |terminated_at| terminated_at.min(to));

        Self {
            from,
            to,
            charges_from,
            charges_to,
            timezone,
        }
    }

    /// Full period length, ignoring any early termination.
    pub fn charges_duration_in_days(&self) -> i64 {
        charges_duration_in_days(self.from, self.to, self.timezone)
    }

    pub fn proration(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> ProrationPeriod {
        ProrationPeriod {
            from,
            to,
            period_from: self.from,
            period_to: self.to,
            timezone: self.timezone,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
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

/// `year-month-day`, with the day clamped to the month length.
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

fn shift_months(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

fn period_start(date: NaiveDate, interval: PlanInterval, anchor: Option<NaiveDate>) -> NaiveDate {
    match (interval, anchor) {
        (PlanInterval::Weekly, None) => {
            date - Duration::days(date.weekday().num_days_from_monday() as i64)
        }
        (PlanInterval::Weekly, Some(anchor)) => {
            let offset = (date.weekday().num_days_from_monday() as i64
                - anchor.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            date - Duration::days(offset)
        }
        (PlanInterval::Monthly, None) => clamped_date(date.year(), date.month(), 1),
        (PlanInterval::Monthly, Some(anchor)) => {
            let candidate = clamped_date(date.year(), date.month(), anchor.day());
            if candidate <= date {
                candidate
            } else {
                let (year, month) = shift_months(date.year(), date.month(), -1);
                clamped_date(year, month, anchor.day())
            }
        }
        (PlanInterval::Yearly, None) => clamped_date(date.year(), 1, 1),
        (PlanInterval::Yearly, Some(anchor)) => {
            let candidate = clamped_date(date.year(), anchor.month(), anchor.day());
            if candidate <= date {
                candidate
            } else {
                clamped_date(date.year() - 1, anchor.month(), anchor.day())
            }
        }
    }
}

fn next_period_start(
    start: NaiveDate,
    interval: PlanInterval,
    anchor: Option<NaiveDate>,
) -> NaiveDate {
    match interval {
        PlanInterval::Weekly => start + Duration::days(7),
        PlanInterval::Monthly => {
            let (year, month) = shift_months(start.year(), start.month(), 1);
            clamped_date(year, month, anchor.map_or(1, |a| a.day()))
        }
        PlanInterval::Yearly => {
            let (month, day) = anchor.map_or((1, 1), |a| (a.month(), a.day()));
            clamped_date(start.year() + 1, month, day)
        }
    }
}

/// Local midnight of `date` as a UTC instant. Midnights skipped by DST move forward an hour.
fn local_start_of_day(date: NaiveDate, timezone: Tz) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    timezone
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subscription(billing_time: BillingTime, subscription_at: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            external_id: "sub_1".to_string(),
            status: "active".to_string(),
            billing_time: billing_time.as_str().to_string(),
            subscription_at,
            started_at: Some(subscription_at),
            terminated_at: None,
            created_at: subscription_at,
            updated_at: subscription_at,
        }
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn calendar_month_covers_the_whole_month() {
        let sub = subscription(BillingTime::Calendar, utc(2024, 2, 4));
        let period = BillingPeriod::for_subscription(
            &sub,
            PlanInterval::Monthly,
            Tz::UTC,
            utc(2024, 2, 20),
        );

        assert_eq!(period.from, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(period.to, Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap());
        assert_eq!(period.charges_from, sub.subscription_at);
        assert_eq!(period.charges_duration_in_days(), 29);
    }

    #[test]
    fn anniversary_month_clamps_to_short_months() {
        let sub = subscription(BillingTime::Anniversary, utc(2024, 1, 31));
        let period = BillingPeriod::for_subscription(
            &sub,
            PlanInterval::Monthly,
            Tz::UTC,
            utc(2024, 3, 10),
        );

        assert_eq!(period.from, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(period.to, Utc.with_ymd_and_hms(2024, 3, 30, 23, 59, 59).unwrap());
    }

    #[test]
    fn weekly_anniversary_starts_on_the_subscription_weekday() {
        // 2024-03-06 is a Wednesday.
        let sub = subscription(BillingTime::Anniversary, utc(2024, 3, 6));
        let period = BillingPeriod::for_subscription(
            &sub,
            PlanInterval::Weekly,
            Tz::UTC,
            utc(2024, 3, 18),
        );
        assert_eq!(period.from.date_naive().weekday(), chrono::Weekday::Wed);
        assert_eq!(period.charges_duration_in_days(), 7);
    }

    #[test]
    fn period_boundaries_are_local_midnights() {
        let sub = subscription(BillingTime::Calendar, utc(2024, 1, 1));
        let paris = chrono_tz::Europe::Paris;
        let period = BillingPeriod::for_subscription(
            &sub,
            PlanInterval::Monthly,
            paris,
            utc(2024, 2, 10),
        );

        assert_eq!(period.from, Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap());
        assert_eq!(period.charges_duration_in_days(), 29);
    }

    #[test]
    fn termination_clips_the_usage_window_only() {
        let mut sub = subscription(BillingTime::Calendar, utc(2024, 1, 1));
        sub.terminated_at = Some(utc(2024, 2, 15));
        let period = BillingPeriod::for_subscription(
            &sub,
            PlanInterval::Monthly,
            Tz::UTC,
            utc(2024, 2, 10),
        );

        assert_eq!(period.charges_to, utc(2024, 2, 15));
        assert_eq!(period.charges_duration_in_days(), 29);
    }
}
