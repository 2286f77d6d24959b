//! Calendar-day proration in the customer's timezone.
//!
//! Day counts are inclusive of both boundary days and computed on local dates, so a
//! window from Feb 4 00:00 to Feb 29 23:59 in `Europe/Paris` is 26 days whatever the
//! UTC offsets are. Monetary results are rounded up to five decimals.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy};

/// Scale used for prorated quantities.
pub const PRORATION_SCALE: u32 = 5;

const SECONDS_PER_DAY: i64 = 86_400;

/// `value` expressed in `zone`.
pub fn in_timezone(value: DateTime<Utc>, zone: Tz) -> DateTime<Tz> {
    zone.from_utc_datetime(&value.naive_utc())
}

/// Parse an IANA zone name, defaulting to UTC.
pub fn parse_timezone(name: Option<&str>) -> Tz {
    name.and_then(|n| n.parse::<Tz>().ok()).unwrap_or(Tz::UTC)
}

/// Whole calendar days from `from` to `to` in `zone`, both days included.
///
/// A window that starts and ends on the same local day lasts one day. Inverted
/// windows last zero days.
pub fn date_diff_with_timezone(from: DateTime<Utc>, to: DateTime<Utc>, zone: Tz) -> i64 {
    if to < from {
        return 0;
    }
    let from_date = in_timezone(from, zone).date_naive();
    let to_date = in_timezone(to, zone).date_naive();
    (to_date - from_date).num_days() + 1
}

/// Length of a whole billing period in days.
pub fn charges_duration_in_days(
    period_from: DateTime<Utc>,
    period_to: DateTime<Utc>,
    zone: Tz,
) -> i64 {
    date_diff_with_timezone(period_from, period_to, zone).max(1)
}

/// Round up to `scale` decimals.
pub fn ceil_decimal(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToPositiveInfinity)
}

/// A usage window inside a billing period.
#[derive(Debug, Clone, Copy)]
pub struct ProrationPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub period_from: DateTime<Utc>,
    pub period_to: DateTime<Utc>,
    pub timezone: Tz,
}

impl ProrationPeriod {
    pub fn duration_in_days(&self) -> i64 {
        charges_duration_in_days(self.period_from, self.period_to, self.timezone)
    }

    /// Fraction of the period covered by the window, within `[0, 1]`.
    pub fn ratio(&self) -> Decimal {
        let from = self.from.max(self.period_from);
        let to = self.to.min(self.period_to);
        let days = date_diff_with_timezone(from, to, self.timezone);
        ratio_of(days, self.duration_in_days())
    }
}

/// Ratio for a quantity carried over from earlier periods.
///
/// The window is measured against the full period duration, even when the
/// subscription ends before the period does.
pub fn persisted_ratio(
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
    full_duration_days: i64,
    zone: Tz,
) -> Decimal {
    ratio_of(
        date_diff_with_timezone(window_from, window_to, zone),
        full_duration_days,
    )
}

/// Share of the period left after an event, in whole days rounded to nearest.
pub fn pay_in_advance_coefficient(
    event_at: DateTime<Utc>,
    period_to: DateTime<Utc>,
    duration_days: i64,
) -> Decimal {
    let seconds = (period_to - event_at).num_seconds().max(0);
    let days = (seconds + SECONDS_PER_DAY / 2) / SECONDS_PER_DAY;
    ratio_of(days, duration_days)
}

fn ratio_of(days: i64, duration_days: i64) -> Decimal {
    if duration_days <= 0 || days <= 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(days) / Decimal::from(duration_days)).min(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn same_day_counts_as_one_day() {
        let at = utc(2024, 2, 10, 8, 0, 0);
        assert_eq!(date_diff_with_timezone(at, at, Tz::UTC), 1);
        assert_eq!(date_diff_with_timezone(at, utc(2024, 2, 10, 23, 0, 0), Tz::UTC), 1);
        assert_eq!(date_diff_with_timezone(at, utc(2024, 2, 9, 0, 0, 0), Tz::UTC), 0);
    }

    #[test]
    fn day_boundaries_follow_the_local_calendar() {
        // 23:30 UTC on Feb 3 is already Feb 4 in Paris.
        let from = utc(2024, 2, 3, 23, 30, 0);
        let to = utc(2024, 2, 29, 22, 59, 59);
        assert_eq!(date_diff_with_timezone(from, to, Tz::UTC), 27);
        assert_eq!(date_diff_with_timezone(from, to, chrono_tz::Europe::Paris), 26);
    }

    #[test]
    fn persisted_quantity_is_prorated_over_the_full_month() {
        let period_from = utc(2024, 2, 1, 0, 0, 0);
        let period_to = utc(2024, 2, 29, 23, 59, 59);
        let duration = charges_duration_in_days(period_from, period_to, Tz::UTC);
        assert_eq!(duration, 29);

        let ratio = persisted_ratio(utc(2024, 2, 4, 0, 0, 0), period_to, duration, Tz::UTC);
        let prorated = ceil_decimal(dec!(10) * ratio, PRORATION_SCALE);
        assert_eq!(prorated, dec!(8.96552));
    }

    #[test]
    fn ratio_is_bounded_and_full_period_is_one() {
        let period_from = utc(2024, 3, 1, 0, 0, 0);
        let period_to = utc(2024, 3, 31, 23, 59, 59);
        let full = ProrationPeriod {
            from: period_from,
            to: period_to,
            period_from,
            period_to,
            timezone: Tz::UTC,
        };
        assert_eq!(full.ratio(), Decimal::ONE);

        let wider = ProrationPeriod {
            from: utc(2024, 2, 1, 0, 0, 0),
            to: utc(2024, 4, 30, 0, 0, 0),
            ..full
        };
        assert_eq!(wider.ratio(), Decimal::ONE);

        for day in 1..=31 {
            let partial = ProrationPeriod {
                from: utc(2024, 3, day, 12, 0, 0),
                ..full
            };
            let ratio = partial.ratio();
            assert!(ratio > Decimal::ZERO && ratio <= Decimal::ONE);
        }
    }

    #[test]
    fn pay_in_advance_coefficient_rounds_days_to_nearest() {
        let period_to = utc(2024, 3, 31, 23, 59, 59);
        // Ten and a half days remain: rounds to 11.
        let event_at = utc(2024, 3, 21, 11, 59, 59);
        assert_eq!(
            pay_in_advance_coefficient(event_at, period_to, 31),
            Decimal::from(11) / Decimal::from(31)
        );
        assert_eq!(
            pay_in_advance_coefficient(period_to, period_to, 31),
            Decimal::ZERO
        );
    }

    #[test]
    fn ceil_never_rounds_down() {
        assert_eq!(ceil_decimal(dec!(1.000001), 5), dec!(1.00001));
        assert_eq!(ceil_decimal(dec!(1.5), 5), dec!(1.5));
        assert_eq!(ceil_decimal(dec!(-1.000009), 5), dec!(-1.00000));
    }
}
