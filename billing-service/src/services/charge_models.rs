//! Charge-model pricing: aggregated units to an amount.
//!
//! Properties hold decimal amounts in major currency units, as strings or numbers.
//! Graduated and volume ranges are contiguous and half-open: `[from_value, to_value)`,
//! the last range having no `to_value`.

use crate::models::ChargeModel;
use ledger_service::models::subunit_to_unit;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use service_core::error::AppError;

/// What a charge model prices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PricingInput {
    pub units: Decimal,
    /// Events aggregated, for per-event fixed fees.
    pub events_count: i64,
}

impl PricingInput {
    pub fn units(units: Decimal) -> Self {
        Self {
            units,
            events_count: 0,
        }
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::validation("invalid_charge_properties", message)
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.trim().parse::<Decimal>().ok(),
        Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    }
}

fn required(properties: &Value, key: &str) -> Result<Decimal, AppError> {
    properties
        .get(key)
        .and_then(decimal)
        .ok_or_else(|| invalid(format!("'{}' must be a decimal", key)))
}

fn optional(properties: &Value, key: &str) -> Result<Decimal, AppError> {
    match properties.get(key) {
        None | Some(Value::Null) => Ok(Decimal::ZERO),
        Some(value) => {
            decimal(value).ok_or_else(|| invalid(format!("'{}' must be a decimal", key)))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Range {
    from_value: Decimal,
    to_value: Option<Decimal>,
    per_unit_amount: Decimal,
    flat_amount: Decimal,
}

fn ranges(properties: &Value, key: &str) -> Result<Vec<Range>, AppError> {
    let raw = properties
        .get(key)
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| invalid(format!("'{}' must be a non-empty list", key)))?;

    let mut parsed = Vec::with_capacity(raw.len());
    for range in raw {
        let to_value = match range.get("to_value") {
            None | Some(Value::Null) => None,
            Some(v) => Some(decimal(v).ok_or_else(|| invalid("'to_value' must be a decimal"))?),
        };
        parsed.push(Range {
            from_value: required(range, "from_value")?,
            to_value,
            per_unit_amount: required(range, "per_unit_amount")?,
            flat_amount: optional(range, "flat_amount")?,
        });
    }

    for pair in parsed.windows(2) {
        if pair[0].to_value != Some(pair[1].from_value) {
            return Err(invalid(format!("'{}' must be contiguous", key)));
        }
    }
    if parsed.last().and_then(|r| r.to_value).is_some() {
        return Err(invalid(format!("last of '{}' must be open-ended", key)));
    }
    Ok(parsed)
}

/// Amount in major units for `input` under `model`.
pub fn apply(
    model: ChargeModel,
    properties: &Value,
    input: PricingInput,
) -> Result<Decimal, AppError> {
    let units = input.units.max(Decimal::ZERO);
    match model {
        ChargeModel::Standard => Ok(required(properties, "amount")? * units),
        ChargeModel::Package => {
            let amount = required(properties, "amount")?;
            let package_size = required(properties, "package_size")?;
            if package_size <= Decimal::ZERO {
                return Err(invalid("'package_size' must be positive"));
            }
            let billable = (units - optional(properties, "free_units")?).max(Decimal::ZERO);
            Ok(amount * (billable / package_size).ceil())
        }
        ChargeModel::Percentage => {
            let rate = required(properties, "rate")?;
            let free_units = optional(properties, "free_units_per_total_aggregation")?;
            let fixed_amount = optional(properties, "fixed_amount")?;
            let free_events = optional(properties, "free_units_per_events")?;

            let billable_units = (units - free_units).max(Decimal::ZERO);
            let billable_events =
                (Decimal::from(input.events_count) - free_events).max(Decimal::ZERO);
            Ok(billable_units * rate / Decimal::ONE_HUNDRED + fixed_amount * billable_events)
        }
        ChargeModel::Graduated => {
            let mut total = Decimal::ZERO;
            for range in ranges(properties, "graduated_ranges")? {
                if units <= range.from_value && range.from_value > Decimal::ZERO {
                    break;
                }
                let upper = range.to_value.map_or(units, |to| units.min(to));
                let in_range = (upper - range.from_value).max(Decimal::ZERO);
                if in_range > Decimal::ZERO {
                    total += range.flat_amount;
                }
                total += in_range * range.per_unit_amount;
            }
            Ok(total)
        }
        ChargeModel::Volume => {
            if units.is_zero() {
                return Ok(Decimal::ZERO);
            }
            let ranges = ranges(properties, "volume_ranges")?;
            let range = ranges
                .iter()
                .find(|r| units >= r.from_value && r.to_value.map_or(true, |to| units < to))
                .or_else(|| ranges.last())
                .ok_or_else(|| invalid("'volume_ranges' must be a non-empty list"))?;
            Ok(units * range.per_unit_amount + range.flat_amount)
        }
    }
}

/// Major units to integer cents of `currency`, rounded half away from zero.
pub fn to_cents(amount: Decimal, currency: &str) -> Result<i64, AppError> {
    let subunit = subunit_to_unit(currency).ok_or_else(|| {
        AppError::validation("invalid_currency", format!("unsupported currency '{}'", currency))
    })?;
    (amount * Decimal::from(subunit))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| invalid("amount out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn standard_multiplies_units() {
        let amount = apply(
            ChargeModel::Standard,
            &json!({"amount": "0.25"}),
            PricingInput::units(dec!(12)),
        )
        .unwrap();
        assert_eq!(amount, dec!(3.00));
    }

    #[test]
    fn package_rounds_packages_up_after_free_units() {
        let props = json!({"amount": 5, "package_size": 10, "free_units": "5"});
        let price = |units: Decimal| {
            apply(ChargeModel::Package, &props, PricingInput::units(units)).unwrap()
        };
        assert_eq!(price(dec!(5)), dec!(0));
        assert_eq!(price(dec!(6)), dec!(5));
        assert_eq!(price(dec!(26)), dec!(15));
    }

    #[test]
    fn percentage_adds_fixed_fee_per_billable_event() {
        let props = json!({"rate": "2.5", "fixed_amount": "0.1", "free_units_per_events": 1});
        let input = PricingInput {
            units: dec!(200),
            events_count: 3,
        };
        assert_eq!(apply(ChargeModel::Percentage, &props, input).unwrap(), dec!(5.2));
    }

    #[test]
    fn graduated_prices_each_tier() {
        let props = json!({"graduated_ranges": [
            {"from_value": 0, "to_value": 10, "per_unit_amount": "1", "flat_amount": "2"},
            {"from_value": 10, "to_value": null, "per_unit_amount": "0.5", "flat_amount": "3"}
        ]});
        let price = |u| apply(ChargeModel::Graduated, &props, PricingInput::units(u)).unwrap();
        assert_eq!(price(dec!(0)), dec!(0));
        assert_eq!(price(dec!(4)), dec!(6));
        assert_eq!(price(dec!(10)), dec!(12));
        assert_eq!(price(dec!(14)), dec!(17));
    }

    #[test]
    fn volume_prices_all_units_at_the_reached_tier() {
        let props = json!({"volume_ranges": [
            {"from_value": 0, "to_value": 100, "per_unit_amount": "2"},
            {"from_value": 100, "to_value": null, "per_unit_amount": "1", "flat_amount": "10"}
        ]});
        let price = |u| apply(ChargeModel::Volume, &props, PricingInput::units(u)).unwrap();
        assert_eq!(price(dec!(50)), dec!(100));
        assert_eq!(price(dec!(150)), dec!(160));
    }

    #[test]
    fn gaps_between_ranges_are_rejected() {
        let props = json!({"volume_ranges": [
            {"from_value": 0, "to_value": 10, "per_unit_amount": "2"},
            {"from_value": 11, "per_unit_amount": "1"}
        ]});
        let err = apply(ChargeModel::Volume, &props, PricingInput::units(dec!(5))).unwrap_err();
        assert_eq!(err.error_code(), "invalid_charge_properties");
    }

    #[test]
    fn cents_follow_the_currency_exponent() {
        assert_eq!(to_cents(dec!(8.965), "USD").unwrap(), 897);
        assert_eq!(to_cents(dec!(120), "JPY").unwrap(), 120);
        assert_eq!(to_cents(dec!(1.0005), "KWD").unwrap(), 1001);
        assert_eq!(to_cents(dec!(1), "XXX").unwrap_err().error_code(), "invalid_currency");
    }
}
