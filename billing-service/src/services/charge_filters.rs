//! Charge filter matching.
//!
//! A filter is a set of `{key -> allowed values}` constraints on event properties.
//! The most specific matching filter wins an event. When aggregating one filter,
//! events won by a competing filter are excluded so no event is counted twice.

use crate::models::{property_as_string, ChargeFilterValue, ALL_FILTER_VALUES};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type FilterValues = BTreeMap<String, Vec<String>>;

/// A charge filter with its constraints, as used for matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterDefinition {
    pub filter_id: Uuid,
    pub values: FilterValues,
}

impl FilterDefinition {
    /// Group joined filter values (ordered by filter creation) into definitions.
    pub fn from_values(order: &[Uuid], values: &[ChargeFilterValue]) -> Vec<Self> {
        order
            .iter()
            .map(|filter_id| FilterDefinition {
                filter_id: *filter_id,
                values: values
                    .iter()
                    .filter(|v| v.charge_filter_id == *filter_id)
                    .map(|v| (v.key.clone(), v.values.clone()))
                    .collect(),
            })
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.values.len()
    }

    /// Every constraint is satisfied by `properties`.
    pub fn matches(&self, properties: &serde_json::Value) -> bool {
        self.values.iter().all(|(key, allowed)| {
            property_as_string(properties, key).is_some_and(|value| {
                allowed.iter().any(|a| a == ALL_FILTER_VALUES || *a == value)
            })
        })
    }

    /// Some event could satisfy both filters.
    fn overlaps(&self, other: &FilterDefinition) -> bool {
        self.values.iter().all(|(key, values)| match other.values.get(key) {
            Some(other_values) => !intersect(values, other_values).is_empty(),
            None => true,
        })
    }
}

/// Values allowed by both lists. `ALL` is neutral.
fn intersect(left: &[String], right: &[String]) -> Vec<String> {
    let is_all = |values: &[String]| values.iter().any(|v| v == ALL_FILTER_VALUES);
    if is_all(left) {
        return right.to_vec();
    }
    if is_all(right) {
        return left.to_vec();
    }
    left.iter().filter(|v| right.contains(v)).cloned().collect()
}

/// Most specific filter matching `properties`; ties go to the earliest filter.
pub fn match_filter<'a>(
    filters: &'a [FilterDefinition],
    properties: &serde_json::Value,
) -> Option<&'a FilterDefinition> {
    let mut best: Option<&FilterDefinition> = None;
    for filter in filters.iter().filter(|f| f.matches(properties)) {
        if best.map_or(true, |b| filter.key_count() > b.key_count()) {
            best = Some(filter);
        }
    }
    best
}

/// Constraints to aggregate one filter's usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchingAndIgnored {
    pub matching: FilterValues,
    /// Each entry excludes events that satisfy all of its constraints.
    pub ignored: Vec<FilterValues>,
}

/// Constraints of `target` plus the filters that would win events it also matches.
///
/// A competitor wins when it has more keys, or as many keys and comes first. Its
/// values are narrowed to `target`'s on shared keys.
pub fn matching_and_ignored(
    filters: &[FilterDefinition],
    target: &FilterDefinition,
) -> MatchingAndIgnored {
    let target_position = filters.iter().position(|f| f.filter_id == target.filter_id);

    let ignored = filters
        .iter()
        .enumerate()
        .filter(|(_, other)| other.filter_id != target.filter_id)
        .filter(|(position, other)| {
            other.key_count() > target.key_count()
                || (other.key_count() == target.key_count()
                    && target_position.is_some_and(|t| *position < t))
        })
        .filter(|(_, other)| target.overlaps(other))
        .map(|(_, other)| {
            other
                .values
                .iter()
                .map(|(key, values)| {
                    let narrowed = match target.values.get(key) {
                        Some(target_values) => intersect(values, target_values),
                        None => values.clone(),
                    };
                    (key.clone(), narrowed)
                })
                .collect()
        })
        .collect();

    MatchingAndIgnored {
        matching: target.values.clone(),
        ignored,
    }
}

/// Exclusions for usage that matches no filter at all.
pub fn unfiltered_ignored(filters: &[FilterDefinition]) -> MatchingAndIgnored {
    MatchingAndIgnored {
        matching: FilterValues::new(),
        ignored: filters.iter().map(|f| f.values.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(pairs: &[(&str, &[&str])]) -> FilterDefinition {
        FilterDefinition {
            filter_id: Uuid::new_v4(),
            values: pairs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
        }
    }

    #[test]
    fn most_specific_filter_wins() {
        let region = filter(&[("region", &["eu", "us"])]);
        let region_cloud = filter(&[("region", &["eu"]), ("cloud", &["aws"])]);
        let filters = vec![region.clone(), region_cloud.clone()];

        let event = json!({"region": "eu", "cloud": "aws"});
        assert_eq!(match_filter(&filters, &event), Some(&region_cloud));

        let other_cloud = json!({"region": "eu", "cloud": "gcp"});
        assert_eq!(match_filter(&filters, &other_cloud), Some(&region));

        assert_eq!(match_filter(&filters, &json!({"cloud": "aws"})), None);
    }

    #[test]
    fn ties_go_to_the_first_filter() {
        let first = filter(&[("region", &["eu"])]);
        let second = filter(&[("region", &[ALL_FILTER_VALUES])]);
        let filters = vec![first.clone(), second];
        assert_eq!(match_filter(&filters, &json!({"region": "eu"})), Some(&first));
    }

    #[test]
    fn all_sentinel_requires_presence_only() {
        let any_region = filter(&[("region", &[ALL_FILTER_VALUES])]);
        assert!(any_region.matches(&json!({"region": "ap"})));
        assert!(any_region.matches(&json!({"region": 3})));
        assert!(!any_region.matches(&json!({"cloud": "aws"})));
    }

    #[test]
    fn more_specific_overlapping_filters_are_ignored() {
        let parent = filter(&[("region", &["eu", "us"])]);
        let child = filter(&[("region", &["us", "ap"]), ("cloud", &["aws"])]);
        let unrelated = filter(&[("region", &["ap"]), ("cloud", &["gcp"])]);
        let filters = vec![parent.clone(), child, unrelated];

        let result = matching_and_ignored(&filters, &parent);
        assert_eq!(result.matching, parent.values);
        assert_eq!(result.ignored.len(), 1);
        assert_eq!(result.ignored[0]["region"], vec!["us".to_string()]);
        assert_eq!(result.ignored[0]["cloud"], vec!["aws".to_string()]);
    }

    #[test]
    fn equal_specificity_defers_to_earlier_filters() {
        let first = filter(&[("region", &[ALL_FILTER_VALUES])]);
        let second = filter(&[("region", &["eu"])]);
        let filters = vec![first.clone(), second.clone()];

        assert!(matching_and_ignored(&filters, &first).ignored.is_empty());
        let later = matching_and_ignored(&filters, &second);
        assert_eq!(later.ignored, vec![second.values.clone()]);
    }

    #[test]
    fn matching_and_ignored_partition_events() {
        let filters = vec![
            filter(&[("region", &["eu", "us"])]),
            filter(&[("region", &["eu"]), ("cloud", &["aws", "gcp"])]),
            filter(&[("cloud", &[ALL_FILTER_VALUES])]),
        ];
        let events = [
            json!({"region": "eu"}),
            json!({"region": "eu", "cloud": "aws"}),
            json!({"region": "us", "cloud": "aws"}),
            json!({"cloud": "azure"}),
            json!({"region": "ap"}),
        ];

        for event in &events {
            let owners: Vec<Uuid> = filters
                .iter()
                .filter(|f| {
                    let scope = matching_and_ignored(&filters, f);
                    let satisfies = |values: &FilterValues| {
                        FilterDefinition {
                            filter_id: Uuid::nil(),
                            values: values.clone(),
                        }
                        .matches(event)
                    };
                    satisfies(&scope.matching) && !scope.ignored.iter().any(satisfies)
                })
                .map(|f| f.filter_id)
                .collect();
            let expected: Vec<Uuid> = match_filter(&filters, event)
                .map(|f| vec![f.filter_id])
                .unwrap_or_default();
            assert_eq!(owners, expected, "event {}", event);
        }
    }
}
