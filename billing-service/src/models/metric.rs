//! Billable metrics and charges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Wildcard filter value: the key only has to be present on the event.
pub const ALL_FILTER_VALUES: &str = "__ALL_FILTER_VALUES__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    Sum,
    Max,
    UniqueCount,
    Latest,
    WeightedSum,
    Custom,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Count => "count",
            AggregationType::Sum => "sum",
            AggregationType::Max => "max",
            AggregationType::UniqueCount => "unique_count",
            AggregationType::Latest => "latest",
            AggregationType::WeightedSum => "weighted_sum",
            AggregationType::Custom => "custom",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "count" => Some(AggregationType::Count),
            "sum" => Some(AggregationType::Sum),
            "max" => Some(AggregationType::Max),
            "unique_count" => Some(AggregationType::UniqueCount),
            "latest" => Some(AggregationType::Latest),
            "weighted_sum" => Some(AggregationType::WeightedSum),
            "custom" => Some(AggregationType::Custom),
            _ => None,
        }
    }

    /// Aggregations that cast the event field to a number.
    pub fn reads_numeric_field(&self) -> bool {
        matches!(
            self,
            AggregationType::Sum
                | AggregationType::Max
                | AggregationType::Latest
                | AggregationType::WeightedSum
        )
    }

    /// Only sum and unique count carry a prorated variant.
    pub fn supports_proration(&self) -> bool {
        matches!(self, AggregationType::Sum | AggregationType::UniqueCount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillableMetric {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    pub name: String,
    pub aggregation_type: String,
    /// Event property aggregated by sum, max, latest, unique count and weighted sum.
    pub field_name: Option<String>,
    /// Quantities persist across billing periods.
    pub recurring: bool,
    pub custom_aggregator: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BillableMetric {
    pub fn parsed_aggregation_type(&self) -> Option<AggregationType> {
        AggregationType::from_string(&self.aggregation_type)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillableMetricFilter {
    pub id: Uuid,
    pub billable_metric_id: Uuid,
    pub key: String,
    pub values: Vec<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeModel {
    Standard,
    Package,
    Percentage,
    Graduated,
    Volume,
}

impl ChargeModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeModel::Standard => "standard",
            ChargeModel::Package => "package",
            ChargeModel::Percentage => "percentage",
            ChargeModel::Graduated => "graduated",
            ChargeModel::Volume => "volume",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(ChargeModel::Standard),
            "package" => Some(ChargeModel::Package),
            "percentage" => Some(ChargeModel::Percentage),
            "graduated" => Some(ChargeModel::Graduated),
            "volume" => Some(ChargeModel::Volume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Charge {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub billable_metric_id: Uuid,
    pub charge_model: String,
    pub pay_in_advance: bool,
    pub prorated: bool,
    /// Model-specific pricing configuration.
    pub properties: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Charge {
    pub fn parsed_charge_model(&self) -> Option<ChargeModel> {
        ChargeModel::from_string(&self.charge_model)
    }

    /// Property keys that split usage into groups.
    pub fn grouped_by(&self) -> Vec<String> {
        self.properties
            .get("grouped_by")
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChargeFilter {
    pub id: Uuid,
    pub charge_id: Uuid,
    pub invoice_display_name: Option<String>,
    /// Pricing override applied to usage matching this filter.
    pub properties: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One `{key -> allowed values}` constraint of a charge filter, joined with its metric filter key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChargeFilterValue {
    pub id: Uuid,
    pub charge_filter_id: Uuid,
    pub billable_metric_filter_id: Uuid,
    pub key: String,
    pub values: Vec<String>,
}

/// Input for creating a billable metric.
#[derive(Debug, Clone)]
pub struct CreateBillableMetric {
    pub code: String,
    pub name: String,
    pub aggregation_type: AggregationType,
    pub field_name: Option<String>,
    pub recurring: bool,
    pub custom_aggregator: Option<String>,
    /// Filterable keys and their allowed values.
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Input for one filter of a charge.
#[derive(Debug, Clone)]
pub struct CreateChargeFilter {
    pub invoice_display_name: Option<String>,
    pub properties: serde_json::Value,
    pub values: BTreeMap<String, Vec<String>>,
}

/// Input for creating a charge.
#[derive(Debug, Clone)]
pub struct CreateCharge {
    pub plan_id: Uuid,
    pub billable_metric_id: Uuid,
    pub charge_model: ChargeModel,
    pub pay_in_advance: bool,
    pub prorated: bool,
    pub properties: serde_json::Value,
    pub filters: Vec<CreateChargeFilter>,
}
