//! Services module for billing-service.

pub mod aggregation;
pub mod catalog;
pub mod charge_filters;
pub mod charge_models;
pub mod current_usage;
pub mod database;
pub mod dunning;
pub mod events;
pub mod metrics;
pub mod periods;
pub mod proration;
pub mod subscription_activity;
pub mod usage_alerts;

pub use aggregation::{
    AggregationEngine, AggregationOptions, AggregationResult, AggregationScope, CustomAggregator,
};
pub use catalog::CatalogService;
pub use current_usage::{ChargeUsage, CurrentUsageService, SubscriptionUsage};
pub use database::Database;
pub use dunning::{DunningDecision, DunningProcessor};
pub use events::{EventIngestor, IngestOutcome};
pub use metrics::{
    get_metrics, init_metrics, record_aggregation, record_alert_triggered, record_dunning_attempt,
    record_error, record_event_ingested, record_job,
};
pub use subscription_activity::{ActivityHandler, ACTIVITY_JOB, ACTIVITY_QUEUE};
pub use usage_alerts::{AlertInputs, AlertMonitor};
