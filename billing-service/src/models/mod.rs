//! Domain models for billing-service.

mod activity;
mod alert;
mod dunning;
mod event;
mod metric;
mod subscription;

pub use activity::{LifetimeUsage, SubscriptionActivity};
pub use alert::{
    Alert, AlertThreshold, AlertType, CreateAlert, CreateAlertThreshold, CrossedThreshold,
    CrossingDirection, TriggeredAlert,
};
pub use dunning::{
    CreateDunningCampaign, DunningCampaign, DunningCampaignThreshold, PaymentRequest,
};
pub(crate) use event::property_as_string;
pub use event::{
    CachedAggregation, CreateInvoice, Event, Fee, Invoice, InvoiceStatus, NewEvent,
    QuantifiedEvent, QuantifiedOperation,
};
pub use metric::{
    AggregationType, BillableMetric, BillableMetricFilter, Charge, ChargeFilter,
    ChargeFilterValue, ChargeModel, CreateBillableMetric, CreateCharge, CreateChargeFilter,
    ALL_FILTER_VALUES,
};
pub use subscription::{
    BillingTime, CreateCustomer, CreatePlan, CreateSubscription, Customer, Organization, Plan,
    PlanInterval, Subscription, SubscriptionStatus,
};
