//! Event ingestion and current usage integration tests.

mod common;

use billing_service::models::{AggregationType, ChargeModel, CreateCharge, Event};
use billing_service::services::{AggregationEngine, CustomAggregator, IngestOutcome};
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{charge_filter, TestBilling};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashSet;
use uuid::Uuid;

#[tokio::test]
async fn filtered_usage_is_priced_per_filter_and_remainder() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_filters").await;
    let plan = app.monthly_plan("storage_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_filters", Utc::now() - Duration::days(40))
        .await;
    let metric = app
        .metric(
            "storage",
            AggregationType::Sum,
            Some("gb"),
            false,
            &[("region", &["eu", "us"])],
        )
        .await;
    let charge = app
        .standard_charge(
            &plan,
            &metric,
            "0.5",
            false,
            vec![charge_filter("1", &[("region", &["eu"])])],
        )
        .await;

    let now = Utc::now();
    app.send_event(&subscription, "storage", "tx_1", now, json!({"gb": 6, "region": "eu"}))
        .await;
    app.send_event(&subscription, "storage", "tx_2", now, json!({"gb": "4", "region": "eu"}))
        .await;
    app.send_event(&subscription, "storage", "tx_3", now, json!({"gb": 4, "region": "us"}))
        .await;

    let usage = app.usage.compute(&subscription, Utc::now()).await.unwrap();

    assert_eq!(usage.currency, "USD");
    assert_eq!(usage.charges.len(), 2);
    let eu = usage
        .charges
        .iter()
        .find(|c| c.charge_filter_id.is_some())
        .unwrap();
    assert_eq!(eu.charge_id, charge.id);
    assert_eq!(eu.units, dec!(10));
    assert_eq!(eu.amount_cents, 1000);
    let remainder = usage
        .charges
        .iter()
        .find(|c| c.charge_filter_id.is_none())
        .unwrap();
    assert_eq!(remainder.units, dec!(4));
    assert_eq!(remainder.amount_cents, 200);
    assert_eq!(usage.amount_cents, 1200);

    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_transaction_is_ignored() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_dup").await;
    let plan = app.monthly_plan("api_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_dup", Utc::now() - Duration::days(3))
        .await;
    app.metric("api_calls", AggregationType::Count, None, false, &[])
        .await;

    let first = app
        .send_event(&subscription, "api_calls", "tx_1", Utc::now(), json!({}))
        .await;
    let second = app
        .send_event(&subscription, "api_calls", "tx_1", Utc::now(), json!({}))
        .await;

    assert!(matches!(first, IngestOutcome::Ingested { .. }));
    assert!(matches!(second, IngestOutcome::Duplicate));
    assert_eq!(
        app.count(
            "SELECT COUNT(*) FROM events WHERE organization_id = $1",
            app.organization_id()
        )
        .await,
        1
    );

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_metric_code_is_rejected() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_unknown").await;
    let plan = app.monthly_plan("plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_unknown", Utc::now() - Duration::days(3))
        .await;

    let err = app
        .ingestor
        .ingest(
            &app.ctx,
            billing_service::models::NewEvent {
                transaction_id: "tx_1".to_string(),
                external_subscription_id: subscription.external_id.clone(),
                code: "missing".to_string(),
                timestamp: None,
                properties: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    app.cleanup().await;
}

#[tokio::test]
async fn pay_in_advance_count_bills_each_event() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_advance").await;
    let plan = app.monthly_plan("seats_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_advance", Utc::now() - Duration::days(3))
        .await;
    let metric = app
        .metric("logins", AggregationType::Count, None, false, &[])
        .await;
    let charge = app.standard_charge(&plan, &metric, "2", true, vec![]).await;

    let mut fees = Vec::new();
    for tx in ["tx_1", "tx_2"] {
        match app
            .send_event(&subscription, "logins", tx, Utc::now(), json!({}))
            .await
        {
            IngestOutcome::Ingested { fees: created, .. } => fees.extend(created),
            IngestOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    assert_eq!(fees.len(), 2);
    assert!(fees.iter().all(|f| f.charge_id == charge.id && f.pay_in_advance));
    assert!(fees.iter().all(|f| f.units == Decimal::ONE && f.amount_cents == 200));
    assert_eq!(
        app.count(
            "SELECT COUNT(*) FROM cached_aggregations WHERE charge_id = $1",
            charge.id
        )
        .await,
        2
    );

    app.cleanup().await;
}

#[tokio::test]
async fn unique_count_ignores_repeated_values() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_unique").await;
    let plan = app.monthly_plan("users_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_unique", Utc::now() - Duration::days(3))
        .await;
    let metric = app
        .metric("active_users", AggregationType::UniqueCount, Some("user_id"), false, &[])
        .await;
    app.standard_charge(&plan, &metric, "3", false, vec![]).await;

    let now = Utc::now();
    for (tx, user) in [("tx_1", "u1"), ("tx_2", "u2"), ("tx_3", "u1")] {
        app.send_event(&subscription, "active_users", tx, now, json!({"user_id": user}))
            .await;
    }

    let usage = app.usage.compute(&subscription, Utc::now()).await.unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(2));
    assert_eq!(usage.amount_cents, 600);

    app.cleanup().await;
}

#[tokio::test]
async fn non_numeric_value_is_rejected_at_ingest() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_bad_value").await;
    let plan = app.monthly_plan("storage_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_bad_value", Utc::now() - Duration::days(3))
        .await;
    let metric = app
        .metric("storage", AggregationType::Sum, Some("gb"), false, &[])
        .await;
    app.standard_charge(&plan, &metric, "1", false, vec![]).await;

    let err = app
        .ingestor
        .ingest(
            &app.ctx,
            billing_service::models::NewEvent {
                transaction_id: "tx_bad".to_string(),
                external_subscription_id: subscription.external_id.clone(),
                code: "storage".to_string(),
                timestamp: Some(Utc::now()),
                properties: json!({"gb": "lots"}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_field_value");
    assert_eq!(
        app.count(
            "SELECT COUNT(*) FROM events WHERE organization_id = $1",
            app.organization_id()
        )
        .await,
        0
    );

    app.send_event(&subscription, "storage", "tx_ok", Utc::now(), json!({"gb": 3}))
        .await;
    let usage = app.usage.compute(&subscription, Utc::now()).await.unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(3));

    app.cleanup().await;
}

#[tokio::test]
async fn unique_count_drops_values_removed_in_the_period() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_unique_remove").await;
    let plan = app.monthly_plan("users_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_unique_remove", at(2024, 1, 1, 0))
        .await;
    let metric = app
        .metric("active_users", AggregationType::UniqueCount, Some("user_id"), false, &[])
        .await;
    app.standard_charge(&plan, &metric, "3", false, vec![]).await;

    let events = [
        ("tx_1", at(2024, 4, 10, 9), json!({"user_id": "u1"})),
        ("tx_2", at(2024, 4, 11, 9), json!({"user_id": "u2"})),
        (
            "tx_3",
            at(2024, 4, 12, 9),
            json!({"user_id": "u1", "operation_type": "remove"}),
        ),
    ];
    for (tx, timestamp, properties) in events {
        app.send_event(&subscription, "active_users", tx, timestamp, properties)
            .await;
    }

    let usage = app
        .usage
        .compute(&subscription, at(2024, 4, 25, 12))
        .await
        .unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(1));
    assert_eq!(usage.amount_cents, 300);

    app.cleanup().await;
}

#[tokio::test]
async fn prorated_sum_carries_earlier_quantities_at_full_weight() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_prorated_sum").await;
    let plan = app.monthly_plan("storage_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_prorated_sum", at(2024, 1, 1, 0))
        .await;
    let metric = app
        .metric("storage", AggregationType::Sum, Some("gb"), true, &[])
        .await;
    prorated_charge(&app, plan.id, metric.id, "2").await;

    app.send_event(&subscription, "storage", "tx_1", at(2024, 1, 10, 9), json!({"gb": 30}))
        .await;
    app.send_event(&subscription, "storage", "tx_2", at(2024, 4, 21, 12), json!({"gb": 15}))
        .await;

    // April has 30 days; 15 GB added on the 21st is present for 10 of them.
    let usage = app
        .usage
        .compute(&subscription, at(2024, 4, 25, 12))
        .await
        .unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(35));
    assert_eq!(usage.amount_cents, 7000);

    app.cleanup().await;
}

#[tokio::test]
async fn prorated_unique_count_weights_values_removed_in_the_period() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_prorated_seats").await;
    let plan = app.monthly_plan("seats_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_prorated_seats", at(2024, 1, 1, 0))
        .await;
    let metric = app
        .metric("seats", AggregationType::UniqueCount, Some("user_id"), true, &[])
        .await;
    prorated_charge(&app, plan.id, metric.id, "10").await;

    let events = [
        ("tx_1", at(2024, 3, 15, 9), json!({"user_id": "u1"})),
        ("tx_2", at(2024, 3, 20, 9), json!({"user_id": "u2"})),
        (
            "tx_3",
            at(2024, 4, 15, 12),
            json!({"user_id": "u1", "operation_type": "remove"}),
        ),
    ];
    for (tx, timestamp, properties) in events {
        app.send_event(&subscription, "seats", tx, timestamp, properties)
            .await;
    }

    // u2 covers all of April, u1 the first 15 of its 30 days.
    let usage = app
        .usage
        .compute(&subscription, at(2024, 4, 25, 12))
        .await
        .unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(1.5));
    assert_eq!(usage.amount_cents, 1500);

    app.cleanup().await;
}

fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

async fn prorated_charge(app: &TestBilling, plan_id: Uuid, metric_id: Uuid, amount: &str) {
    app.catalog
        .create_charge(
            &app.ctx,
            CreateCharge {
                plan_id,
                billable_metric_id: metric_id,
                charge_model: ChargeModel::Standard,
                pay_in_advance: false,
                prorated: true,
                properties: json!({ "amount": amount }),
                filters: vec![],
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn grouped_charge_yields_one_line_per_group() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_grouped").await;
    let plan = app.monthly_plan("compute_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_grouped", Utc::now() - Duration::days(3))
        .await;
    let metric = app
        .metric("cpu_hours", AggregationType::Sum, Some("hours"), false, &[])
        .await;
    app.catalog
        .create_charge(
            &app.ctx,
            CreateCharge {
                plan_id: plan.id,
                billable_metric_id: metric.id,
                charge_model: ChargeModel::Standard,
                pay_in_advance: false,
                prorated: false,
                properties: json!({"amount": "1", "grouped_by": ["cloud"]}),
                filters: vec![],
            },
        )
        .await
        .unwrap();

    let now = Utc::now();
    app.send_event(&subscription, "cpu_hours", "tx_1", now, json!({"hours": 2, "cloud": "aws"}))
        .await;
    app.send_event(&subscription, "cpu_hours", "tx_2", now, json!({"hours": 3, "cloud": "aws"}))
        .await;
    app.send_event(&subscription, "cpu_hours", "tx_3", now, json!({"hours": 5, "cloud": "gcp"}))
        .await;

    let usage = app.usage.compute(&subscription, Utc::now()).await.unwrap();
    let mut lines: Vec<_> = usage
        .charges
        .iter()
        .map(|c| (c.grouped_by.get("cloud").cloned().flatten(), c.units))
        .collect();
    lines.sort();

    assert_eq!(
        lines,
        vec![
            (Some("aws".to_string()), dec!(5)),
            (Some("gcp".to_string()), dec!(5)),
        ]
    );
    assert_eq!(usage.amount_cents, 1000);

    app.cleanup().await;
}

struct DistinctRegions;

impl CustomAggregator for DistinctRegions {
    fn name(&self) -> &'static str {
        "distinct_regions"
    }

    fn aggregate(&self, events: &[Event], _field_name: Option<&str>) -> Result<Decimal, AppError> {
        let regions: HashSet<_> = events.iter().filter_map(|e| e.property("region")).collect();
        Ok(Decimal::from(regions.len()))
    }
}

#[tokio::test]
async fn custom_aggregator_is_resolved_by_name() {
    let engine = AggregationEngine::new().with_aggregator(DistinctRegions);
    let Some(app) = TestBilling::spawn_with_engine(engine).await else {
        return;
    };
    let customer = app.customer("cus_custom").await;
    let plan = app.monthly_plan("regions_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_custom", Utc::now() - Duration::days(3))
        .await;
    let metric = app
        .catalog
        .create_billable_metric(
            &app.ctx,
            billing_service::models::CreateBillableMetric {
                code: "regions".to_string(),
                name: "Regions".to_string(),
                aggregation_type: AggregationType::Custom,
                field_name: None,
                recurring: false,
                custom_aggregator: Some("distinct_regions".to_string()),
                filters: Default::default(),
            },
        )
        .await
        .unwrap();
    app.standard_charge(&plan, &metric, "10", false, vec![]).await;

    let now = Utc::now();
    for (tx, region) in [("tx_1", "eu"), ("tx_2", "us"), ("tx_3", "eu")] {
        app.send_event(&subscription, "regions", tx, now, json!({"region": region}))
            .await;
    }

    let usage = app.usage.compute(&subscription, Utc::now()).await.unwrap();
    assert_eq!(usage.max_units_for_metric(metric.id), dec!(2));
    assert_eq!(usage.amount_cents, 2000);

    app.cleanup().await;
}
