//! Usage alert and subscription activity integration tests.

mod common;

use billing_service::models::{AggregationType, AlertType, CreateAlert, CreateAlertThreshold};
use billing_service::services::current_usage::SubscriptionUsage;
use billing_service::services::subscription_activity::{self, ActivityHandler, ACTIVITY_JOB};
use billing_service::services::AlertInputs;
use chrono::{Duration, Utc};
use common::TestBilling;
use ledger_service::models::CreateWallet;
use ledger_service::services::CreditRequest;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

fn one_time(value: Decimal) -> CreateAlertThreshold {
    CreateAlertThreshold {
        value,
        code: None,
        recurring: false,
    }
}

fn usage_of(subscription_id: Uuid, amount_cents: i64) -> SubscriptionUsage {
    SubscriptionUsage {
        subscription_id,
        from_datetime: Utc::now(),
        to_datetime: Utc::now(),
        currency: "USD".to_string(),
        amount_cents,
        charges: vec![],
    }
}

#[tokio::test]
async fn activity_refreshes_lifetime_usage_wallets_and_alerts() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_activity").await;
    let plan = app.monthly_plan("api_plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_activity", Utc::now() - Duration::days(40))
        .await;
    let metric = app
        .metric("api_calls", AggregationType::Count, None, false, &[])
        .await;
    app.standard_charge(&plan, &metric, "1", false, vec![]).await;

    let wallet = app
        .ledger
        .create_wallet(
            &app.ctx,
            CreateWallet {
                customer_id: customer.id,
                name: Some("Prepaid".to_string()),
                currency: "USD".to_string(),
                rate_amount: dec!(1),
                paid_top_up_min_amount_cents: None,
                paid_top_up_max_amount_cents: None,
            },
        )
        .await
        .unwrap();
    app.ledger
        .create_transactions(&app.ctx, CreditRequest::manual(wallet.id, dec!(0), dec!(10)))
        .await
        .unwrap();

    let usage_alert = app
        .catalog
        .create_alert(
            &app.ctx,
            CreateAlert {
                alert_type: AlertType::CurrentUsageAmount,
                code: "usage_200".to_string(),
                name: None,
                subscription_external_id: Some(subscription.external_id.clone()),
                wallet_id: None,
                billable_metric_id: None,
                thresholds: vec![one_time(dec!(200))],
            },
        )
        .await
        .unwrap();
    let wallet_alert = app
        .catalog
        .create_alert(
            &app.ctx,
            CreateAlert {
                alert_type: AlertType::WalletOngoingBalanceAmount,
                code: "wallet_low".to_string(),
                name: None,
                subscription_external_id: None,
                wallet_id: Some(wallet.id),
                billable_metric_id: None,
                thresholds: vec![one_time(dec!(800))],
            },
        )
        .await
        .unwrap();
    assert_eq!(wallet_alert.previous_value, dec!(1000));

    let now = Utc::now();
    for tx in ["tx_1", "tx_2", "tx_3"] {
        app.send_event(&subscription, "api_calls", tx, now, json!({}))
            .await;
    }

    assert_eq!(subscription_activity::enqueue_pending(&app.db, 10).await.unwrap(), 1);
    assert_eq!(subscription_activity::enqueue_pending(&app.db, 10).await.unwrap(), 0);
    let jobs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE name = $1")
        .bind(ACTIVITY_JOB)
        .fetch_one(app.db.pool())
        .await
        .unwrap();
    assert_eq!(jobs, 1);

    let handler = ActivityHandler::new(
        app.db.clone(),
        app.usage.clone(),
        app.ledger.clone(),
        app.alerts.clone(),
    );
    handler
        .process(app.organization_id(), subscription.id)
        .await
        .unwrap();

    let lifetime = app
        .db
        .get_lifetime_usage(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lifetime.current_usage_amount_cents, 300);
    assert_eq!(lifetime.total_amount_cents(), 300);

    let wallet = app.ledger.db().get_wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.balance_cents, 1000);
    assert_eq!(wallet.ongoing_balance_cents, 700);

    let usage_triggers = app.db.triggered_alerts(usage_alert.id).await.unwrap();
    assert_eq!(usage_triggers.len(), 1);
    assert_eq!(usage_triggers[0].current_value, dec!(300));
    let wallet_triggers = app.db.triggered_alerts(wallet_alert.id).await.unwrap();
    assert_eq!(wallet_triggers.len(), 1);
    assert_eq!(wallet_triggers[0].previous_value, dec!(1000));

    assert_eq!(
        app.count(
            "SELECT COUNT(*) FROM subscription_activities WHERE subscription_id = $1",
            subscription.id
        )
        .await,
        0
    );

    app.cleanup().await;
}

#[tokio::test]
async fn usage_alert_fires_once_until_the_period_rolls_over() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_rollover").await;
    let plan = app.monthly_plan("plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_rollover", Utc::now() - Duration::days(40))
        .await;
    let alert = app
        .catalog
        .create_alert(
            &app.ctx,
            CreateAlert {
                alert_type: AlertType::CurrentUsageAmount,
                code: "usage_100".to_string(),
                name: None,
                subscription_external_id: Some(subscription.external_id.clone()),
                wallet_id: None,
                billable_metric_id: None,
                thresholds: vec![one_time(dec!(100))],
            },
        )
        .await
        .unwrap();

    let usage = usage_of(subscription.id, 150);
    let inputs = AlertInputs {
        usage: Some(&usage),
        ..Default::default()
    };
    let period_from = Utc::now() - Duration::days(5);
    let first_at = Utc::now();

    let first = app
        .alerts
        .process(alert.id, &inputs, Some(subscription.id), Some(period_from), first_at)
        .await
        .unwrap();
    assert!(first.triggered.is_some());
    assert_eq!(first.alert.previous_value, dec!(150));

    let repeat = app
        .alerts
        .process(alert.id, &inputs, Some(subscription.id), Some(period_from), first_at)
        .await
        .unwrap();
    assert!(repeat.triggered.is_none());

    let next_period = first_at + Duration::seconds(1);
    let rolled = app
        .alerts
        .process(
            alert.id,
            &inputs,
            Some(subscription.id),
            Some(next_period),
            next_period + Duration::seconds(1),
        )
        .await
        .unwrap();
    let triggered = rolled.triggered.expect("alert should fire again after rollover");
    assert_eq!(triggered.previous_value, Decimal::ZERO);

    assert_eq!(app.db.triggered_alerts(alert.id).await.unwrap().len(), 2);

    app.cleanup().await;
}

#[tokio::test]
async fn reset_clears_previous_value_of_usage_alerts() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_reset").await;
    let plan = app.monthly_plan("plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_reset", Utc::now() - Duration::days(40))
        .await;
    let alert = app
        .catalog
        .create_alert(
            &app.ctx,
            CreateAlert {
                alert_type: AlertType::CurrentUsageAmount,
                code: "usage_recurring".to_string(),
                name: None,
                subscription_external_id: Some(subscription.external_id.clone()),
                wallet_id: None,
                billable_metric_id: None,
                thresholds: vec![CreateAlertThreshold {
                    value: dec!(50),
                    code: Some("every_50".to_string()),
                    recurring: true,
                }],
            },
        )
        .await
        .unwrap();

    let usage = usage_of(subscription.id, 120);
    let inputs = AlertInputs {
        usage: Some(&usage),
        ..Default::default()
    };
    let evaluation = app
        .alerts
        .process(alert.id, &inputs, Some(subscription.id), None, Utc::now())
        .await
        .unwrap();
    let triggered = evaluation.triggered.unwrap();
    assert_eq!(
        triggered.crossed_thresholds.as_array().map(|a| a.len()),
        Some(2)
    );

    let reset = app
        .alerts
        .reset_for_subscription(app.organization_id(), &subscription.external_id)
        .await
        .unwrap();
    assert_eq!(reset, 1);
    let alert = app.db.get_alert(alert.id).await.unwrap().unwrap();
    assert_eq!(alert.previous_value, Decimal::ZERO);

    app.cleanup().await;
}

#[tokio::test]
async fn tracking_is_idempotent_until_processed() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let customer = app.customer("cus_track").await;
    let plan = app.monthly_plan("plan").await;
    let subscription = app
        .subscription(&customer, &plan, "sub_track", Utc::now() - Duration::days(2))
        .await;

    let org = app.organization_id();
    assert!(subscription_activity::track(&app.db, org, subscription.id)
        .await
        .unwrap());
    assert!(!subscription_activity::track(&app.db, org, subscription.id)
        .await
        .unwrap());

    app.cleanup().await;
}
