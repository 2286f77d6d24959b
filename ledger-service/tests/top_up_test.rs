//! Recurring top-up integration tests.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::TestLedger;
use ledger_service::models::{
    CreateRecurringRule, OngoingUsage, RuleInterval, RuleMethod, RuleTrigger,
};
use ledger_service::services::top_up::create_interval_top_ups;
use ledger_service::services::{CreditRequest, TopUpHandler, TOP_UP_QUEUE};
use rust_decimal_macros::dec;
use service_core::jobs::{JobHandler, JobQueue, PgJobQueue};

fn threshold_rule(wallet_id: uuid::Uuid) -> CreateRecurringRule {
    CreateRecurringRule {
        wallet_id,
        trigger: RuleTrigger::Threshold,
        method: RuleMethod::Fixed,
        interval: None,
        paid_credits: dec!(0),
        granted_credits: dec!(20),
        threshold_credits: Some(dec!(5)),
        target_ongoing_balance: None,
        started_at: None,
        expiration_at: None,
        ignore_paid_top_up_limits: false,
        transaction_name: Some("Auto top-up".to_string()),
    }
}

#[tokio::test]
async fn crossing_threshold_schedules_one_debounced_top_up() {
    let Some(app) = TestLedger::spawn().await else {
        return;
    };
    let wallet = app.create_wallet(dec!(1)).await;
    app.ledger
        .create_transactions(&app.ctx, CreditRequest::manual(wallet.id, dec!(0), dec!(10)))
        .await
        .unwrap();
    app.ledger
        .create_recurring_rule(&app.ctx, threshold_rule(wallet.id))
        .await
        .unwrap();

    let usage = OngoingUsage {
        current_usage_cents: 600,
        draft_invoices_cents: 0,
        billed_usage_cents: 0,
    };
    for _ in 0..3 {
        app.ledger
            .refresh_ongoing_balance(&app.ctx, wallet.id, usage)
            .await
            .unwrap();
    }

    let jobs = app
        .count(
            "SELECT COUNT(*) FROM jobs WHERE payload->>'wallet_id' = $1::text",
            wallet.id,
        )
        .await;
    assert_eq!(jobs, 1);

    let run_at: chrono::DateTime<Utc> =
        sqlx::query_scalar("SELECT run_at FROM jobs WHERE payload->>'wallet_id' = $1::text")
            .bind(wallet.id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert!(run_at > Utc::now());

    app.cleanup().await;
}

#[tokio::test]
async fn top_up_job_grants_configured_credits() {
    let Some(app) = TestLedger::spawn().await else {
        return;
    };
    let wallet = app.create_wallet(dec!(1)).await;
    app.ledger
        .create_recurring_rule(&app.ctx, threshold_rule(wallet.id))
        .await
        .unwrap();
    // An empty wallet starts at or below any positive threshold.
    app.ledger
        .refresh_ongoing_balance(&app.ctx, wallet.id, OngoingUsage::default())
        .await
        .unwrap();

    sqlx::query("UPDATE jobs SET run_at = NOW() - INTERVAL '1 second'")
        .execute(app.db.pool())
        .await
        .unwrap();

    let queue = PgJobQueue::new(app.db.pool().clone());
    let job = queue
        .claim_next(&[TOP_UP_QUEUE.to_string()])
        .await
        .unwrap()
        .expect("top-up job should be claimable");

    TopUpHandler::new(app.ledger.clone()).handle(&job).await.unwrap();
    queue.complete(&job).await.unwrap();

    let refreshed = app.wallet(wallet.id).await;
    assert_eq!(refreshed.credits_balance, dec!(20));
    assert_eq!(refreshed.balance_cents, 2000);

    app.cleanup().await;
}

#[tokio::test]
async fn interval_scan_enqueues_due_rules_once_per_day() {
    let Some(app) = TestLedger::spawn().await else {
        return;
    };
    let wallet = app.create_wallet(dec!(1)).await;
    let started_at = Utc::now() - ChronoDuration::days(7);
    app.ledger
        .create_recurring_rule(
            &app.ctx,
            CreateRecurringRule {
                wallet_id: wallet.id,
                trigger: RuleTrigger::Interval,
                method: RuleMethod::Fixed,
                interval: Some(RuleInterval::Weekly),
                paid_credits: dec!(0),
                granted_credits: dec!(5),
                threshold_credits: None,
                target_ongoing_balance: None,
                started_at: Some(started_at),
                expiration_at: None,
                ignore_paid_top_up_limits: false,
                transaction_name: None,
            },
        )
        .await
        .unwrap();

    let queue = PgJobQueue::new(app.db.pool().clone());
    let today = Utc::now().date_naive();
    assert_eq!(create_interval_top_ups(&app.db, &queue, today).await.unwrap(), 1);
    assert_eq!(create_interval_top_ups(&app.db, &queue, today).await.unwrap(), 0);

    let tomorrow = today + ChronoDuration::days(1);
    assert_eq!(create_interval_top_ups(&app.db, &queue, tomorrow).await.unwrap(), 0);

    app.cleanup().await;
}
