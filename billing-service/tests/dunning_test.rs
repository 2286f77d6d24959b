//! Dunning integration tests.

mod common;

use billing_service::models::{CreateDunningCampaign, CreateInvoice, Customer, InvoiceStatus};
use billing_service::services::database;
use billing_service::services::DunningProcessor;
use chrono::{Duration, Utc};
use common::TestBilling;

async fn overdue_customer(app: &TestBilling, external_id: &str, amount_cents: i64) -> Customer {
    let customer = app.customer(external_id).await;
    let mut conn = app.db.pool().acquire().await.unwrap();
    database::insert_invoice(
        &mut conn,
        app.organization_id(),
        &CreateInvoice {
            customer_id: customer.id,
            currency: "USD".to_string(),
            status: InvoiceStatus::Finalized,
            total_amount_cents: amount_cents,
            payment_overdue: true,
            issuing_date: (Utc::now() - Duration::days(30)).date_naive(),
        },
    )
    .await
    .unwrap();
    database::set_overdue_balance(&mut conn, customer.id, amount_cents)
        .await
        .unwrap();
    customer
}

async fn default_campaign(app: &TestBilling) {
    app.catalog
        .create_dunning_campaign(
            &app.ctx,
            CreateDunningCampaign {
                code: "default".to_string(),
                name: "Default".to_string(),
                applied_to_organization: true,
                max_attempts: 2,
                days_between_attempts: 3,
                thresholds: vec![("USD".to_string(), 1000)],
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn payment_requests_are_numbered_per_organization() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    default_campaign(&app).await;
    let first = overdue_customer(&app, "cus_first", 1500).await;
    let second = overdue_customer(&app, "cus_second", 2500).await;
    let processor = DunningProcessor::new(app.db.clone());

    let request = processor.process_customer(first.id).await.unwrap().unwrap();
    assert_eq!(request.number, 1);
    assert_eq!(request.amount_cents, 1500);
    assert_eq!(request.amount_currency, "USD");

    let request = processor.process_customer(second.id).await.unwrap().unwrap();
    assert_eq!(request.number, 2);
    assert_eq!(request.amount_cents, 2500);

    app.cleanup().await;
}

#[tokio::test]
async fn attempts_wait_between_requests() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    default_campaign(&app).await;
    let customer = overdue_customer(&app, "cus_spacing", 1500).await;
    let processor = DunningProcessor::new(app.db.clone());

    assert!(processor.process_customer(customer.id).await.unwrap().is_some());
    assert!(processor.process_customer(customer.id).await.unwrap().is_none());

    let requests = app.db.payment_requests_for_customer(customer.id).await.unwrap();
    assert_eq!(requests.len(), 1);
    let customer = app
        .db
        .get_customer(app.organization_id(), customer.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.last_dunning_campaign_attempt, 1);
    assert!(customer.last_dunning_campaign_attempt_at.is_some());

    app.cleanup().await;
}

#[tokio::test]
async fn balances_below_threshold_are_skipped() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    default_campaign(&app).await;
    let customer = overdue_customer(&app, "cus_small", 500).await;
    let processor = DunningProcessor::new(app.db.clone());

    assert!(processor.process_customer(customer.id).await.unwrap().is_none());
    assert_eq!(processor.process_overdue(10).await.unwrap(), 0);

    app.cleanup().await;
}
