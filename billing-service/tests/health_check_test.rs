//! Health check integration tests for billing-service.

mod common;

use common::TestBilling;
use reqwest::Client;

#[tokio::test]
async fn health_check_works() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let address = app.serve().await;

    let response = Client::new()
        .get(format!("{}/health", address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "billing-service");

    app.cleanup().await;
}

#[tokio::test]
async fn readiness_check_works() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let address = app.serve().await;

    let response = Client::new()
        .get(format!("{}/ready", address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    app.cleanup().await;
}

#[tokio::test]
async fn metrics_endpoint_works() {
    let Some(app) = TestBilling::spawn().await else {
        return;
    };
    let address = app.serve().await;

    let response = Client::new()
        .get(format!("{}/metrics", address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or("").contains("text/plain"))
        .unwrap_or(false));
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("billing_db_query_duration_seconds"));

    app.cleanup().await;
}
