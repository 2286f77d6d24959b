//! Test helper module for billing-service integration tests.
//!
//! Each test gets its own PostgreSQL schema with the core, ledger and billing
//! migrations applied. Tests return early when `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use billing_service::config::{BillingConfig, DatabaseConfig, WalletConfig, WorkerConfig};
use billing_service::models::{
    AggregationType, BillableMetric, BillingTime, Charge, ChargeModel, CreateBillableMetric,
    CreateCharge, CreateChargeFilter, CreateCustomer, CreatePlan, CreateSubscription, Customer,
    NewEvent, Plan, PlanInterval, Subscription,
};
use billing_service::services::database;
use billing_service::services::{
    init_metrics, AggregationEngine, AlertMonitor, CatalogService, CurrentUsageService,
    Database, EventIngestor, IngestOutcome,
};
use billing_service::startup::Application;
use chrono::{DateTime, Utc};
use ledger_service::services::{Database as LedgerDatabase, LedgerSettings, WalletLedger};
use service_core::config::Config as CoreConfig;
use service_core::context::RequestContext;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,billing_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_billing_{}_{}", std::process::id(), counter)
}

pub struct TestBilling {
    pub db: Database,
    pub ledger: WalletLedger,
    pub catalog: CatalogService,
    pub usage: CurrentUsageService,
    pub ingestor: EventIngestor,
    pub alerts: AlertMonitor,
    pub ctx: RequestContext,
    pub database_url: String,
    base_url: String,
    schema_name: String,
}

impl TestBilling {
    /// Connect to an isolated schema with all migrations applied and one organization.
    pub async fn spawn() -> Option<Self> {
        Self::spawn_with_engine(AggregationEngine::new()).await
    }

    pub async fn spawn_with_engine(engine: AggregationEngine) -> Option<Self> {
        init_tracing();
        init_metrics();

        let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return None;
        };
        let schema_name = unique_schema_name();

        let setup = Database::new(&base_url, 1, 1)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(setup.pool())
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(setup.pool())
            .await
            .expect("Failed to create test schema");
        setup.pool().close().await;

        let separator = if base_url.contains('?') { "&" } else { "?" };
        let database_url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let db = Database::new(&database_url, 5, 1)
            .await
            .expect("Failed to connect to test schema");
        let ledger_db = LedgerDatabase::from_pool(db.pool().clone());
        service_core::run_migrations(db.pool())
            .await
            .expect("Failed to run core migrations");
        ledger_db
            .run_migrations()
            .await
            .expect("Failed to run ledger migrations");
        db.run_migrations()
            .await
            .expect("Failed to run billing migrations");

        let organization_id = Uuid::new_v4();
        let mut conn = db.pool().acquire().await.expect("Failed to acquire connection");
        database::insert_organization(&mut conn, organization_id, "Acme", "UTC")
            .await
            .expect("Failed to create organization");
        drop(conn);

        let ledger = WalletLedger::new(
            ledger_db,
            LedgerSettings {
                top_up_debounce: Duration::from_secs(2),
            },
        );
        let usage = CurrentUsageService::new(db.clone(), engine);

        Some(Self {
            catalog: CatalogService::new(db.clone()),
            ingestor: EventIngestor::new(db.clone(), usage.clone()),
            alerts: AlertMonitor::new(db.clone()),
            db,
            ledger,
            usage,
            ctx: RequestContext::api(organization_id, "test"),
            database_url,
            base_url,
            schema_name,
        })
    }

    pub fn organization_id(&self) -> Uuid {
        self.ctx.organization_id
    }

    /// Configuration pointing at this schema, listening on a random port.
    pub fn config(&self) -> BillingConfig {
        BillingConfig {
            common: CoreConfig {
                port: 0,
                environment: "test".to_string(),
            },
            service_name: "billing-service-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: self.database_url.clone(),
                max_connections: 5,
                min_connections: 1,
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(50),
                queues: vec!["billing".to_string(), "wallets".to_string()],
                activity_batch_size: 100,
                scheduler_interval: Duration::from_millis(200),
            },
            wallets: WalletConfig {
                top_up_debounce: Duration::from_secs(2),
            },
        }
    }

    /// Start the full application against this schema. Returns its base URL.
    pub async fn serve(&self) -> String {
        let app = Application::build_without_migrations(self.config())
            .await
            .expect("Failed to build test application");
        let address = format!("http://127.0.0.1:{}", app.http_port());
        tokio::spawn(app.run_until_stopped(std::future::pending()));

        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client.get(format!("{}/health", address)).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        address
    }

    pub async fn customer(&self, external_id: &str) -> Customer {
        self.catalog
            .create_customer(
                &self.ctx,
                CreateCustomer {
                    external_id: external_id.to_string(),
                    name: None,
                    currency: "USD".to_string(),
                    timezone: None,
                },
            )
            .await
            .expect("Failed to create customer")
    }

    pub async fn monthly_plan(&self, code: &str) -> Plan {
        self.catalog
            .create_plan(
                &self.ctx,
                CreatePlan {
                    code: code.to_string(),
                    name: code.to_string(),
                    interval: PlanInterval::Monthly,
                    amount_cents: 0,
                    amount_currency: "USD".to_string(),
                },
            )
            .await
            .expect("Failed to create plan")
    }

    pub async fn subscription(
        &self,
        customer: &Customer,
        plan: &Plan,
        external_id: &str,
        subscription_at: DateTime<Utc>,
    ) -> Subscription {
        self.catalog
            .create_subscription(
                &self.ctx,
                CreateSubscription {
                    customer_id: customer.id,
                    plan_id: plan.id,
                    external_id: external_id.to_string(),
                    billing_time: BillingTime::Calendar,
                    subscription_at,
                },
            )
            .await
            .expect("Failed to create subscription")
    }

    pub async fn metric(
        &self,
        code: &str,
        aggregation_type: AggregationType,
        field_name: Option<&str>,
        recurring: bool,
        filters: &[(&str, &[&str])],
    ) -> BillableMetric {
        self.catalog
            .create_billable_metric(
                &self.ctx,
                CreateBillableMetric {
                    code: code.to_string(),
                    name: code.to_string(),
                    aggregation_type,
                    field_name: field_name.map(str::to_string),
                    recurring,
                    custom_aggregator: None,
                    filters: string_map(filters),
                },
            )
            .await
            .expect("Failed to create billable metric")
    }

    pub async fn standard_charge(
        &self,
        plan: &Plan,
        metric: &BillableMetric,
        amount: &str,
        pay_in_advance: bool,
        filters: Vec<CreateChargeFilter>,
    ) -> Charge {
        self.catalog
            .create_charge(
                &self.ctx,
                CreateCharge {
                    plan_id: plan.id,
                    billable_metric_id: metric.id,
                    charge_model: ChargeModel::Standard,
                    pay_in_advance,
                    prorated: false,
                    properties: serde_json::json!({ "amount": amount }),
                    filters,
                },
            )
            .await
            .expect("Failed to create charge")
    }

    pub async fn send_event(
        &self,
        subscription: &Subscription,
        code: &str,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        properties: serde_json::Value,
    ) -> IngestOutcome {
        self.ingestor
            .ingest(
                &self.ctx,
                NewEvent {
                    transaction_id: transaction_id.to_string(),
                    external_subscription_id: subscription.external_id.clone(),
                    code: code.to_string(),
                    timestamp: Some(timestamp),
                    properties,
                },
            )
            .await
            .expect("Failed to ingest event")
    }

    pub async fn count(&self, sql: &str, id: Uuid) -> i64 {
        sqlx::query_scalar::<_, i64>(sql)
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to count rows")
    }

    /// Drop the test schema.
    pub async fn cleanup(self) {
        self.db.pool().close().await;
        if let Ok(setup) = Database::new(&self.base_url, 1, 1).await {
            sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema_name))
                .execute(setup.pool())
                .await
                .ok();
        }
    }
}

pub fn string_map(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(key, values)| {
            (
                key.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

pub fn charge_filter(amount: &str, values: &[(&str, &[&str])]) -> CreateChargeFilter {
    CreateChargeFilter {
        invoice_display_name: None,
        properties: serde_json::json!({ "amount": amount }),
        values: string_map(values),
    }
}
