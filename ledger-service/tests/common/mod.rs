//! Test helper module for ledger-service integration tests.
//!
//! Each test gets its own PostgreSQL schema. Tests return early when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use ledger_service::models::{CreateWallet, Wallet};
use ledger_service::services::{Database, LedgerSettings, WalletLedger};
use rust_decimal::Decimal;
use service_core::context::RequestContext;
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
            .with_env_filter("info,ledger_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_ledger_{}_{}", std::process::id(), counter)
}

pub struct TestLedger {
    pub db: Database,
    pub ledger: WalletLedger,
    pub ctx: RequestContext,
    base_url: String,
    schema_name: String,
}

impl TestLedger {
    /// Connect to an isolated schema with all migrations applied.
    pub async fn spawn() -> Option<Self> {
        init_tracing();

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
        let url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let db = Database::new(&url, 5, 1)
            .await
            .expect("Failed to connect to test schema");
        service_core::run_migrations(db.pool())
            .await
            .expect("Failed to run core migrations");
        db.run_migrations()
            .await
            .expect("Failed to run ledger migrations");

        let ledger = WalletLedger::new(
            db.clone(),
            LedgerSettings {
                top_up_debounce: Duration::from_secs(2),
            },
        );

        Some(Self {
            db,
            ledger,
            ctx: RequestContext::api(Uuid::new_v4(), "test"),
            base_url,
            schema_name,
        })
    }

    pub async fn create_wallet(&self, rate_amount: Decimal) -> Wallet {
        self.ledger
            .create_wallet(
                &self.ctx,
                CreateWallet {
                    customer_id: Uuid::new_v4(),
                    name: Some("Prepaid".to_string()),
                    currency: "USD".to_string(),
                    rate_amount,
                    paid_top_up_min_amount_cents: None,
                    paid_top_up_max_amount_cents: None,
                },
            )
            .await
            .expect("Failed to create wallet")
    }

    pub async fn wallet(&self, id: Uuid) -> Wallet {
        self.db
            .get_wallet(id)
            .await
            .expect("Failed to load wallet")
            .expect("Wallet missing")
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
