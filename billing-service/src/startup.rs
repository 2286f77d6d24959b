//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::services::{
    get_metrics, init_metrics, ActivityHandler, AggregationEngine, AlertMonitor,
    CurrentUsageService, Database, EventIngestor,
};
use crate::worker::{Scheduler, Worker};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use ledger_service::services::{
    Database as LedgerDatabase, LedgerSettings, TopUpHandler, WalletLedger,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::jobs::{JobQueue, PgJobQueue};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Database,
    pub ledger: WalletLedger,
    pub usage: CurrentUsageService,
    pub ingestor: EventIngestor,
    pub alerts: AlertMonitor,
    pub queue: Arc<PgJobQueue>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Database,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "billing-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "billing-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn http_router(db: Database) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(HealthState { db })
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        let ledger_db = LedgerDatabase::from_pool(db.pool().clone());

        if run_migrations {
            service_core::run_migrations(db.pool()).await?;
            ledger_db.run_migrations().await?;
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let ledger = WalletLedger::new(
            ledger_db,
            LedgerSettings {
                top_up_debounce: config.wallets.top_up_debounce,
            },
        );
        let usage = CurrentUsageService::new(db.clone(), AggregationEngine::new());
        let state = AppState {
            ingestor: EventIngestor::new(db.clone(), usage.clone()),
            alerts: AlertMonitor::new(db.clone()),
            queue: Arc::new(PgJobQueue::new(db.pool().clone())),
            config: config.clone(),
            db,
            ledger,
            usage,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Billing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    fn worker(&self) -> Worker {
        let state = &self.state;
        let queue: Arc<dyn JobQueue> = state.queue.clone();
        Worker::new(
            queue,
            state.config.worker.queues.clone(),
            state.config.worker.poll_interval,
        )
        .register(Arc::new(ActivityHandler::new(
            state.db.clone(),
            state.usage.clone(),
            state.ledger.clone(),
            state.alerts.clone(),
        )))
        .register(Arc::new(TopUpHandler::new(state.ledger.clone())))
    }

    fn scheduler(&self) -> Scheduler {
        let state = &self.state;
        Scheduler::new(
            state.db.clone(),
            state.ledger.db().clone(),
            state.queue.clone(),
            state.config.worker.activity_batch_size,
            state.config.worker.scheduler_interval,
        )
    }

    /// Serve HTTP and run the worker and scheduler until `shutdown` resolves.
    pub async fn run_until_stopped(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(self.worker().run(stop_rx.clone()));
        let scheduler = tokio::spawn(self.scheduler().run(stop_rx));

        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            queues = ?self.state.config.worker.queues,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, http_router(self.state.db.clone()))
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = stop_tx.send(true);
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
