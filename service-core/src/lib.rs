//! service-core: Shared infrastructure for the metering and wallet ledger services.
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod locks;
pub mod observability;
pub mod retry;
pub mod webhooks;

pub use async_trait;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

use sqlx::PgPool;

/// Apply the job queue and webhook outbox migrations.
///
/// Several crates share one database, so previously applied versions owned by
/// other crates are tolerated.
pub async fn run_migrations(pool: &PgPool) -> Result<(), error::AppError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| error::AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))
}
