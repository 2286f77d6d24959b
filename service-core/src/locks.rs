//! Transaction-scoped Postgres advisory locks.

use crate::error::AppError;
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{debug, instrument};

/// Bounded wait for named sequence locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Block until the named advisory lock is held for the current transaction.
///
/// The lock is released at commit or rollback. When `timeout` elapses first the
/// call fails with [`AppError::LockTimeout`], which the job layer retries.
#[instrument(skip(conn))]
pub async fn acquire_advisory_xact_lock(
    conn: &mut PgConnection,
    name: &str,
    timeout: Duration,
) -> Result<(), AppError> {
    let previous: String = sqlx::query_scalar("SELECT current_setting('lock_timeout')")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to read lock_timeout", e))?;

    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", timeout.as_millis()))
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to set lock_timeout", e))?;

    let result = sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(name)
        .execute(&mut *conn)
        .await;

    if let Err(e) = result {
        return Err(match AppError::from_db("Failed to acquire advisory lock", e) {
            AppError::LockTimeout(_) => AppError::LockTimeout(format!(
                "advisory lock '{}' not acquired within {}ms",
                name,
                timeout.as_millis()
            )),
            other => other,
        });
    }

    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(previous)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::from_db("Failed to restore lock_timeout", e))?;

    debug!(lock = name, "Advisory lock acquired");
    Ok(())
}
