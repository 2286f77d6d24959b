use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Postgres SQLSTATE for `lock_not_available` (lock_timeout elapsed).
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// Postgres SQLSTATE for `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// Postgres SQLSTATE for `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";
/// Postgres SQLSTATE for `check_violation`.
const CHECK_VIOLATION: &str = "23514";

#[derive(Debug, Error)]
pub enum AppError {
    /// Caller input violates a domain rule. Never retried.
    #[error("Validation error ({code}): {message}")]
    Validation { code: &'static str, message: String },

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    /// A usage aggregation query could not be evaluated.
    #[error("Aggregation failure: {0}")]
    AggregationFailure(anyhow::Error),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Deadlocks and serialization failures reported by the database.
    #[error("Transient failure: {0}")]
    Transient(anyhow::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A storage-level invariant rejected a write. Always a bug.
    #[error("Invariant violation: {0}")]
    InvariantViolation(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Build a validation failure with a stable machine code.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            message: message.into(),
        }
    }

    /// Classify a sqlx error raised while performing `context`.
    pub fn from_db(context: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            match db_err.code().as_deref() {
                Some(LOCK_NOT_AVAILABLE) => {
                    return AppError::LockTimeout(format!("{}: {}", context, db_err));
                }
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    return AppError::Transient(anyhow::anyhow!("{}: {}", context, db_err));
                }
                Some(CHECK_VIOLATION) => {
                    tracing::error!(
                        context = context,
                        constraint = db_err.constraint().unwrap_or("unknown"),
                        error = %db_err,
                        "Storage invariant rejected write"
                    );
                    return AppError::InvariantViolation(anyhow::anyhow!(
                        "{}: {}",
                        context,
                        db_err
                    ));
                }
                _ => {}
            }
        }
        AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, err))
    }

    /// Stable code exposed to callers instead of internal details.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation { code, .. } => code,
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::AggregationFailure(_) => "aggregation_failure",
            AppError::LockTimeout(_) => "lock_timeout",
            AppError::Transient(_) => "transient_failure",
            AppError::Deserialization(_) => "deserialization_error",
            AppError::InvariantViolation(_) => "invariant_violation",
            AppError::InternalError(_) => "internal_error",
            AppError::ServiceUnavailable => "service_unavailable",
            AppError::DatabaseError(_) => "database_error",
            AppError::ConfigError(_) => "configuration_error",
        }
    }

    /// Whether the job layer should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::LockTimeout(_)
                | AppError::Transient(_)
                | AppError::Deserialization(_)
                | AppError::ServiceUnavailable
                | AppError::DatabaseError(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
        }

        let code = self.error_code();
        let (status, error_message) = match &self {
            AppError::Validation { message, .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string()),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string()),
            AppError::AggregationFailure(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Usage aggregation failed".to_string(),
            ),
            AppError::LockTimeout(_) | AppError::Transient(_) | AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            ),
            AppError::Deserialization(_) => {
                (StatusCode::BAD_REQUEST, "Malformed payload".to_string())
            }
            AppError::InvariantViolation(_)
            | AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                code,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_carries_stable_code() {
        let err = AppError::validation("exceeds_available_amount", "not enough credits");
        assert_eq!(err.error_code(), "exceeds_available_amount");
        assert!(!err.is_retryable());
    }

    #[test]
    fn lock_timeout_is_retryable() {
        assert!(AppError::LockTimeout("payment_requests".into()).is_retryable());
        assert!(!AppError::AggregationFailure(anyhow::anyhow!("bad cast")).is_retryable());
        assert!(!AppError::NotFound(anyhow::anyhow!("wallet")).is_retryable());
    }

    #[test]
    fn non_database_sqlx_errors_map_to_database_error() {
        let err = AppError::from_db("load wallet", sqlx::Error::RowNotFound);
        assert_eq!(err.error_code(), "database_error");
    }
}
