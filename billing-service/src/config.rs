use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub wallets: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    pub queues: Vec<String>,
    /// Subscription activities enqueued per scheduler tick.
    pub activity_batch_size: i64,
    pub scheduler_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub top_up_debounce: Duration,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = common_config.is_production();

        let config = BillingConfig {
            common: common_config,
            service_name: get_env("SERVICE_NAME", Some("billing-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse(get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?)?,
                min_connections: parse(get_env("DATABASE_MIN_CONNECTIONS", Some("2"), is_prod)?)?,
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(parse(get_env(
                    "WORKER_POLL_INTERVAL_MS",
                    Some("500"),
                    is_prod,
                )?)?),
                queues: get_env("WORKER_QUEUES", Some("billing,wallets"), is_prod)?
                    .split(',')
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect(),
                activity_batch_size: parse(get_env(
                    "WORKER_ACTIVITY_BATCH_SIZE",
                    Some("100"),
                    is_prod,
                )?)?,
                scheduler_interval: Duration::from_secs(parse(get_env(
                    "WORKER_SCHEDULER_INTERVAL_SECONDS",
                    Some("10"),
                    is_prod,
                )?)?),
            },
            wallets: WalletConfig {
                top_up_debounce: Duration::from_secs(parse(get_env(
                    "WALLET_TOP_UP_DEBOUNCE_SECONDS",
                    Some("2"),
                    is_prod,
                )?)?),
            },
        };

        if config.worker.queues.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WORKER_QUEUES must name at least one queue"
            )));
        }

        Ok(config)
    }
}

fn parse<T>(value: String) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("invalid value '{}': {}", value, e))
        })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_used_outside_production() {
        assert_eq!(
            get_env("BILLING_TEST_UNSET_KEY", Some("fallback"), false).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn missing_required_value_is_a_config_error() {
        let err = get_env("BILLING_TEST_UNSET_KEY", None, false).unwrap_err();
        assert_eq!(err.error_code(), "configuration_error");
        let err = get_env("BILLING_TEST_UNSET_KEY", Some("x"), true).unwrap_err();
        assert_eq!(err.error_code(), "configuration_error");
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        assert_eq!(parse::<u32>("12".to_string()).unwrap(), 12);
        assert!(parse::<u32>("twelve".to_string()).is_err());
    }
}
