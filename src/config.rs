use config::ConfigError;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub run_address: String,
    /// PostgreSQL connection string; `None` runs on the in-memory ledger
    pub database_uri: Option<String>,
    pub accrual_system_address: String,
    pub poll_interval: Duration,
    pub worker_limit: usize,
    /// Retries per accrual lookup (rate limits and refused connections)
    pub accrual_retry_budget: u32,
    pub db_retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let worker_limit: usize = parse_var(&lookup, "WORKER_LIMIT", 5)?;
        if worker_limit == 0 {
            return Err(ConfigError::Message(
                "WORKER_LIMIT must be greater than zero".to_string(),
            ));
        }

        let defaults = RetryPolicy::default();

        Ok(Self {
            run_address: lookup("RUN_ADDRESS").unwrap_or_else(|| "localhost:8081".to_string()),
            database_uri: lookup("DATABASE_URI").filter(|uri| !uri.trim().is_empty()),
            accrual_system_address: lookup("ACCRUAL_SYSTEM_ADDRESS")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            poll_interval: Duration::from_secs(parse_var(&lookup, "GET_INTERVAL", 5)?),
            worker_limit,
            accrual_retry_budget: parse_var(&lookup, "ACCRUAL_RETRY_BUDGET", 3)?,
            db_retry: RetryPolicy {
                max_attempts: parse_var(&lookup, "DB_RETRY_ATTEMPTS", defaults.max_attempts)?,
                initial_delay: Duration::from_secs(parse_var(
                    &lookup,
                    "DB_RETRY_DELAY_SECS",
                    defaults.initial_delay.as_secs(),
                )?),
                delay_increment: Duration::from_secs(parse_var(
                    &lookup,
                    "DB_RETRY_INCREMENT_SECS",
                    defaults.delay_increment.as_secs(),
                )?),
            },
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Message(format!("{}: invalid value {:?}: {}", key, raw, e))),
    }
}
