//! Environment-backed sync configuration.

use std::{env, error::Error, fmt};

use sync_core::RetryPolicy;
use sync_worker::{SchedulerConfig, WorkerConfig};

/// Runtime tuning for sync workers and request scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncClientConfig {
    pub worker: WorkerConfig,
}

impl SyncClientConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = WorkerConfig::default();

        let sync_timeout_ms = parse_u64_with_default(
            "PIKACHAT_SYNC_TIMEOUT_MS",
            defaults.sync_timeout_ms,
            &mut lookup,
        )?;
        let retry_base_ms = parse_u64_with_default(
            "PIKACHAT_SYNC_RETRY_BASE_MS",
            defaults.retry.base_delay_ms(),
            &mut lookup,
        )?;
        let retry_max_ms = parse_u64_with_default(
            "PIKACHAT_SYNC_RETRY_MAX_MS",
            defaults.retry.max_delay_ms(),
            &mut lookup,
        )?;
        let max_attempts = parse_u32_with_default(
            "PIKACHAT_REQUEST_MAX_ATTEMPTS",
            defaults.scheduler.max_attempts,
            &mut lookup,
        )?;
        let max_concurrent_requests = parse_usize_with_default(
            "PIKACHAT_REQUEST_CONCURRENCY",
            defaults.scheduler.max_concurrent_requests,
            &mut lookup,
        )?;
        let inbox_capacity = parse_usize_with_default(
            "PIKACHAT_WORKER_INBOX_CAPACITY",
            defaults.inbox_capacity,
            &mut lookup,
        )?;

        if retry_max_ms < retry_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "PIKACHAT_SYNC_RETRY_MAX_MS",
                value: retry_max_ms.to_string(),
                reason: format!("must be at least PIKACHAT_SYNC_RETRY_BASE_MS ({retry_base_ms})"),
            });
        }
        for (key, value) in [
            ("PIKACHAT_REQUEST_MAX_ATTEMPTS", max_attempts as usize),
            ("PIKACHAT_REQUEST_CONCURRENCY", max_concurrent_requests),
            ("PIKACHAT_WORKER_INBOX_CAPACITY", inbox_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        Ok(Self {
            worker: WorkerConfig {
                sync_timeout_ms,
                retry: RetryPolicy::new(retry_base_ms, retry_max_ms),
                scheduler: SchedulerConfig {
                    max_attempts,
                    max_concurrent_requests,
                },
                inbox_capacity,
            },
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn parse_u32_with_default<F>(
    key: &'static str,
    default: u32,
    lookup: &mut F,
) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

fn parse_usize_with_default<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SyncClientConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SyncClientConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, SyncClientConfig::default());
    }

    #[test]
    fn parses_worker_tuning() {
        let cfg = config_from_pairs(&[
            ("PIKACHAT_SYNC_TIMEOUT_MS", "20000"),
            ("PIKACHAT_SYNC_RETRY_BASE_MS", "250"),
            ("PIKACHAT_SYNC_RETRY_MAX_MS", "8000"),
            ("PIKACHAT_REQUEST_MAX_ATTEMPTS", "3"),
            ("PIKACHAT_REQUEST_CONCURRENCY", " 2 "),
            ("PIKACHAT_WORKER_INBOX_CAPACITY", "16"),
        ])
        .expect("config should parse");

        let worker = cfg.worker;
        assert_eq!(worker.sync_timeout_ms, 20_000);
        assert_eq!(worker.retry, RetryPolicy::new(250, 8_000));
        assert_eq!(worker.scheduler.max_attempts, 3);
        assert_eq!(worker.scheduler.max_concurrent_requests, 2);
        assert_eq!(worker.inbox_capacity, 16);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("PIKACHAT_SYNC_TIMEOUT_MS", "soon")])
            .expect_err("invalid timeout should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PIKACHAT_SYNC_TIMEOUT_MS",
                ..
            }
        ));
        assert!(err.to_string().starts_with("invalid PIKACHAT_SYNC_TIMEOUT_MS='soon'"));
    }

    #[test]
    fn rejects_zero_capacities_and_inverted_retry_bounds() {
        let err = config_from_pairs(&[("PIKACHAT_REQUEST_CONCURRENCY", "0")])
            .expect_err("zero concurrency should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PIKACHAT_REQUEST_CONCURRENCY",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("PIKACHAT_SYNC_RETRY_BASE_MS", "1000"),
            ("PIKACHAT_SYNC_RETRY_MAX_MS", "10"),
        ])
        .expect_err("max below base should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "PIKACHAT_SYNC_RETRY_MAX_MS",
                ..
            }
        ));
    }
}
