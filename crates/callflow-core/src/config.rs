// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::activeflow_handlers::{DEFAULT_MAX_EXECUTE_COUNT, EngineSettings};
use crate::flow_handlers::{DEFAULT_MAX_FLOWS_PER_CUSTOMER, FlowSettings};

/// Call-flow core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or database file path
    pub database_url: String,
    /// TCP address of the command surface
    pub bind_addr: SocketAddr,
    /// Loop guard ceiling per activeflow
    pub max_execute_count: u64,
    /// Live persisted flows per customer
    pub max_flows_per_customer: i64,
    /// Deadline for store calls
    pub request_timeout: Duration,
    /// Lifetime of temporary flows
    pub temp_flow_ttl: Duration,
    /// Command worker count
    pub workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CALLFLOW_DATABASE_URL`: SQLite URL (`sqlite:...`) or file path
    ///
    /// Optional (with defaults):
    /// - `CALLFLOW_PORT`: command server port (default: 9010)
    /// - `CALLFLOW_MAX_EXECUTE_COUNT`: loop guard ceiling (default: 100)
    /// - `CALLFLOW_MAX_FLOWS_PER_CUSTOMER`: persisted flow ceiling (default: 10000)
    /// - `CALLFLOW_REQUEST_TIMEOUT_MS`: store deadline (default: 3000)
    /// - `CALLFLOW_TEMP_FLOW_TTL_SECS`: temporary flow TTL (default: 86400)
    /// - `CALLFLOW_WORKERS`: command workers (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CALLFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CALLFLOW_DATABASE_URL"))?;

        let port: u16 = parse_var("CALLFLOW_PORT", 9010, "must be a valid port number")?;

        let max_execute_count: u64 = parse_var(
            "CALLFLOW_MAX_EXECUTE_COUNT",
            DEFAULT_MAX_EXECUTE_COUNT,
            "must be a positive integer",
        )?;
        if max_execute_count == 0 {
            return Err(ConfigError::Invalid(
                "CALLFLOW_MAX_EXECUTE_COUNT",
                "must be a positive integer",
            ));
        }

        let max_flows_per_customer: i64 = parse_var(
            "CALLFLOW_MAX_FLOWS_PER_CUSTOMER",
            DEFAULT_MAX_FLOWS_PER_CUSTOMER,
            "must be an integer",
        )?;

        let request_timeout_ms: u64 = parse_var(
            "CALLFLOW_REQUEST_TIMEOUT_MS",
            3000,
            "must be a number of milliseconds",
        )?;

        let temp_flow_ttl_secs: u64 = parse_var(
            "CALLFLOW_TEMP_FLOW_TTL_SECS",
            86_400,
            "must be a number of seconds",
        )?;

        let workers: usize = parse_var("CALLFLOW_WORKERS", 16, "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "CALLFLOW_WORKERS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            max_execute_count,
            max_flows_per_customer,
            request_timeout: Duration::from_millis(request_timeout_ms),
            temp_flow_ttl: Duration::from_secs(temp_flow_ttl_secs),
            workers,
        })
    }

    /// Engine limits derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_execute_count: self.max_execute_count,
            request_timeout: self.request_timeout,
        }
    }

    /// Flow store limits derived from this configuration.
    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            max_flows_per_customer: self.max_flows_per_customer,
            request_timeout: self.request_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 6] = [
        "CALLFLOW_PORT",
        "CALLFLOW_MAX_EXECUTE_COUNT",
        "CALLFLOW_MAX_FLOWS_PER_CUSTOMER",
        "CALLFLOW_REQUEST_TIMEOUT_MS",
        "CALLFLOW_TEMP_FLOW_TTL_SECS",
        "CALLFLOW_WORKERS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CALLFLOW_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.bind_addr.port(), 9010);
        assert_eq!(config.max_execute_count, 100);
        assert_eq!(config.max_flows_per_customer, 10_000);
        assert_eq!(config.request_timeout, Duration::from_millis(3000));
        assert_eq!(config.temp_flow_ttl, Duration::from_secs(86_400));
        assert_eq!(config.workers, 16);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CALLFLOW_DATABASE_URL", "/var/lib/callflow/core.db");
        guard.clear_optional();
        guard.set("CALLFLOW_PORT", "9999");
        guard.set("CALLFLOW_MAX_EXECUTE_COUNT", "25");
        guard.set("CALLFLOW_REQUEST_TIMEOUT_MS", "500");
        guard.set("CALLFLOW_WORKERS", "4");

        let config = Config::from_env().unwrap();

        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.engine_settings().max_execute_count, 25);
        assert_eq!(
            config.flow_settings().request_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CALLFLOW_DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Missing("CALLFLOW_DATABASE_URL"))
        ));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CALLFLOW_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("CALLFLOW_PORT", "not_a_port");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("CALLFLOW_PORT", _))
        ));
    }

    #[test]
    fn test_config_rejects_zero_execute_count() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CALLFLOW_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("CALLFLOW_MAX_EXECUTE_COUNT", "0");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid("CALLFLOW_MAX_EXECUTE_COUNT", _))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing("CALLFLOW_DATABASE_URL");
        assert_eq!(
            err.to_string(),
            "missing required environment variable: CALLFLOW_DATABASE_URL"
        );
    }
}
