// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! All knobs are read once at process start; nothing here is re-read at
//! runtime.

use std::str::FromStr;
use std::time::Duration;

use crate::model::ResourceType;
use crate::priority::PriorityWeights;
use crate::quota::HealthBands;
use crate::updater::UpdatePolicy;

/// flowtide-db configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Connection pool size for the store
    pub pool_size: u32,
    /// Cadence of the periodic quota update pass
    pub update_interval: Duration,
    /// Resource types the periodic pass reconciles
    pub update_resources: Vec<ResourceType>,
    /// Which subjects a pass visits
    pub update_policy: UpdatePolicy,
    /// Percentage band edges for quota health classification
    pub health_bands: HealthBands,
    /// Maximum restarts per major run version before rollover
    pub max_restarts_per_major: u32,
    /// Tunable weights for the priority formula
    pub priority_weights: PriorityWeights,
    /// Default CPU-seconds limit for new users (0 = unlimited)
    pub default_cpu_limit: u64,
    /// Default disk bytes limit for new users (0 = unlimited)
    pub default_disk_limit: u64,
    /// Default concurrency allowance for users without an explicit one
    pub default_concurrency_allowance: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLOWTIDE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `FLOWTIDE_DB_POOL_SIZE`: store connection pool size (default: 10)
    /// - `FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS`: pass cadence (default: 600)
    /// - `FLOWTIDE_QUOTA_UPDATE_RESOURCES`: `cpu`, `disk`, or `cpu,disk` (default: both)
    /// - `FLOWTIDE_QUOTA_UPDATE_POLICY`: `all` or `active` (default: `active`)
    /// - `FLOWTIDE_QUOTA_WARNING_PCT` / `_CRITICAL_PCT` / `_EXCEEDED_PCT`:
    ///   health band edges (defaults: 50, 80, 100)
    /// - `FLOWTIDE_MAX_RESTARTS_PER_MAJOR`: minor range per major (default: 9)
    /// - `FLOWTIDE_MAX_PRIORITY`: priority range upper bound (default: 100)
    /// - `FLOWTIDE_PRIORITY_LOAD_FLOOR`: factor floor (default: 0.1)
    /// - `FLOWTIDE_PRIORITY_LOAD_HEADROOM`: load degradation fraction (default: 0.9)
    /// - `FLOWTIDE_PRIORITY_CAPACITY`: complexity capacity reference (default: 1000000)
    /// - `FLOWTIDE_DEFAULT_CPU_LIMIT` / `FLOWTIDE_DEFAULT_DISK_LIMIT`:
    ///   limits given to new users, 0 = unlimited (defaults: 0)
    /// - `FLOWTIDE_DEFAULT_CONCURRENCY_ALLOWANCE`: (default: 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLOWTIDE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLOWTIDE_DATABASE_URL"))?;

        let pool_size: u32 = parse_var("FLOWTIDE_DB_POOL_SIZE", "10", "must be a positive integer")?;
        if pool_size == 0 {
            return Err(ConfigError::Invalid(
                "FLOWTIDE_DB_POOL_SIZE",
                "must be a positive integer",
            ));
        }

        let update_interval_secs: u64 = parse_var(
            "FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS",
            "600",
            "must be a positive integer",
        )?;
        if update_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS",
                "must be a positive integer",
            ));
        }

        let update_resources = parse_resources(
            &std::env::var("FLOWTIDE_QUOTA_UPDATE_RESOURCES").unwrap_or_else(|_| "cpu,disk".to_string()),
        )
        .ok_or(ConfigError::Invalid(
            "FLOWTIDE_QUOTA_UPDATE_RESOURCES",
            "must be a comma-separated subset of cpu,disk",
        ))?;

        let update_policy = match std::env::var("FLOWTIDE_QUOTA_UPDATE_POLICY")
            .unwrap_or_else(|_| "active".to_string())
            .as_str()
        {
            "all" => UpdatePolicy::All,
            "active" => UpdatePolicy::ActiveSinceLastPass,
            _ => {
                return Err(ConfigError::Invalid(
                    "FLOWTIDE_QUOTA_UPDATE_POLICY",
                    "must be 'all' or 'active'",
                ));
            }
        };

        let health_bands = HealthBands {
            warning_pct: parse_var("FLOWTIDE_QUOTA_WARNING_PCT", "50", "must be a number")?,
            critical_pct: parse_var("FLOWTIDE_QUOTA_CRITICAL_PCT", "80", "must be a number")?,
            exceeded_pct: parse_var("FLOWTIDE_QUOTA_EXCEEDED_PCT", "100", "must be a number")?,
        };
        health_bands.validate().map_err(|_| {
            ConfigError::Invalid(
                "FLOWTIDE_QUOTA_WARNING_PCT",
                "band edges must be positive and ordered",
            )
        })?;

        let max_restarts_per_major: u32 = parse_var(
            "FLOWTIDE_MAX_RESTARTS_PER_MAJOR",
            "9",
            "must be a non-negative integer",
        )?;

        let priority_weights = PriorityWeights {
            max_priority: parse_var("FLOWTIDE_MAX_PRIORITY", "100", "must be a positive integer")?,
            load_floor: parse_var("FLOWTIDE_PRIORITY_LOAD_FLOOR", "0.1", "must be a number")?,
            load_headroom: parse_var("FLOWTIDE_PRIORITY_LOAD_HEADROOM", "0.9", "must be a number")?,
            capacity: parse_var("FLOWTIDE_PRIORITY_CAPACITY", "1000000", "must be a positive integer")?,
        };
        priority_weights.validate().map_err(|_| {
            ConfigError::Invalid(
                "FLOWTIDE_MAX_PRIORITY",
                "priority weights out of range",
            )
        })?;

        let default_cpu_limit: u64 = parse_var(
            "FLOWTIDE_DEFAULT_CPU_LIMIT",
            "0",
            "must be a non-negative integer",
        )?;
        let default_disk_limit: u64 = parse_var(
            "FLOWTIDE_DEFAULT_DISK_LIMIT",
            "0",
            "must be a non-negative integer",
        )?;
        let default_concurrency_allowance: u32 = parse_var(
            "FLOWTIDE_DEFAULT_CONCURRENCY_ALLOWANCE",
            "4",
            "must be a non-negative integer",
        )?;

        Ok(Self {
            database_url,
            pool_size,
            update_interval: Duration::from_secs(update_interval_secs),
            update_resources,
            update_policy,
            health_bands,
            max_restarts_per_major,
            priority_weights,
            default_cpu_limit,
            default_disk_limit,
            default_concurrency_allowance,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    invalid: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, invalid))
}

fn parse_resources(value: &str) -> Option<Vec<ResourceType>> {
    let mut resources = Vec::new();
    for part in value.split(',') {
        let resource = ResourceType::parse(part.trim())?;
        if !resources.contains(&resource) {
            resources.push(resource);
        }
    }
    if resources.is_empty() { None } else { Some(resources) }
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

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            // start each test from a clean slate
            for key in [
                "FLOWTIDE_DATABASE_URL",
                "FLOWTIDE_DB_POOL_SIZE",
                "FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS",
                "FLOWTIDE_QUOTA_UPDATE_RESOURCES",
                "FLOWTIDE_QUOTA_UPDATE_POLICY",
                "FLOWTIDE_QUOTA_WARNING_PCT",
                "FLOWTIDE_QUOTA_CRITICAL_PCT",
                "FLOWTIDE_QUOTA_EXCEEDED_PCT",
                "FLOWTIDE_MAX_RESTARTS_PER_MAJOR",
                "FLOWTIDE_MAX_PRIORITY",
                "FLOWTIDE_PRIORITY_LOAD_FLOOR",
                "FLOWTIDE_PRIORITY_LOAD_HEADROOM",
                "FLOWTIDE_PRIORITY_CAPACITY",
                "FLOWTIDE_DEFAULT_CPU_LIMIT",
                "FLOWTIDE_DEFAULT_DISK_LIMIT",
                "FLOWTIDE_DEFAULT_CONCURRENCY_ALLOWANCE",
            ] {
                guard.remove(key);
            }
            guard
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

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/flowtide");
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.update_interval, Duration::from_secs(600));
        assert_eq!(
            config.update_resources,
            vec![ResourceType::Cpu, ResourceType::Disk]
        );
        assert_eq!(config.update_policy, UpdatePolicy::ActiveSinceLastPass);
        assert_eq!(config.health_bands, HealthBands::default());
        assert_eq!(config.max_restarts_per_major, 9);
        assert_eq!(config.priority_weights, PriorityWeights::default());
        assert_eq!(config.default_cpu_limit, 0);
        assert_eq!(config.default_disk_limit, 0);
        assert_eq!(config.default_concurrency_allowance, 4);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::new();

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Missing("FLOWTIDE_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_custom_update_settings() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "sqlite:flowtide.db");
        guard.set("FLOWTIDE_QUOTA_UPDATE_INTERVAL_SECS", "60");
        guard.set("FLOWTIDE_QUOTA_UPDATE_RESOURCES", "disk");
        guard.set("FLOWTIDE_QUOTA_UPDATE_POLICY", "all");

        let config = Config::from_env().unwrap();

        assert_eq!(config.update_interval, Duration::from_secs(60));
        assert_eq!(config.update_resources, vec![ResourceType::Disk]);
        assert_eq!(config.update_policy, UpdatePolicy::All);
    }

    #[test]
    fn test_config_custom_bands_and_limits() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");
        guard.set("FLOWTIDE_QUOTA_WARNING_PCT", "60");
        guard.set("FLOWTIDE_QUOTA_CRITICAL_PCT", "85");
        guard.set("FLOWTIDE_MAX_RESTARTS_PER_MAJOR", "3");
        guard.set("FLOWTIDE_DEFAULT_DISK_LIMIT", "1073741824");

        let config = Config::from_env().unwrap();

        assert_eq!(config.health_bands.warning_pct, 60.0);
        assert_eq!(config.health_bands.critical_pct, 85.0);
        assert_eq!(config.max_restarts_per_major, 3);
        assert_eq!(config.default_disk_limit, 1_073_741_824);
    }

    #[test]
    fn test_config_invalid_resources() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");
        guard.set("FLOWTIDE_QUOTA_UPDATE_RESOURCES", "cpu,memory");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Invalid("FLOWTIDE_QUOTA_UPDATE_RESOURCES", _)
        ));
    }

    #[test]
    fn test_config_invalid_policy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");
        guard.set("FLOWTIDE_QUOTA_UPDATE_POLICY", "sometimes");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Invalid("FLOWTIDE_QUOTA_UPDATE_POLICY", _)
        ));
    }

    #[test]
    fn test_config_unordered_bands() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");
        guard.set("FLOWTIDE_QUOTA_WARNING_PCT", "90");
        guard.set("FLOWTIDE_QUOTA_CRITICAL_PCT", "80");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Invalid("FLOWTIDE_QUOTA_WARNING_PCT", _)
        ));
    }

    #[test]
    fn test_config_invalid_pool_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("FLOWTIDE_DATABASE_URL", "postgres://localhost/flowtide");
        guard.set("FLOWTIDE_DB_POOL_SIZE", "0");

        assert!(Config::from_env().is_err());

        guard.set("FLOWTIDE_DB_POOL_SIZE", "not_a_number");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
