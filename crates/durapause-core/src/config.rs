// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::dual_iter::DEFAULT_FETCH_CONCURRENCY;
use crate::leaser::{DEFAULT_LEASE_DURATION, DEFAULT_RENEW_INTERVAL};
use crate::manager::DEFAULT_FLUSH_DELAY;

/// Pause store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the buffer, leases and block metadata
    pub database_url: String,
    /// Directory for block blobs; in-memory when unset
    pub blob_dir: Option<PathBuf>,
    /// Pauses per block
    pub block_size: usize,
    /// Delay before each flush
    pub flush_delay: Duration,
    /// Flush lease duration
    pub lease_duration: Duration,
    /// Interval between flush lease renewals
    pub lease_renew_interval: Duration,
    /// Concurrent block fetches per iterator
    pub fetch_concurrency: usize,
}

impl Config {
    /// Configuration for `database_url` with every other setting at its default.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            blob_dir: None,
            block_size: DEFAULT_BLOCK_SIZE,
            flush_delay: DEFAULT_FLUSH_DELAY,
            lease_duration: DEFAULT_LEASE_DURATION,
            lease_renew_interval: DEFAULT_RENEW_INTERVAL,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DURAPAUSE_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DURAPAUSE_BLOB_DIR`: block directory (default: in-memory)
    /// - `DURAPAUSE_BLOCK_SIZE`: pauses per block (default: 25000)
    /// - `DURAPAUSE_FLUSH_DELAY_MS`: delay before flushing (default: 10000)
    /// - `DURAPAUSE_LEASE_DURATION_MS`: flush lease duration (default: 30000)
    /// - `DURAPAUSE_LEASE_RENEW_INTERVAL_MS`: lease renewal interval (default: 10000)
    /// - `DURAPAUSE_FETCH_CONCURRENCY`: concurrent block fetches (default: 20)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DURAPAUSE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DURAPAUSE_DATABASE_URL"))?;

        let blob_dir = std::env::var("DURAPAUSE_BLOB_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        let block_size: usize = parse_var(
            "DURAPAUSE_BLOCK_SIZE",
            DEFAULT_BLOCK_SIZE,
            "must be a positive integer",
        )?;
        if block_size == 0 {
            return Err(ConfigError::Invalid(
                "DURAPAUSE_BLOCK_SIZE",
                "must be a positive integer",
            ));
        }

        let flush_delay = parse_millis("DURAPAUSE_FLUSH_DELAY_MS", DEFAULT_FLUSH_DELAY)?;
        let lease_duration = parse_millis("DURAPAUSE_LEASE_DURATION_MS", DEFAULT_LEASE_DURATION)?;
        let lease_renew_interval =
            parse_millis("DURAPAUSE_LEASE_RENEW_INTERVAL_MS", DEFAULT_RENEW_INTERVAL)?;

        if lease_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "DURAPAUSE_LEASE_DURATION_MS",
                "must be greater than zero",
            ));
        }
        if lease_renew_interval.is_zero() || lease_renew_interval >= lease_duration {
            return Err(ConfigError::Invalid(
                "DURAPAUSE_LEASE_RENEW_INTERVAL_MS",
                "must be greater than zero and shorter than the lease duration",
            ));
        }

        let fetch_concurrency: usize = parse_var(
            "DURAPAUSE_FETCH_CONCURRENCY",
            DEFAULT_FETCH_CONCURRENCY,
            "must be a positive integer",
        )?;
        if fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "DURAPAUSE_FETCH_CONCURRENCY",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            blob_dir,
            block_size,
            flush_delay,
            lease_duration,
            lease_renew_interval,
            fetch_concurrency,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_var(key, default.as_millis() as u64, "must be a number of milliseconds")?;
    Ok(Duration::from_millis(ms))
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

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 7] = [
        "DURAPAUSE_DATABASE_URL",
        "DURAPAUSE_BLOB_DIR",
        "DURAPAUSE_BLOCK_SIZE",
        "DURAPAUSE_FLUSH_DELAY_MS",
        "DURAPAUSE_LEASE_DURATION_MS",
        "DURAPAUSE_LEASE_RENEW_INTERVAL_MS",
        "DURAPAUSE_FETCH_CONCURRENCY",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every pause store variable unset.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
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
        let mut guard = EnvGuard::clean();
        guard.set("DURAPAUSE_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.blob_dir.is_none());
        assert_eq!(config.block_size, 25_000);
        assert_eq!(config.flush_delay, Duration::from_secs(10));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.lease_renew_interval, Duration::from_secs(10));
        assert_eq!(config.fetch_concurrency, 20);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DURAPAUSE_DATABASE_URL", "sqlite:pauses.db");
        guard.set("DURAPAUSE_BLOB_DIR", "/var/lib/durapause/blocks");
        guard.set("DURAPAUSE_BLOCK_SIZE", "500");
        guard.set("DURAPAUSE_FLUSH_DELAY_MS", "0");
        guard.set("DURAPAUSE_LEASE_DURATION_MS", "5000");
        guard.set("DURAPAUSE_LEASE_RENEW_INTERVAL_MS", "1000");
        guard.set("DURAPAUSE_FETCH_CONCURRENCY", "4");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.blob_dir,
            Some(PathBuf::from("/var/lib/durapause/blocks"))
        );
        assert_eq!(config.block_size, 500);
        assert_eq!(config.flush_delay, Duration::ZERO);
        assert_eq!(config.lease_duration, Duration::from_secs(5));
        assert_eq!(config.lease_renew_interval, Duration::from_secs(1));
        assert_eq!(config.fetch_concurrency, 4);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DURAPAUSE_DATABASE_URL")));
        assert!(err.to_string().contains("DURAPAUSE_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_block_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DURAPAUSE_DATABASE_URL", "sqlite::memory:");

        guard.set("DURAPAUSE_BLOCK_SIZE", "lots");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DURAPAUSE_BLOCK_SIZE", _)
        ));

        guard.set("DURAPAUSE_BLOCK_SIZE", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("DURAPAUSE_BLOCK_SIZE", _)
        ));
    }

    #[test]
    fn test_config_renew_interval_must_be_shorter_than_lease() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("DURAPAUSE_DATABASE_URL", "sqlite::memory:");
        guard.set("DURAPAUSE_LEASE_DURATION_MS", "1000");
        guard.set("DURAPAUSE_LEASE_RENEW_INTERVAL_MS", "1000");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("DURAPAUSE_LEASE_RENEW_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_config_new_uses_defaults() {
        let config = Config::new("sqlite::memory:");
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.fetch_concurrency, DEFAULT_FETCH_CONCURRENCY);
    }
}
