//! Configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_DEADLOCK_RETRIES: &str = "DUALBOOK_MAX_DEADLOCK_RETRIES";
pub const ALLOWED_OPEN_TRANSACTIONS: &str = "DUALBOOK_ALLOWED_OPEN_TRANSACTIONS";
pub const LOCK_WAIT_TIMEOUT_MS: &str = "DUALBOOK_LOCK_WAIT_TIMEOUT_MS";
pub const VALIDATION_BATCH_SIZE: &str = "DUALBOOK_VALIDATION_BATCH_SIZE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Locking coordinator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockConfig {
    /// `None` retries deadlocked transactions forever.
    pub max_deadlock_retries: Option<u32>,
    /// Application transactions allowed to be open when accounts are locked.
    ///
    /// `0` in production; `1` for test suites that wrap every test in a transaction.
    pub allowed_open_transactions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub lock: LockConfig,
    pub lock_wait_timeout: Duration,
    /// Lines fetched per page by the consistency validator.
    pub validation_batch_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lock: LockConfig::default(),
            lock_wait_timeout: Duration::from_millis(5_000),
            validation_batch_size: 1_000,
        }
    }
}

impl LedgerConfig {
    /// Load from the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.database_url = lookup(DATABASE_URL).filter(|url| !url.is_empty());

        if let Some(retries) = parse(&lookup, MAX_DEADLOCK_RETRIES)? {
            config.lock.max_deadlock_retries = Some(retries);
        }
        if let Some(allowed) = parse(&lookup, ALLOWED_OPEN_TRANSACTIONS)? {
            config.lock.allowed_open_transactions = allowed;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, LOCK_WAIT_TIMEOUT_MS)? {
            config.lock_wait_timeout = Duration::from_millis(ms);
        }
        if let Some(batch) = parse::<usize, _>(&lookup, VALIDATION_BATCH_SIZE)? {
            if batch == 0 {
                return Err(ConfigError::Invalid {
                    var: VALIDATION_BATCH_SIZE,
                    value: batch.to_string(),
                });
            }
            config.validation_batch_size = batch;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
