//! Runtime configuration for the loader, read from the environment.

use crate::loader::DEFAULT_CHUNK_SIZE;
use crate::loader::transaction::DEFAULT_TRANSACTION_TIMEOUT;
use std::env;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://festival.db";

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn lookup_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn lookup_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn lookup_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Loader settings. CLI flags take precedence over these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// `DATABASE_URL`, an `sqlite:` URL
    pub database_url: String,
    /// `BOOTSTRAP_MAX_CONNECTIONS`
    pub max_connections: u32,
    /// `BOOTSTRAP_CHUNK_SIZE`, rows per batch insert statement
    pub chunk_size: usize,
    /// `BOOTSTRAP_TRANSACTION_TIMEOUT_MS`, deadline for the whole load
    pub transaction_timeout: Duration,
    /// `BOOTSTRAP_CONNECT_TIMEOUT_MS`, per connectivity probe
    pub connect_timeout: Duration,
    /// `BOOTSTRAP_RETRY_ATTEMPTS`, including the first attempt
    pub retry_attempts: usize,
    /// `BOOTSTRAP_RETRY_BASE_DELAY_MS`, doubled on each retry
    pub retry_base_delay: Duration,
    /// `BOOTSTRAP_OVERWRITE_SETTINGS`
    pub overwrite_settings: bool,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: lookup_u32(&lookup, "BOOTSTRAP_MAX_CONNECTIONS", 5).max(1),
            chunk_size: lookup_usize(&lookup, "BOOTSTRAP_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            transaction_timeout: lookup_duration_millis(
                &lookup,
                "BOOTSTRAP_TRANSACTION_TIMEOUT_MS",
                DEFAULT_TRANSACTION_TIMEOUT,
            ),
            connect_timeout: lookup_duration_millis(
                &lookup,
                "BOOTSTRAP_CONNECT_TIMEOUT_MS",
                Duration::from_secs(10),
            ),
            retry_attempts: lookup_usize(&lookup, "BOOTSTRAP_RETRY_ATTEMPTS", 3).max(1),
            retry_base_delay: lookup_duration_millis(
                &lookup,
                "BOOTSTRAP_RETRY_BASE_DELAY_MS",
                Duration::from_millis(50),
            ),
            overwrite_settings: lookup_bool(&lookup, "BOOTSTRAP_OVERWRITE_SETTINGS", false),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> LoaderConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoaderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = LoaderConfig::default();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert!(!config.overwrite_settings);
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = from_pairs(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BOOTSTRAP_CHUNK_SIZE", "100"),
            ("BOOTSTRAP_TRANSACTION_TIMEOUT_MS", "2500"),
            ("BOOTSTRAP_OVERWRITE_SETTINGS", "yes"),
        ]);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.transaction_timeout, Duration::from_millis(2500));
        assert!(config.overwrite_settings);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = from_pairs(&[
            ("BOOTSTRAP_CHUNK_SIZE", "lots"),
            ("BOOTSTRAP_RETRY_ATTEMPTS", "0"),
        ]);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.retry_attempts, 1);
    }
}
