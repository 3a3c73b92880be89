//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString so
//! credentials never reach the logs.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Upper bound on pooled Postgres connections.
    pub max_connections: u32,
    /// Backoff used by bulk imports on serialization conflicts.
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = RetryPolicy::default();
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })?;

        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|v| !v.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            max_connections: parse_var(&lookup, "SHIFTLIST_MAX_CONNECTIONS")?.unwrap_or(10),
            retry: RetryPolicy {
                max_attempts: parse_var(&lookup, "SHIFTLIST_IMPORT_ATTEMPTS")?
                    .unwrap_or(defaults.max_attempts),
                base_delay: parse_var(&lookup, "SHIFTLIST_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: parse_var(&lookup, "SHIFTLIST_RETRY_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} must be a number, got '{raw}'"))),
    }
}
