//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use chrono::FixedOffset;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    /// Directory holding `{messageId}-{originalName}` blobs.
    pub content_dir: PathBuf,
    pub teardown_grace: Duration,
    pub keepalive_interval: Duration,
    pub catalog_refresh_interval: Duration,
    pub identity_cookie: String,
    pub allowed_origin: String,
    /// Offset used when the server stamps wire timestamps itself.
    pub clock_offset: FixedOffset,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server and Database Settings ---
        let bind_address_str = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let content_dir = lookup("CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));

        // --- Real-time Settings ---
        let teardown_grace = seconds(&lookup, "TEARDOWN_GRACE_SECS", 7 * 24 * 60 * 60)?;
        let keepalive_interval = seconds(&lookup, "KEEPALIVE_SECS", 30)?;
        if keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "KEEPALIVE_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let catalog_refresh_interval = seconds(&lookup, "CATALOG_REFRESH_SECS", 300)?;
        if catalog_refresh_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CATALOG_REFRESH_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        // --- HTTP Surface ---
        let identity_cookie = lookup("IDENTITY_COOKIE").unwrap_or_else(|| "uuid".to_string());
        let allowed_origin =
            lookup("ALLOWED_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        let offset_str = lookup("CLOCK_UTC_OFFSET_HOURS").unwrap_or_else(|| "9".to_string());
        let clock_offset = offset_str
            .parse::<i32>()
            .ok()
            .and_then(|hours| hours.checked_mul(3600))
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "CLOCK_UTC_OFFSET_HOURS".to_string(),
                    format!("'{}' is not a valid hour offset", offset_str),
                )
            })?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            content_dir,
            teardown_grace,
            keepalive_interval,
            catalog_refresh_interval,
            identity_cookie,
            allowed_origin,
            clock_offset,
        })
    }
}

fn seconds<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
    }
}
