//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into a type-safe struct,
//! then `validate` checks the values that `envy` cannot (URLs, secret lengths).

use std::time::Duration;

use serde::Deserialize;

/// Longest admin session allowed (30 days).
pub const MAX_SESSION_TTL_MINUTES: i64 = 30 * 24 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] envy::Error),

    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `DATABASE_MAX_CONNECTIONS` (optional): pool size, defaults to 5
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `STRIPE_SECRET_KEY` (required): processor API key
/// - `STRIPE_API_BASE` (optional): defaults to `https://api.stripe.com/v1`
/// - `STRIPE_WEBHOOK_SECRET` (optional): enables `POST /api/payments/webhook`
/// - `PAYMENT_CURRENCY` (optional): defaults to `usd`
/// - `GATEWAY_TIMEOUT_SECS` (optional): defaults to 10
/// - `SESSION_SECRET` (required): at least 32 bytes
/// - `SESSION_TTL_MINUTES` (optional): defaults to 60, at most 43200 (30 days)
/// - `ADMIN_PASSWORD_HASH` (required): PHC-format argon2 hash of the admin password
/// - `NOTIFY_WEBHOOK_URL` / `NOTIFY_WEBHOOK_SECRET` (optional): invoice notifications
/// - `CORS_ALLOWED_ORIGIN` (optional): origin of the payment page
/// - `OVERDUE_SWEEP_SECS` (optional): defaults to 3600, 0 disables the sweep
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub stripe_secret_key: String,

    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,

    pub stripe_webhook_secret: Option<String>,

    #[serde(default = "default_currency")]
    pub payment_currency: String,

    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,

    pub session_secret: String,

    #[serde(default = "default_session_ttl")]
    pub session_ttl_minutes: i64,

    pub admin_password_hash: String,

    pub notify_webhook_url: Option<String>,

    pub notify_webhook_secret: Option<String>,

    pub cors_allowed_origin: Option<String>,

    #[serde(default = "default_overdue_sweep")]
    pub overdue_sweep_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_session_ttl() -> i64 {
    60
}

fn default_overdue_sweep() -> u64 {
    3600
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables, deserializes them into a Config struct
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing (e.g., DATABASE_URL)
    /// - Environment variable values cannot be parsed into expected types
    /// - A value fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("STRIPE_API_BASE", &self.stripe_api_base)?;
        if let Some(url) = &self.notify_webhook_url {
            validate_url("NOTIFY_WEBHOOK_URL", url)?;
        }

        if self.stripe_secret_key.trim().is_empty() {
            return Err(invalid("STRIPE_SECRET_KEY", "must not be empty"));
        }
        if self.session_secret.len() < 32 {
            return Err(invalid("SESSION_SECRET", "must be at least 32 bytes"));
        }
        if self.session_ttl_minutes <= 0 || self.session_ttl_minutes > MAX_SESSION_TTL_MINUTES {
            return Err(invalid(
                "SESSION_TTL_MINUTES",
                "must be between 1 and 43200 (30 days)",
            ));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(invalid("GATEWAY_TIMEOUT_SECS", "must be positive"));
        }
        if self.database_max_connections == 0 {
            return Err(invalid("DATABASE_MAX_CONNECTIONS", "must be positive"));
        }

        let is_argon2 = argon2::PasswordHash::new(self.admin_password_hash.trim())
            .map(|hash| hash.algorithm.as_str().starts_with("argon2"))
            .unwrap_or(false);
        if !is_argon2 {
            return Err(invalid(
                "ADMIN_PASSWORD_HASH",
                "must be a PHC-format argon2 hash ($argon2id$...)",
            ));
        }

        let currency = &self.payment_currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid("PAYMENT_CURRENCY", "must be a three letter ISO code"));
        }

        Ok(())
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_ttl_minutes)
    }

    /// `None` when the sweep is disabled.
    pub fn overdue_sweep_interval(&self) -> Option<Duration> {
        (self.overdue_sweep_secs > 0).then(|| Duration::from_secs(self.overdue_sweep_secs))
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// Require HTTPS, allowing plain HTTP only for local development.
fn validate_url(name: &'static str, url: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(url).map_err(|_| invalid(name, "invalid URL format"))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            if matches!(parsed.host_str(), Some("localhost") | Some("127.0.0.1")) {
                Ok(())
            } else {
                Err(invalid(name, "HTTPS required (HTTP only allowed for localhost)"))
            }
        }
        _ => Err(invalid(name, "URL must use HTTP or HTTPS")),
    }
}
