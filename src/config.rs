use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::auth::AuthConfig;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const MIN_SECRET_LENGTH: usize = 32;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Signing secret for access tokens
    #[validate(custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// Signing secret for refresh tokens (must differ from `jwt_secret`)
    #[validate(custom = "validate_jwt_secret")]
    pub jwt_refresh_secret: String,

    /// JWT issuer name
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    /// JWT audience
    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Access token lifetime (1min - 1h)
    #[serde(default = "default_access_token_ttl_secs")]
    #[validate(range(min = 60, max = 3600))]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime (1h - 30d)
    #[serde(default = "default_refresh_token_ttl_secs")]
    #[validate(range(min = 3600, max = 2592000))]
    pub refresh_token_ttl_secs: u64,

    /// Argon2 memory cost in KiB
    #[serde(default = "default_argon2_memory_kib")]
    #[validate(range(min = 8))]
    pub argon2_memory_kib: u32,

    /// Argon2 iteration count
    #[serde(default = "default_argon2_iterations")]
    #[validate(range(min = 1))]
    pub argon2_iterations: u32,

    /// Balance credited to every newly registered account
    #[serde(default = "default_opening_balance")]
    #[validate(custom = "validate_opening_balance")]
    pub opening_balance: Decimal,

    /// Transaction history page size when the caller does not pick one
    #[serde(default = "default_history_page_size")]
    #[validate(range(min = 1, max = 100))]
    pub history_default_page_size: u64,

    /// Largest page size accepted by the history query
    #[serde(default = "default_history_max_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub history_max_page_size: u64,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        jwt_refresh_secret: String,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_refresh_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            access_token_ttl_secs: default_access_token_ttl_secs(),
            refresh_token_ttl_secs: default_refresh_token_ttl_secs(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            opening_balance: default_opening_balance(),
            history_default_page_size: default_history_page_size(),
            history_max_page_size: default_history_max_page_size(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Token signing and lifetime settings for the session manager
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(
            self.jwt_secret.clone(),
            self.jwt_refresh_secret.clone(),
            self.auth_issuer.clone(),
            self.auth_audience.clone(),
            Duration::from_secs(self.access_token_ttl_secs),
            Duration::from_secs(self.refresh_token_ttl_secs),
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.jwt_secret.trim() == self.jwt_refresh_secret.trim() {
            let mut err = ValidationError::new("jwt_refresh_secret_reused");
            err.message = Some(
                "APP__JWT_REFRESH_SECRET must differ from APP__JWT_SECRET so access tokens cannot be replayed as refresh tokens"
                    .into(),
            );
            errors.add("jwt_refresh_secret", err);
        }

        if self.history_default_page_size > self.history_max_page_size {
            let mut err = ValidationError::new("history_default_page_size");
            err.message = Some("history_default_page_size must not exceed history_max_page_size".into());
            errors.add("history_default_page_size", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_auth_issuer() -> String {
    "kodbank".to_string()
}

fn default_auth_audience() -> String {
    "kodbank-api".to_string()
}

fn default_access_token_ttl_secs() -> u64 {
    DEFAULT_ACCESS_TOKEN_TTL_SECS
}

fn default_refresh_token_ttl_secs() -> u64 {
    DEFAULT_REFRESH_TOKEN_TTL_SECS
}

fn default_argon2_memory_kib() -> u32 {
    19 * 1024
}

fn default_argon2_iterations() -> u32 {
    2
}

fn default_opening_balance() -> Decimal {
    Decimal::new(100_000_00, 2)
}

fn default_history_page_size() -> u64 {
    10
}

fn default_history_max_page_size() -> u64 {
    100
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_opening_balance(balance: &Decimal) -> Result<(), ValidationError> {
    if balance.is_sign_negative() {
        let mut err = ValidationError::new("opening_balance");
        err.message = Some("opening_balance must not be negative".into());
        return Err(err);
    }
    if crate::money::to_cents(*balance).is_none() {
        let mut err = ValidationError::new("opening_balance");
        err.message = Some("opening_balance must be a whole number of cents".into());
        return Err(err);
    }
    Ok(())
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.len() < MIN_SECRET_LENGTH {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("Signing secrets must be at least 32 characters".into());
        return Err(err);
    }

    // Reject known insecure defaults and obvious placeholders
    const DISALLOWED: [&str; 4] = [
        "access-secret-123",
        "refresh-secret-456",
        "your-secret-key",
        "default-secret-key",
    ];
    let lower = trimmed.to_ascii_lowercase();
    if DISALLOWED.iter().any(|&bad| lower.contains(bad)) {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("Signing secret must be overridden with a secure random value".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("Signing secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    let unique_chars: std::collections::HashSet<char> = trimmed.chars().collect();
    if unique_chars.len() < 10 {
        let mut err = ValidationError::new("jwt_secret");
        err.message =
            Some("Signing secret must have at least 10 unique characters for adequate entropy".into());
        return Err(err);
    }

    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("kodbank={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // Signing secrets have no default; they must come from a config file or APP__ variables.
    let config = Config::builder()
        .set_default("database_url", "sqlite://kodbank.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    for key in ["jwt_secret", "jwt_refresh_secret"] {
        if config.get_string(key).is_err() {
            error!(
                "{} is not configured. Set APP__{} to a secure random string (minimum 32 characters).",
                key,
                key.to_ascii_uppercase()
            );
            return Err(AppConfigError::Load(ConfigError::NotFound(key.into())));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "access_signing_key_9f8e7d6c5b4a3210_for_unit_tests".into(),
            "refresh_signing_key_0a1b2c3d4e5f6789_for_unit_tests".into(),
            "test".into(),
        )
    }

    #[test]
    fn defaults_pass_validation() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.access_token_ttl_secs, 900);
        assert_eq!(cfg.refresh_token_ttl_secs, 604_800);
        assert_eq!(cfg.opening_balance, Decimal::new(10_000_000, 2));
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_secret = "too-short".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("jwt_secret"));
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_refresh_secret = "refresh-secret-456-padded-out-to-be-long-enough".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("jwt_refresh_secret"));
    }

    #[test]
    fn shared_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_refresh_secret = cfg.jwt_secret.clone();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn access_ttl_out_of_range_is_rejected() {
        let mut cfg = base_config();
        cfg.access_token_ttl_secs = 86_400;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("access_token_ttl_secs"));
    }

    #[test]
    fn negative_opening_balance_is_rejected() {
        let mut cfg = base_config();
        cfg.opening_balance = Decimal::new(-1, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sub_cent_opening_balance_is_rejected() {
        let mut cfg = base_config();
        cfg.opening_balance = Decimal::new(1_005, 3);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auth_config_carries_lifetimes() {
        let cfg = base_config();
        let auth = cfg.auth_config();
        assert_eq!(auth.access_token_expiration, Duration::from_secs(900));
        assert_eq!(auth.refresh_token_expiration, Duration::from_secs(604_800));
        assert_eq!(auth.jwt_issuer, "kodbank");
    }
}
