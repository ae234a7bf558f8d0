use chrono::Duration;
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be a positive number, got {1:?}")]
    InvalidNumber(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub token_retention_days: i64,
}

/// Token lifetimes used by the session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::minutes(15),
            refresh_token_ttl: Duration::days(30),
        }
    }
}

fn positive_var(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.parse::<i64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidNumber(name, raw)),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Read `.env` if present, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:sessions.db?mode=rwc".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "development-secret-key-change-in-production".to_string()),
            access_token_ttl_minutes: positive_var("ACCESS_TOKEN_TTL_MINUTES", 15)?,
            refresh_token_ttl_days: positive_var("REFRESH_TOKEN_TTL_DAYS", 30)?,
            token_retention_days: positive_var("TOKEN_RETENTION_DAYS", 30)?,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            access_token_ttl: Duration::minutes(self.access_token_ttl_minutes),
            refresh_token_ttl: Duration::days(self.refresh_token_ttl_days),
        }
    }

    pub fn token_retention(&self) -> Duration {
        Duration::days(self.token_retention_days)
    }
}
