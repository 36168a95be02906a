//! Configuration management for the task rewards service.
//!
//! Configuration can be set via environment variables:
//! - `JWT_SECRET` - Required. HS256 secret used to validate caller bearer tokens.
//! - `TELEGRAM_BOT_TOKEN` - Required. Bot token for the Bot API and init data signatures.
//! - `TELEGRAM_API_URL` - Optional. Bot API base URL. Defaults to `https://api.telegram.org`.
//! - `DATABASE_PATH` - Optional. SQLite database file. Defaults to `./data/tasks.db`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `EXTERNAL_TIMEOUT_SECS` - Optional. Timeout for each Bot API call. Defaults to `10`.
//! - `STORE_TIMEOUT_SECS` - Optional. Timeout for each store call. Defaults to `5`.
//! - `INIT_DATA_MAX_AGE_SECS` - Optional. Max age of signed init data, `0` disables. Defaults to `86400`.
//! - `SERIALIZE_EVALUATIONS` - Optional. Serialize checks per (user, task). Defaults to `true`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Telegram integration settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token (also the init data HMAC secret)
    pub bot_token: String,

    /// Bot API base URL, without trailing slash
    pub api_url: String,

    /// Timeout applied to each Bot API request
    pub request_timeout: Duration,

    /// Maximum accepted age of signed init data; `None` disables the check
    pub init_data_max_age: Option<Duration>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secret for validating caller JWTs
    pub jwt_secret: String,

    /// Telegram settings
    pub telegram: TelegramConfig,

    /// SQLite database location
    pub database_path: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Timeout for each store call issued during an evaluation
    pub store_timeout: Duration,

    /// Serialize evaluations of the same (user, task) pair within this process
    pub serialize_evaluations: bool,
}

fn parse_secs(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `JWT_SECRET` or `TELEGRAM_BOT_TOKEN`
    /// is not set, and `ConfigError::InvalidValue` for unparsable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("JWT_SECRET".to_string()))?;

        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".to_string()))?;

        let mut api_url = std::env::var("TELEGRAM_API_URL")
            .unwrap_or_else(|_| "https://api.telegram.org".to_string());
        while api_url.ends_with('/') {
            api_url.pop();
        }

        let database_path = std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/tasks.db"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let request_timeout = Duration::from_secs(parse_secs("EXTERNAL_TIMEOUT_SECS", 10)?);
        let store_timeout = Duration::from_secs(parse_secs("STORE_TIMEOUT_SECS", 5)?);
        let max_age = parse_secs("INIT_DATA_MAX_AGE_SECS", 86_400)?;

        Ok(Self {
            jwt_secret,
            telegram: TelegramConfig {
                bot_token,
                api_url,
                request_timeout,
                init_data_max_age: (max_age > 0).then(|| Duration::from_secs(max_age)),
            },
            database_path,
            host,
            port,
            store_timeout,
            serialize_evaluations: env_var_bool("SERIALIZE_EVALUATIONS", true),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(jwt_secret: String, bot_token: String, database_path: PathBuf) -> Self {
        Self {
            jwt_secret,
            telegram: TelegramConfig {
                bot_token,
                api_url: "https://api.telegram.org".to_string(),
                request_timeout: Duration::from_secs(10),
                init_data_max_age: Some(Duration::from_secs(86_400)),
            },
            database_path,
            host: "127.0.0.1".to_string(),
            port: 3000,
            store_timeout: Duration::from_secs(5),
            serialize_evaluations: true,
        }
    }
}
