//! Environment-backed runtime configuration for `room-bot`.

use std::{env, error::Error, fmt, path::PathBuf};

use backend_core::RetryPolicy;
use tracing_subscriber::EnvFilter;

const DEFAULT_DISPLAY_NAME: &str = "room-bot";
const DEFAULT_DB_PATH: &str = "./state.db";
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 6;

/// Runtime configuration used by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    /// Homeserver base URL.
    pub homeserver: String,
    /// Full user ID or localpart to log in with.
    pub user: String,
    pub password: String,
    /// Display name given to the device created at login.
    pub display_name: String,
    /// SQLite file backing the room state cache.
    pub db_path: PathBuf,
    pub retry_base_ms: u64,
    pub retry_max_attempts: u32,
    /// `ROOM_BOT_LOG` directives, already checked to parse as a filter.
    pub log_filter: Option<String>,
}

impl BotConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = required_trimmed_env("ROOM_BOT_HOMESERVER", &mut lookup)?;
        let user = required_trimmed_env("ROOM_BOT_USER", &mut lookup)?;
        let password = required_trimmed_env("ROOM_BOT_PASSWORD", &mut lookup)?;
        let display_name = optional_trimmed_env("ROOM_BOT_DISPLAY_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_owned());
        let db_path = optional_trimmed_env("ROOM_BOT_DB_PATH", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let retry_base_ms =
            parse_optional_u64("ROOM_BOT_RETRY_BASE_MS", &mut lookup)?.unwrap_or(DEFAULT_RETRY_BASE_MS);
        let retry_max_attempts = parse_optional_u32("ROOM_BOT_RETRY_MAX_ATTEMPTS", &mut lookup)?
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);

        let log_filter = optional_trimmed_env("ROOM_BOT_LOG", &mut lookup);
        if let Some(value) = &log_filter
            && let Err(err) = EnvFilter::try_new(value)
        {
            return Err(ConfigError::InvalidValue {
                key: "ROOM_BOT_LOG",
                value: value.clone(),
                reason: err.to_string(),
            });
        }

        if retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROOM_BOT_RETRY_MAX_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            homeserver,
            user,
            password,
            display_name,
            db_path,
            retry_base_ms,
            retry_max_attempts,
            log_filter,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_base_ms,
            DEFAULT_RETRY_MAX_DELAY_MS.max(self.retry_base_ms),
            self.retry_max_attempts,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
