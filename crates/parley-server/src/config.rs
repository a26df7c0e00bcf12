use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Sample `.env` secrets that must never reach a running server.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PARLEY_JWT_SECRET is unset or empty")]
    MissingSecret,

    #[error("PARLEY_JWT_SECRET is still a placeholder value")]
    PlaceholderSecret,

    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub typing_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let host = lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let db_path = PathBuf::from(lookup("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()));

        let port = match lookup("PARLEY_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                var: "PARLEY_PORT",
                value: raw,
            })?,
            None => 3000,
        };

        let typing_timeout = seconds(&lookup, "PARLEY_TYPING_TIMEOUT_SECS", parley_gateway::typing::TYPING_TIMEOUT)?;
        let heartbeat_interval = seconds(
            &lookup,
            "PARLEY_HEARTBEAT_SECS",
            parley_gateway::connection::HEARTBEAT_INTERVAL,
        )?;

        Ok(Self {
            jwt_secret,
            host,
            port,
            db_path,
            typing_timeout,
            heartbeat_interval,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A positive whole number of seconds, or `default` when unset.
fn seconds<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid { var, value: raw }),
        },
        None => Ok(default),
    }
}
