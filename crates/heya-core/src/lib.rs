use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Database location used when the `DSN` environment variable is unset.
pub const DEFAULT_DSN: &str = "heya.db";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Env {
    Dev,
    Prod,
}

impl Env {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "DEV",
            Self::Prod => "PROD",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEV" => Some(Self::Dev),
            "PROD" => Some(Self::Prod),
            _ => None,
        }
    }
}

impl Display for Env {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed set of log verbosities, parsed once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Error => "ERROR",
        }
    }

    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Process configuration, built once at startup and passed to components
/// explicitly. There are no hidden environment reads past construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub dsn: String,
    pub env: Env,
    pub log_level: LogLevel,
    pub openai_api_key: Option<String>,
    /// Non-fatal problems found while reading the environment, e.g. an
    /// unrecognized `LOG_LEVEL`. The caller is expected to log these once
    /// its logger is up.
    pub warnings: Vec<String>,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        let dsn = lookup("DSN").unwrap_or_else(|| DEFAULT_DSN.to_string());

        let env = match lookup("ENV") {
            Some(raw) => Env::parse(&raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "unrecognized ENV value {raw:?}; falling back to {}",
                    Env::Prod
                ));
                Env::Prod
            }),
            None => Env::Prod,
        };

        let log_level = match lookup("LOG_LEVEL") {
            Some(raw) => LogLevel::parse(&raw).unwrap_or_else(|| {
                warnings.push(format!(
                    "unrecognized LOG_LEVEL value {raw:?}; falling back to {}",
                    LogLevel::Error
                ));
                LogLevel::Error
            }),
            None => LogLevel::Debug,
        };

        let openai_api_key = lookup("OPENAI_API_KEY").filter(|value| !value.is_empty());

        Self { dsn, env, log_level, openai_api_key, warnings }
    }

    /// The API key, for callers that cannot proceed without one.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingApiKey` when `OPENAI_API_KEY` was absent
    /// or empty.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }
}

/// Persisted application settings, one row per installation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Settings {
    pub codify: bool,
    pub model: String,
    pub editor: String,
    /// Sampling temperature in tenths; 10 means 1.0.
    pub temp: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            codify: false,
            model: "gpt-4".to_string(),
            editor: "nvim".to_string(),
            temp: 10,
        }
    }
}
