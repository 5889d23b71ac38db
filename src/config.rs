//! Service configuration.
//!
//! Settings come from an optional TOML file where every section and field
//! has a default; API credentials come from the environment.

use crate::delivery::PollSchedule;
use crate::dispatcher::DispatchConfig;
use crate::retry::RetryPolicy;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON-lines file for run outcomes; outcomes are kept in memory when unset.
    pub outcome_log: Option<PathBuf>,
    pub retry: RetrySection,
    pub delivery: DeliverySection,
    pub dispatch: DispatchSection,
    pub server: ServerSection,
    pub email: EmailSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub step_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.1,
            step_timeout_secs: 30,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .and_then(|policy| policy.with_jitter(self.jitter))
        .map_err(|e| ConfigError::Invalid(format!("[retry] {e}")))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// How delivery status reaches the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Ask the transport for each message's status.
    #[default]
    Poll,
    /// Read states pushed to the email webhook.
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub mode: DeliveryMode,
    pub timeout_secs: u64,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Poll,
            timeout_secs: 30,
            initial_interval_ms: 2_000,
            max_interval_ms: 5_000,
        }
    }
}

impl DeliverySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn schedule(&self) -> PollSchedule {
        PollSchedule {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            ..PollSchedule::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub event_name: String,
    pub run_timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let defaults = DispatchConfig::default();
        Self {
            event_name: defaults.event_name,
            run_timeout_secs: defaults.run_timeout.as_secs(),
        }
    }
}

impl DispatchSection {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            event_name: self.event_name.clone(),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSection {
    /// Sender shown on summary emails
    pub from: String,
}

impl Default for EmailSection {
    fn default() -> Self {
        Self {
            from: "Movie Summary <movies@example.com>".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    ///
    /// Unlike a missing file, an unreadable or malformed one is an error, as
    /// are settings that do not form a valid retry policy.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) => toml::from_str::<Config>(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config found at {}, using defaults", path.display());
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.policy()?;
        if self.delivery.initial_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "[delivery] initial_interval_ms must be positive".to_string(),
            ));
        }
        if self.delivery.max_interval_ms < self.delivery.initial_interval_ms {
            return Err(ConfigError::Invalid(
                "[delivery] max_interval_ms must not be below initial_interval_ms".to_string(),
            ));
        }
        if self.dispatch.event_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "[dispatch] event_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// API keys for the collaborator services.
pub struct Credentials {
    pub omdb_api_key: SecretString,
    pub openai_api_key: SecretString,
    pub resend_api_key: SecretString,
}

impl Credentials {
    /// Reads `OMDB_API_KEY`, `OPENAI_API_KEY` and `RESEND_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            omdb_api_key: secret_from_env("OMDB_API_KEY")?,
            openai_api_key: secret_from_env("OPENAI_API_KEY")?,
            resend_api_key: secret_from_env("RESEND_API_KEY")?,
        })
    }
}

fn secret_from_env(name: &'static str) -> Result<SecretString, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
        _ => Err(ConfigError::MissingCredential(name)),
    }
}
