//! Configuration loading for the CLI.
//!
//! Sources, applied in order with later sources overriding earlier ones:
//!  1. Built-in defaults
//!  2. `<config dir>/busq/config.toml`, when it exists
//!  3. The file named by `BUSQ_CONFIG`, which must exist when the variable is set
//!  4. Environment variables prefixed `BUSQ__`, e.g. `BUSQ__RECEIVE_WAIT_SECS=5`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "BUSQ_CONFIG";

/// Prefix of configuration environment variables
const ENV_PREFIX: &str = "BUSQ";

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// CLI configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// How long a session-less receive waits for a message
    pub receive_wait_secs: u64,

    /// How long a session receive waits before the session counts as drained
    pub session_wait_secs: u64,

    /// Transport timeout for a single request
    pub http_timeout_secs: u64,

    /// Validity of generated SAS tokens
    pub sas_token_ttl_secs: u64,

    /// Log output format
    pub log_format: LogFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            receive_wait_secs: 60,
            session_wait_secs: 60,
            http_timeout_secs: 90,
            sas_token_ttl_secs: 3600,
            log_format: LogFormat::Text,
        }
    }
}

impl CliConfig {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_secs(self.session_wait_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn sas_token_ttl(&self) -> Duration {
        Duration::from_secs(self.sas_token_ttl_secs)
    }

    /// Reject values the gateway cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "http_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.sas_token_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sas_token_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        // A request must be allowed to outlive the server-side wait
        let longest_wait = self.receive_wait_secs.max(self.session_wait_secs);
        if self.http_timeout_secs <= longest_wait {
            return Err(ConfigError::InvalidValue {
                key: "http_timeout_secs".to_string(),
                message: format!("must be greater than the receive wait of {}s", longest_wait),
            });
        }

        Ok(())
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LogFormat {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json")]
    Json,
}

/// Default location of the user configuration file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("busq").join("config.toml"))
}

/// Load configuration from the standard sources
pub fn load_configuration() -> Result<CliConfig, ConfigError> {
    let explicit = std::env::var_os(CONFIG_FILE_ENV)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);

    load_configuration_from(default_config_path().as_deref(), explicit.as_deref())
}

/// Load configuration from an optional user file and an optional required file
pub fn load_configuration_from(
    user_file: Option<&Path>,
    explicit_file: Option<&Path>,
) -> Result<CliConfig, ConfigError> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = user_file {
        builder = builder.add_source(
            ::config::File::from(path)
                .required(false)
                .format(::config::FileFormat::Toml),
        );
    }

    if let Some(path) = explicit_file {
        debug!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(
            ::config::File::from(path)
                .required(true)
                .format(::config::FileFormat::Toml),
        );
    }

    let config: CliConfig = builder
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}
