//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading a configuration file
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Environment variable override could not be applied
    #[error("Environment variable error: {0}")]
    Env(String),

    /// Domain-specific validation failure
    #[error("Invalid {domain} configuration: {message}")]
    Domain { domain: String, message: String },
}
