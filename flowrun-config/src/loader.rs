//! Configuration loading and environment variable overrides

use std::path::Path;
use std::time::Duration;

use crate::domains::FlowrunConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a loader with the default `FLOWRUN` prefix
    pub fn new() -> Self {
        Self {
            prefix: "FLOWRUN".to_string(),
        }
    }

    /// Create a loader with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load from a YAML file, then apply environment overrides and validate
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<FlowrunConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: FlowrunConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Build from defaults plus environment overrides only
    pub fn from_env(&self) -> ConfigResult<FlowrunConfig> {
        let mut config = FlowrunConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load with a fallback chain: file if given, otherwise env only
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<FlowrunConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn apply_env_overrides(&self, config: &mut FlowrunConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(config)?;
        self.apply_store_overrides(config)?;
        self.apply_logging_overrides(config)?;
        Ok(())
    }

    fn apply_pool_overrides(&self, config: &mut FlowrunConfig) -> ConfigResult<()> {
        if let Ok(value) = self.get_env_var("MIN_WORKERS") {
            config.pool.min_workers = self.parse(&value, "MIN_WORKERS")?;
        }
        if let Ok(value) = self.get_env_var("MAX_WORKERS") {
            config.pool.max_workers = self.parse(&value, "MAX_WORKERS")?;
        }
        if let Ok(value) = self.get_env_var("DEFAULT_TIMEOUT_SECONDS") {
            config.pool.default_timeout =
                Duration::from_secs(self.parse(&value, "DEFAULT_TIMEOUT_SECONDS")?);
        }
        if let Ok(value) = self.get_env_var("SHUTDOWN_GRACE_SECONDS") {
            config.pool.shutdown_grace =
                Duration::from_secs(self.parse(&value, "SHUTDOWN_GRACE_SECONDS")?);
        }
        if let Ok(value) = self.get_env_var("RECYCLE_AFTER") {
            config.pool.recycle_after = self.parse(&value, "RECYCLE_AFTER")?;
        }
        if let Ok(value) = self.get_env_var("HEARTBEAT_SECONDS") {
            config.pool.heartbeat_interval =
                Duration::from_secs(self.parse(&value, "HEARTBEAT_SECONDS")?);
        }
        if let Ok(value) = self.get_env_var("REGISTRATION_TTL_SECONDS") {
            config.pool.registration_ttl =
                Duration::from_secs(self.parse(&value, "REGISTRATION_TTL_SECONDS")?);
        }
        if let Ok(value) = self.get_env_var("MONITOR_INTERVAL_SECONDS") {
            config.pool.monitor_interval =
                Duration::from_secs(self.parse(&value, "MONITOR_INTERVAL_SECONDS")?);
        }
        Ok(())
    }

    fn apply_store_overrides(&self, config: &mut FlowrunConfig) -> ConfigResult<()> {
        if let Ok(value) = self.get_env_var("STORE_BACKEND") {
            config.store.backend = value
                .parse()
                .map_err(|e| ConfigError::Env(format!("Invalid STORE_BACKEND: {}", e)))?;
        }
        if let Ok(value) = self.get_env_var("STORE_PATH") {
            config.store.path = value;
        }
        if let Ok(value) = self.get_env_var("REGISTRY_BACKEND") {
            config.registry.backend = value
                .parse()
                .map_err(|e| ConfigError::Env(format!("Invalid REGISTRY_BACKEND: {}", e)))?;
        }
        if let Ok(value) = self.get_env_var("REGISTRY_PATH") {
            config.registry.path = value;
        }
        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut FlowrunConfig) -> ConfigResult<()> {
        if let Ok(value) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = value
                .parse()
                .map_err(|_| ConfigError::Env(format!("Invalid LOG_LEVEL: {}", value)))?;
        }
        if let Ok(value) = self.get_env_var("LOG_FORMAT") {
            config.logging.format = value
                .parse()
                .map_err(|_| ConfigError::Env(format!("Invalid LOG_FORMAT: {}", value)))?;
        }
        Ok(())
    }

    fn parse<T: std::str::FromStr>(&self, value: &str, name: &str) -> ConfigResult<T>
    where
        T::Err: std::fmt::Display,
    {
        value
            .parse()
            .map_err(|e| ConfigError::Env(format!("Invalid {}: {}", name, e)))
    }

    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Each test uses its own prefix so parallel tests never share env vars.

    #[test]
    fn test_from_env_defaults() {
        let loader = ConfigLoader::with_prefix("FLOWRUN_TEST_DEFAULTS");
        let config = loader.from_env().unwrap();
        assert_eq!(config.pool.min_workers, 2);
    }

    #[test]
    fn test_env_overrides_applied() {
        std::env::set_var("FLOWRUN_TEST_OVR_MIN_WORKERS", "3");
        std::env::set_var("FLOWRUN_TEST_OVR_MAX_WORKERS", "8");
        std::env::set_var("FLOWRUN_TEST_OVR_DEFAULT_TIMEOUT_SECONDS", "60");
        std::env::set_var("FLOWRUN_TEST_OVR_LOG_LEVEL", "debug");

        let loader = ConfigLoader::with_prefix("FLOWRUN_TEST_OVR");
        let config = loader.from_env().unwrap();

        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.default_timeout, Duration::from_secs(60));
        assert_eq!(
            config.logging.level,
            crate::domains::logging::LogLevel::Debug
        );

        std::env::remove_var("FLOWRUN_TEST_OVR_MIN_WORKERS");
        std::env::remove_var("FLOWRUN_TEST_OVR_MAX_WORKERS");
        std::env::remove_var("FLOWRUN_TEST_OVR_DEFAULT_TIMEOUT_SECONDS");
        std::env::remove_var("FLOWRUN_TEST_OVR_LOG_LEVEL");
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        std::env::set_var("FLOWRUN_TEST_BAD_MIN_WORKERS", "not-a-number");
        let loader = ConfigLoader::with_prefix("FLOWRUN_TEST_BAD");
        assert!(loader.from_env().is_err());
        std::env::remove_var("FLOWRUN_TEST_BAD_MIN_WORKERS");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "pool:\n  min_workers: 1\n  max_workers: 4\n  recycle_after: 50\nstore:\n  backend: memory"
        )
        .unwrap();

        let loader = ConfigLoader::with_prefix("FLOWRUN_TEST_FILE");
        let config = loader.from_file(file.path()).unwrap();

        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.recycle_after, 50);
        assert_eq!(
            config.store.backend,
            crate::domains::store::StoreBackend::Memory
        );
    }

    #[test]
    fn test_from_file_invalid_pool_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool:\n  min_workers: 5\n  max_workers: 2").unwrap();

        let loader = ConfigLoader::with_prefix("FLOWRUN_TEST_FILE_BAD");
        assert!(loader.from_file(file.path()).is_err());
    }
}
