//! Execution context store configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};

/// Context store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend used to hand execution input to workers
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the filesystem backend (one JSON file per execution)
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Available context store backends.
///
/// The memory backend only works when pool and workers share one process
/// (tests, embedded use); real worker processes need the filesystem backend
/// or an external store supplied by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Filesystem,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "filesystem" | "fs" => Ok(StoreBackend::Filesystem),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl Validatable for StoreConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.backend == StoreBackend::Filesystem {
            validate_required_string(&self.path, "path", self.domain_name())?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "store"
    }
}

fn default_store_path() -> String {
    "/tmp/flowrun/contexts".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, StoreBackend::Filesystem);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filesystem_requires_path() {
        let config = StoreConfig {
            backend: StoreBackend::Filesystem,
            path: String::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("fs".parse::<StoreBackend>().unwrap(), StoreBackend::Filesystem);
        assert_eq!("MEMORY".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("redis".parse::<StoreBackend>().is_err());
    }
}
