//! Domain-specific configuration modules

pub mod logging;
pub mod pool;
pub mod registry;
pub mod store;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Top-level configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlowrunConfig {
    /// Process pool sizing, timeouts, and maintenance intervals
    #[serde(default)]
    pub pool: pool::PoolConfig,

    /// Execution context store
    #[serde(default)]
    pub store: store::StoreConfig,

    /// Liveness registry for heartbeat publishing
    #[serde(default)]
    pub registry: registry::RegistryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl FlowrunConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.store.validate()?;
        self.registry.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
