//! Domain-driven configuration for the flowrun execution pool
//!
//! Configuration is split by functional domain (pool sizing/timeouts,
//! context store, registry, logging), each with serde defaults, validation,
//! and environment variable overrides.

pub mod error;
pub mod loader;
pub mod validation;

pub mod domains;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::PoolConfig,
    registry::RegistryConfig,
    store::{StoreBackend, StoreConfig},
    FlowrunConfig,
};
