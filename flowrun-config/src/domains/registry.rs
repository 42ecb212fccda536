//! Liveness registry configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};

use super::store::StoreBackend;

/// Where the pool publishes its liveness record and state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Backend used for the liveness record
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the filesystem backend (one JSON file per pool)
    #[serde(default = "default_registry_path")]
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_registry_path(),
        }
    }
}

impl Validatable for RegistryConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.backend == StoreBackend::Filesystem {
            validate_required_string(&self.path, "path", self.domain_name())?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "registry"
    }
}

fn default_registry_path() -> String {
    "/tmp/flowrun/registry".to_string()
}
