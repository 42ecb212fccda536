//! Serde helpers shared by the configuration domains

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serde helper module serializing `Duration` as whole seconds
pub mod serde_duration {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}
