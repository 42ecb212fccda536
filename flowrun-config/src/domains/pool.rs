//! Process pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Process pool sizing, timeout, and maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of worker processes kept alive
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Maximum number of worker processes; routing blocks once all are busy
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Default per-execution timeout, used when the caller supplies none
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_timeout")]
    pub default_timeout: Duration,

    /// Grace period between the graceful and forceful phases of a kill
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Recycle a worker after this many completed executions (0 disables)
    #[serde(default)]
    pub recycle_after: u64,

    /// Interval between heartbeat/registration refreshes
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,

    /// Time-to-live stamped on the liveness record at each refresh
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_registration_ttl"
    )]
    pub registration_ttl: Duration,

    /// Interval between monitor ticks (timeout/crash/scale-down checks)
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_monitor_interval"
    )]
    pub monitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            default_timeout: default_timeout(),
            shutdown_grace: default_shutdown_grace(),
            recycle_after: 0,
            heartbeat_interval: default_heartbeat_interval(),
            registration_ttl: default_registration_ttl(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.min_workers, "min_workers", self.domain_name())?;
        validate_positive(self.max_workers, "max_workers", self.domain_name())?;

        if self.max_workers < self.min_workers {
            return Err(self.validation_error(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }

        for (name, duration) in [
            ("default_timeout", self.default_timeout),
            ("shutdown_grace", self.shutdown_grace),
            ("heartbeat_interval", self.heartbeat_interval),
            ("registration_ttl", self.registration_ttl),
        ] {
            if duration.is_zero() {
                return Err(self.validation_error(format!("{} must be greater than 0", name)));
            }
        }

        if self.registration_ttl <= self.heartbeat_interval {
            return Err(self.validation_error(
                "registration_ttl must be greater than heartbeat_interval or the \
                 record expires between refreshes",
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(self.validation_error("monitor_interval must be greater than 0"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    num_cpus::get().max(default_min_workers())
}

fn default_timeout() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_registration_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.max_workers >= config.min_workers);
        assert_eq!(config.recycle_after, 0);
    }

    #[test]
    fn test_max_below_min_rejected() {
        let config = PoolConfig {
            min_workers: 4,
            max_workers: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn test_ttl_must_exceed_heartbeat() {
        let config = PoolConfig {
            heartbeat_interval: Duration::from_secs(30),
            registration_ttl: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_min_workers_rejected() {
        let config = PoolConfig {
            min_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
