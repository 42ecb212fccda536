//! Configuration validation traits and helpers

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration domains
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Domain name used in error reporting
    fn domain_name(&self) -> &'static str;

    /// Build a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Domain {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate that a numeric field is strictly positive
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::Domain {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate that a required string field is non-empty
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.is_empty() {
        return Err(ConfigError::Domain {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1u64, "n", "pool").is_ok());
        assert!(validate_positive(0u64, "n", "pool").is_err());
    }

    #[test]
    fn test_validate_required_string() {
        assert!(validate_required_string("x", "name", "store").is_ok());
        let err = validate_required_string("", "name", "store").unwrap_err();
        assert!(err.to_string().contains("name cannot be empty"));
    }
}
