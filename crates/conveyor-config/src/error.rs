//! Configuration error types.

use crate::validation::ConfigValidationError;
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or parsed.
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    /// The merged configuration failed validation.
    #[error("Invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ConfigValidationError>),

    /// Serializing the configuration failed.
    #[error("Configuration serialization error: {0}")]
    Serialization(String),
}

fn format_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_lists_every_error() {
        let err = ConfigError::Invalid(vec![
            ConfigValidationError::NonPositiveInterval {
                name: "poll_interval_secs".into(),
            },
            ConfigValidationError::InvalidLogLevel {
                value: "loud".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("poll_interval_secs"));
        assert!(msg.contains("loud"));
    }
}
