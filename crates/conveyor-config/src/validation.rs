//! Configuration validation module.
//!
//! Collects every violation in one pass so a misconfigured dispatcher
//! fails at startup rather than in its first poll cycle.

use crate::{AppConfig, DispatcherConfig, ObservabilityConfig, StoreConfig};
use std::collections::HashSet;
use std::fmt;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// An interval that drives a timer is zero.
    NonPositiveInterval { name: String },
    /// Polls happen less often than the heartbeat promises.
    PollSlowerThanPing { poll: u64, ping: u64 },
    /// The death interval does not exceed the ping interval.
    DeathIntervalTooShort { ping: u64, death: u64 },
    /// Poll records would be pruned before the next poll.
    RetentionTooShort { retention: u64, poll: u64 },
    /// An agent has no capacity.
    ZeroAgentSize { agent: String },
    /// Two agents share a name.
    DuplicateAgent { agent: String },
    /// A quota cap is zero.
    ZeroQuotaSize { quota: String },
    /// Worker thread count is zero.
    NoWorkerThreads,
    /// The conflict retry policy allows no attempts.
    NoCommitAttempts,
    /// The configured UUID does not parse.
    InvalidUuid { value: String },
    /// Store key prefix is empty.
    EmptyKeyPrefix,
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Log format is invalid.
    InvalidLogFormat { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveInterval { name } => {
                write!(f, "Interval '{}' must be positive", name)
            }
            Self::PollSlowerThanPing { poll, ping } => {
                write!(
                    f,
                    "Poll interval ({}s) must not exceed ping interval ({}s)",
                    poll, ping
                )
            }
            Self::DeathIntervalTooShort { ping, death } => {
                write!(
                    f,
                    "Ping death interval ({}s) must be greater than ping interval ({}s)",
                    death, ping
                )
            }
            Self::RetentionTooShort { retention, poll } => {
                write!(
                    f,
                    "Poll retention ({}s) must be at least the poll interval ({}s)",
                    retention, poll
                )
            }
            Self::ZeroAgentSize { agent } => {
                write!(f, "Agent '{}' must have a size of at least 1", agent)
            }
            Self::DuplicateAgent { agent } => {
                write!(f, "Agent '{}' is defined more than once", agent)
            }
            Self::ZeroQuotaSize { quota } => {
                write!(f, "Quota '{}' must allow at least 1 active job", quota)
            }
            Self::NoWorkerThreads => write!(f, "Worker thread count must be at least 1"),
            Self::NoCommitAttempts => write!(f, "Commit retry must allow at least 1 attempt"),
            Self::InvalidUuid { value } => {
                write!(f, "Invalid dispatcher UUID: '{}'", value)
            }
            Self::EmptyKeyPrefix => write!(f, "Store key prefix must not be empty"),
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                    value
                )
            }
            Self::InvalidLogFormat { value } => {
                write!(f, "Invalid log format: '{}' (valid: pretty, json)", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];
    const VALID_LOG_FORMATS: &'static [&'static str] = &["pretty", "json"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_dispatcher(&config.dispatcher, &mut result);
        Self::validate_store(&config.store, &mut result);
        Self::validate_observability(&config.observability, &mut result);

        result.into_result()
    }

    fn validate_dispatcher(config: &DispatcherConfig, result: &mut ValidationResult) {
        for (name, value) in [
            ("poll_interval_secs", config.poll_interval_secs),
            ("ping_interval_secs", config.ping_interval_secs),
            ("ping_death_interval_secs", config.ping_death_interval_secs),
        ] {
            if value == 0 {
                result.add_error(ConfigValidationError::NonPositiveInterval {
                    name: name.to_string(),
                });
            }
        }

        // A cycle must refresh the heartbeat at least once per ping interval
        if config.poll_interval_secs > config.ping_interval_secs {
            result.add_error(ConfigValidationError::PollSlowerThanPing {
                poll: config.poll_interval_secs,
                ping: config.ping_interval_secs,
            });
        }

        if config.ping_death_interval_secs <= config.ping_interval_secs {
            result.add_error(ConfigValidationError::DeathIntervalTooShort {
                ping: config.ping_interval_secs,
                death: config.ping_death_interval_secs,
            });
        }

        if config.poll_retention_secs < config.poll_interval_secs {
            result.add_error(ConfigValidationError::RetentionTooShort {
                retention: config.poll_retention_secs,
                poll: config.poll_interval_secs,
            });
        }

        let mut seen = HashSet::new();
        for agent in &config.agents {
            if agent.size == 0 {
                result.add_error(ConfigValidationError::ZeroAgentSize {
                    agent: agent.name.clone(),
                });
            }
            if !seen.insert(agent.name.as_str()) {
                result.add_error(ConfigValidationError::DuplicateAgent {
                    agent: agent.name.clone(),
                });
            }
        }

        for quota in &config.quotas {
            if quota.size == 0 {
                result.add_error(ConfigValidationError::ZeroQuotaSize {
                    quota: quota.name.clone(),
                });
            }
        }

        if config.worker_threads == 0 {
            result.add_error(ConfigValidationError::NoWorkerThreads);
        }

        if config.commit_retry.max_attempts == 0 {
            result.add_error(ConfigValidationError::NoCommitAttempts);
        }

        if let Some(uuid) = &config.uuid {
            if !is_uuid(uuid) {
                result.add_error(ConfigValidationError::InvalidUuid {
                    value: uuid.clone(),
                });
            }
        }
    }

    fn validate_store(config: &StoreConfig, result: &mut ValidationResult) {
        if config.key_prefix.is_empty() {
            result.add_error(ConfigValidationError::EmptyKeyPrefix);
        }
    }

    fn validate_observability(config: &ObservabilityConfig, result: &mut ValidationResult) {
        if !Self::VALID_LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.log_level.clone(),
            });
        }
        if !Self::VALID_LOG_FORMATS.contains(&config.log_format.to_lowercase().as_str()) {
            result.add_error(ConfigValidationError::InvalidLogFormat {
                value: config.log_format.clone(),
            });
        }
    }
}

/// Hyphenated 8-4-4-4-12 hex form.
fn is_uuid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}
