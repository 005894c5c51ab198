//! # Conveyor Config
//!
//! Configuration management for the Conveyor job dispatcher.
//! Supports layered configuration from TOML files and environment
//! variables, with runtime reload and fail-fast validation.

mod app_config;
mod error;
mod loader;
mod validation;

pub use app_config::*;
pub use error::{ConfigError, ConfigResult};
pub use loader::*;
pub use validation::{ConfigValidationError, ConfigValidator, ValidationResult};
