//! Configuration loader with layered sources.

use crate::error::{ConfigError, ConfigResult};
use crate::validation::ConfigValidator;
use crate::AppConfig;
use config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Environment variable naming the active environment.
pub const ENVIRONMENT_VAR: &str = "CONVEYOR_ENVIRONMENT";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `CONVEYOR__` prefix
    pub fn new(config_dir: impl Into<String>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        let config = Self::load_config(&config_dir, &environment)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> ConfigResult<Self> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> ConfigResult<()> {
        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        let new_config = Self::load_config(&self.config_dir, &environment)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads and validates configuration for the given environment.
    pub fn load_config(config_dir: &str, environment: &str) -> ConfigResult<AppConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        info!(environment = %environment, config_dir = %config_dir, "Loading configuration");

        let mut builder = Config::builder();

        for name in ["default", environment, "local"] {
            let path = format!("{}/{}.toml", config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CONVEYOR")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;

        if app_config.dispatcher.uuid.is_none() {
            warn!("No dispatcher UUID configured; a new identity is generated on every start");
        }

        ConfigValidator::validate(&app_config).map_err(ConfigError::Invalid)?;

        Ok(app_config)
    }

    /// Gets a specific configuration value by key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let config = ConfigLoader::load_config(missing.to_str().unwrap(), "test").unwrap();
        assert_eq!(config.dispatcher.poll_interval_secs, 5);
        assert_eq!(config.store.pool_size, 7);
    }

    #[test]
    fn test_layers_override_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[dispatcher]\npoll_interval_secs = 3\nping_interval_secs = 20\n",
        );
        write(dir.path(), "staging.toml", "[dispatcher]\npoll_interval_secs = 2\n");
        write(dir.path(), "local.toml", "[store]\npool_size = 11\n");

        let config = ConfigLoader::load_config(dir.path().to_str().unwrap(), "staging").unwrap();
        assert_eq!(config.dispatcher.poll_interval_secs, 2);
        assert_eq!(config.dispatcher.ping_interval_secs, 20);
        assert_eq!(config.store.pool_size, 11);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[dispatcher]\nping_interval_secs = 30\nping_death_interval_secs = 10\n",
        );

        let err = ConfigLoader::load_config(dir.path().to_str().unwrap(), "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_get_value_by_path() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[[dispatcher.agents]]\nname = \"bulk\"\nsize = 8\n",
        );
        let loader = ConfigLoader::new(dir.path().to_str().unwrap()).unwrap();

        let interval: Option<u64> = loader.get_value("dispatcher.ping_interval_secs").await;
        assert_eq!(interval, Some(30));

        let config = loader.get().await;
        assert_eq!(config.dispatcher.agents[0].name, "bulk");
        assert_eq!(config.dispatcher.total_agent_size(), 8);
    }
}
