//! Application configuration structures.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging and metrics configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Durable store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl AppConfig {
    /// Renders the effective configuration as TOML.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialization(e.to_string()))
    }
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "conveyor".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (json, pretty).
    pub log_format: String,
    /// Enable metrics.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key prefix for every record the dispatcher persists.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Baseline connection pool allowance before any dispatcher activates.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_key_prefix() -> String {
    "conveyor".to_string()
}

fn default_pool_size() -> usize {
    7
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Stable dispatcher identity. A fresh UUID is generated when absent.
    #[serde(default)]
    pub uuid: Option<String>,

    /// Seconds between the end of one poll cycle and the start of the next.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Heartbeat interval recorded in the dispatcher registration.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Heartbeat age after which a dispatcher is declared dead.
    #[serde(default = "default_ping_death_interval")]
    pub ping_death_interval_secs: u64,

    /// How long poll records are retained.
    #[serde(default = "default_poll_retention")]
    pub poll_retention_secs: u64,

    /// Upper bound on concurrently executing job threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Time allowed for worker threads to finish after the reactor stops.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Queues created on activation if they do not exist yet.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Agents installed in a queue registration that has none.
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,

    /// Concurrency caps per quota name.
    #[serde(default)]
    pub quotas: Vec<QuotaConfig>,

    /// Retry policy for transactions that hit a write conflict.
    #[serde(default)]
    pub commit_retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            poll_interval_secs: default_poll_interval(),
            ping_interval_secs: default_ping_interval(),
            ping_death_interval_secs: default_ping_death_interval(),
            poll_retention_secs: default_poll_retention(),
            worker_threads: default_worker_threads(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            queues: default_queues(),
            agents: default_agents(),
            quotas: Vec::new(),
            commit_retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Returns the ping interval as a Duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Returns the ping death interval as a Duration.
    pub fn ping_death_interval(&self) -> Duration {
        Duration::from_secs(self.ping_death_interval_secs)
    }

    /// Returns the poll retention window as a Duration.
    pub fn poll_retention(&self) -> Duration {
        Duration::from_secs(self.poll_retention_secs)
    }

    /// Returns the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Sum of all configured agent sizes.
    pub fn total_agent_size(&self) -> usize {
        self.agents.iter().map(|a| a.size).sum()
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ping_death_interval() -> u64 {
    60
}

fn default_poll_retention() -> u64 {
    900
}

fn default_worker_threads() -> usize {
    16
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_queues() -> Vec<String> {
    vec![String::new()]
}

fn default_agents() -> Vec<AgentConfig> {
    vec![AgentConfig::default()]
}

/// Agent definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name, unique within a registration.
    #[serde(default = "default_agent_name")]
    pub name: String,

    /// Maximum number of concurrently active jobs.
    #[serde(default = "default_agent_size")]
    pub size: usize,

    /// Name of a registered job filter. Absent accepts every job.
    #[serde(default)]
    pub filter: Option<String>,

    /// Quota names this agent participates in. Empty participates in all.
    #[serde(default)]
    pub quota_names: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            size: default_agent_size(),
            filter: None,
            quota_names: Vec::new(),
        }
    }
}

fn default_agent_name() -> String {
    "main".to_string()
}

fn default_agent_size() -> usize {
    3
}

/// Concurrency cap for one quota name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Queue the quota applies to.
    #[serde(default)]
    pub queue: String,
    /// Quota name.
    pub name: String,
    /// Maximum concurrently active jobs carrying this quota name.
    pub size: usize,
}

/// Conflict retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts before giving up, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.ping_death_interval(), Duration::from_secs(60));
        assert_eq!(config.poll_retention(), Duration::from_secs(900));
        assert_eq!(config.queues, vec![String::new()]);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].name, "main");
        assert_eq!(config.total_agent_size(), 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [dispatcher]
            poll_interval_secs = 2

            [[dispatcher.agents]]
            name = "reports"
            size = 5
            filter = "reports-only"
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.poll_interval_secs, 2);
        assert_eq!(config.dispatcher.ping_interval_secs, 30);
        assert_eq!(config.dispatcher.agents[0].name, "reports");
        assert_eq!(config.dispatcher.agents[0].filter.as_deref(), Some("reports-only"));
        assert_eq!(config.store.key_prefix, "conveyor");
        assert_eq!(config.dispatcher.commit_retry.max_attempts, 5);
    }

    #[test]
    fn test_to_toml_string() {
        let rendered = AppConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("poll_interval_secs = 5"));
    }
}
