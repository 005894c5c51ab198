//! Agents and job filters.
//!
//! An agent is a named, sized worker group inside one dispatcher
//! registration. It claims jobs that pass its filter and whose quota names
//! it participates in.

use crate::job::{JobId, JobRecord};
use conveyor_config::AgentConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Default agent name.
pub const DEFAULT_AGENT_NAME: &str = "main";

/// Job acceptance predicate.
pub type JobFilter = Arc<dyn Fn(&JobRecord) -> bool + Send + Sync>;

/// Durable agent state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent name.
    pub name: String,
    /// Maximum concurrently active jobs.
    pub size: usize,
    /// Registered filter name; `None` accepts every job.
    pub filter: Option<String>,
    /// Quota names this agent participates in; empty means all.
    #[serde(default)]
    pub quota_names: BTreeSet<String>,
    /// Jobs this agent currently holds.
    #[serde(default)]
    pub active: BTreeSet<JobId>,
}

impl AgentRecord {
    /// Creates an idle agent that accepts anything.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            filter: None,
            quota_names: BTreeSet::new(),
            active: BTreeSet::new(),
        }
    }

    /// Sets the filter name.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Adds a quota name the agent participates in.
    pub fn with_quota(mut self, name: impl Into<String>) -> Self {
        self.quota_names.insert(name.into());
        self
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.size.saturating_sub(self.active.len())
    }

    /// Returns true if the agent would run `job`, ignoring capacity.
    pub fn accepts(&self, job: &JobRecord, filters: &FilterRegistry) -> bool {
        let quotas_ok = self.quota_names.is_empty()
            || job.quota_names.iter().all(|q| self.quota_names.contains(q));
        quotas_ok && filters.accepts(self.filter.as_deref(), job)
    }
}

impl From<&AgentConfig> for AgentRecord {
    fn from(config: &AgentConfig) -> Self {
        Self {
            name: config.name.clone(),
            size: config.size,
            filter: config.filter.clone(),
            quota_names: config.quota_names.iter().cloned().collect(),
            active: BTreeSet::new(),
        }
    }
}

/// Named job filters shared by every agent of a process.
#[derive(Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, JobFilter>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter under a name, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, filter: impl Fn(&JobRecord) -> bool + Send + Sync + 'static) {
        let name = name.into();
        info!(filter = %name, "Registered job filter");
        self.filters.write().insert(name, Arc::new(filter));
    }

    /// Returns true if a filter with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.filters.read().contains_key(name)
    }

    /// Evaluates the named filter. Unknown names reject every job so a
    /// misconfigured agent stays idle instead of running foreign work.
    pub fn accepts(&self, name: Option<&str>, job: &JobRecord) -> bool {
        let Some(name) = name else {
            return true;
        };
        let filter = self.filters.read().get(name).cloned();
        match filter {
            Some(filter) => filter(job),
            None => {
                warn!(filter = %name, job_id = %job.id, "Unknown job filter");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CallSpec;

    fn job(callable: &str) -> JobRecord {
        JobRecord::new("", CallSpec::new(callable))
    }

    #[test]
    fn test_default_agent_accepts_anything() {
        let filters = FilterRegistry::new();
        let agent = AgentRecord::new(DEFAULT_AGENT_NAME, 3);
        assert!(agent.accepts(&job("mul"), &filters));
        assert!(agent.accepts(&job("mul").with_quota("db"), &filters));
        assert_eq!(agent.available(), 3);
    }

    #[test]
    fn test_named_filter() {
        let filters = FilterRegistry::new();
        filters.register("reports-only", |job: &JobRecord| job.call.callable.starts_with("report"));
        let agent = AgentRecord::new("reports", 1).with_filter("reports-only");

        assert!(agent.accepts(&job("report_daily"), &filters));
        assert!(!agent.accepts(&job("mul"), &filters));
    }

    #[test]
    fn test_unknown_filter_rejects() {
        let filters = FilterRegistry::new();
        let agent = AgentRecord::new("odd", 1).with_filter("missing");
        assert!(!agent.accepts(&job("mul"), &filters));
    }

    #[test]
    fn test_quota_participation() {
        let filters = FilterRegistry::new();
        let agent = AgentRecord::new("db", 2).with_quota("db");

        assert!(agent.accepts(&job("mul"), &filters));
        assert!(agent.accepts(&job("mul").with_quota("db"), &filters));
        assert!(!agent.accepts(&job("mul").with_quota("mail"), &filters));
    }

    #[test]
    fn test_from_config() {
        let agent = AgentRecord::from(&AgentConfig {
            name: "bulk".into(),
            size: 8,
            filter: Some("bulk-only".into()),
            quota_names: vec!["io".into()],
        });
        assert_eq!(agent.size, 8);
        assert!(agent.quota_names.contains("io"));
        assert!(agent.active.is_empty());
    }
}
