//! Dispatcher registrations and liveness.
//!
//! Each dispatcher owns one registration per queue. Running dispatchers
//! refresh `last_ping` every poll cycle; any observer can declare a
//! registration dead once its ping is older than `ping_death_interval`.

use crate::agent::AgentRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Default heartbeat interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default heartbeat age at which a dispatcher is declared dead.
pub const DEFAULT_PING_DEATH_INTERVAL: Duration = Duration::from_secs(60);

/// Durable record of one dispatcher inside one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherRegistration {
    /// Dispatcher identity.
    pub uuid: Uuid,
    /// True between activate and deactivate.
    pub activated: bool,
    /// Set when another observer declared this dispatcher dead.
    #[serde(default)]
    pub dead: bool,
    /// Last heartbeat.
    pub last_ping: Option<DateTime<Utc>>,
    /// Promised heartbeat interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Heartbeat age in milliseconds at which the dispatcher counts as dead.
    pub ping_death_interval_ms: u64,
    /// Agents by name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,
    /// First registration.
    pub registered_at: DateTime<Utc>,
    /// Last activation.
    pub activated_at: Option<DateTime<Utc>>,
    /// Last deactivation or death.
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl DispatcherRegistration {
    /// Creates an inactive registration with no agents.
    pub fn new(uuid: Uuid, ping_interval: Duration, ping_death_interval: Duration) -> Self {
        Self {
            uuid,
            activated: false,
            dead: false,
            last_ping: None,
            ping_interval_ms: as_millis(ping_interval),
            ping_death_interval_ms: as_millis(ping_death_interval),
            agents: BTreeMap::new(),
            registered_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
        }
    }

    /// Heartbeat interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Death threshold.
    pub fn ping_death_interval(&self) -> Duration {
        Duration::from_millis(self.ping_death_interval_ms)
    }

    /// Stores new heartbeat intervals.
    pub fn set_ping_intervals(&mut self, ping_interval: Duration, ping_death_interval: Duration) {
        self.ping_interval_ms = as_millis(ping_interval);
        self.ping_death_interval_ms = as_millis(ping_death_interval);
    }

    /// Marks the registration active and pings.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        self.activated = true;
        self.dead = false;
        self.activated_at = Some(now);
        self.last_ping = Some(now);
    }

    /// Marks the registration inactive.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.activated = false;
        self.deactivated_at = Some(now);
    }

    /// Records a heartbeat.
    pub fn ping(&mut self, now: DateTime<Utc>) {
        self.last_ping = Some(now);
    }

    /// Returns true if an activated dispatcher has missed its heartbeat.
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        if !self.activated || self.dead {
            return false;
        }
        let Some(last_ping) = self.last_ping else {
            return false;
        };
        let death = chrono::Duration::from_std(self.ping_death_interval())
            .unwrap_or(chrono::Duration::MAX);
        now - last_ping > death
    }

    /// Sum of agent sizes, the pool share this registration needs.
    pub fn total_size(&self) -> usize {
        self.agents.values().map(|a| a.size).sum()
    }

    /// Number of jobs held by all agents.
    pub fn active_count(&self) -> usize {
        self.agents.values().map(|a| a.active.len()).sum()
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> DispatcherRegistration {
        DispatcherRegistration::new(Uuid::new_v4(), DEFAULT_PING_INTERVAL, DEFAULT_PING_DEATH_INTERVAL)
    }

    #[test]
    fn test_new_registration_is_inactive() {
        let reg = registration();
        assert!(!reg.activated);
        assert_eq!(reg.ping_interval(), Duration::from_secs(30));
        assert_eq!(reg.ping_death_interval(), Duration::from_secs(60));
        assert!(!reg.is_dead(Utc::now() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_death_after_missed_pings() {
        let mut reg = registration();
        let start = Utc::now();
        reg.activate(start);

        assert!(!reg.is_dead(start + chrono::Duration::seconds(59)));
        assert!(reg.is_dead(start + chrono::Duration::seconds(61)));

        reg.ping(start + chrono::Duration::seconds(50));
        assert!(!reg.is_dead(start + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_sub_second_intervals_are_kept() {
        let mut reg = DispatcherRegistration::new(
            Uuid::new_v4(),
            Duration::from_millis(200),
            Duration::from_millis(500),
        );
        assert_eq!(reg.ping_interval(), Duration::from_millis(200));
        assert_eq!(reg.ping_death_interval(), Duration::from_millis(500));

        let start = Utc::now();
        reg.activate(start);
        assert!(!reg.is_dead(start + chrono::Duration::milliseconds(10)));
        assert!(!reg.is_dead(start + chrono::Duration::milliseconds(499)));
        assert!(reg.is_dead(start + chrono::Duration::milliseconds(501)));
    }

    #[test]
    fn test_deactivated_is_never_dead() {
        let mut reg = registration();
        let start = Utc::now();
        reg.activate(start);
        reg.deactivate(start);
        assert!(!reg.is_dead(start + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_sizes() {
        let mut reg = registration();
        reg.agents.insert("main".into(), AgentRecord::new("main", 3));
        reg.agents.insert("bulk".into(), AgentRecord::new("bulk", 5));
        assert_eq!(reg.total_size(), 8);
        assert_eq!(reg.active_count(), 0);
    }
}
