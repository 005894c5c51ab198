//! Durable queues and the claiming protocol.
//!
//! Every operation here works inside a caller-supplied transaction; nothing
//! is visible to other dispatchers until that transaction commits. Claiming
//! rewrites the pending list, so two agents racing for the same job collide
//! on commit and exactly one of them wins.

use crate::agent::{AgentRecord, FilterRegistry};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{ClaimInfo, JobId, JobRecord, JobStatus};
use crate::metrics::JobMetrics;
use crate::registration::DispatcherRegistration;
use crate::store::{StoreKeys, Transaction, TransactionExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "";

/// Active jobs allowed per quota name unless configured otherwise.
pub const DEFAULT_QUOTA_SIZE: usize = 1;

/// Queue-wide quota caps and the jobs currently holding each quota.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTable {
    /// Configured caps by quota name.
    #[serde(default)]
    pub caps: BTreeMap<String, usize>,
    /// Active holders by quota name.
    #[serde(default)]
    pub active: BTreeMap<String, BTreeSet<JobId>>,
}

impl QuotaTable {
    /// Cap for a quota name.
    pub fn cap(&self, name: &str) -> usize {
        self.caps.get(name).copied().unwrap_or(DEFAULT_QUOTA_SIZE)
    }

    /// Number of active holders of a quota name.
    pub fn held(&self, name: &str) -> usize {
        self.active.get(name).map_or(0, BTreeSet::len)
    }

    /// Returns true if every named quota is below its cap.
    pub fn has_capacity(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.held(n) < self.cap(n))
    }

    /// Records `job` as a holder of each quota.
    pub fn acquire(&mut self, names: &[String], job: &JobId) {
        for name in names {
            self.active.entry(name.clone()).or_default().insert(job.clone());
        }
    }

    /// Removes `job` from each quota.
    pub fn release(&mut self, names: &[String], job: &JobId) -> bool {
        let mut released = false;
        for name in names {
            if let Some(holders) = self.active.get_mut(name) {
                released |= holders.remove(job);
                if holders.is_empty() {
                    self.active.remove(name);
                }
            }
        }
        released
    }
}

/// Handle to one named queue in the store.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    keys: StoreKeys,
}

impl Queue {
    /// Creates a handle; the queue itself is created by [`Queue::create`].
    pub fn new(keys: StoreKeys, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of every queue under the root container.
    pub fn names(tx: &mut dyn Transaction, keys: &StoreKeys) -> DispatchResult<Vec<String>> {
        Ok(tx.load(&keys.queues())?.unwrap_or_default())
    }

    /// Adds a queue to the root container if missing.
    pub fn create(tx: &mut dyn Transaction, keys: &StoreKeys, name: &str) -> DispatchResult<Self> {
        let mut names = Self::names(tx, keys)?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            tx.save(&keys.queues(), &names)?;
            info!(queue = %name, "Queue created");
        }
        Ok(Self::new(keys.clone(), name))
    }

    /// Appends a pending job. Visible to dispatchers once `tx` commits.
    pub fn put(&self, tx: &mut dyn Transaction, mut job: JobRecord) -> DispatchResult<JobId> {
        if job.status != JobStatus::Pending {
            return Err(DispatchError::InvalidState {
                expected: JobStatus::Pending.to_string(),
                actual: job.status.to_string(),
            });
        }
        Self::create(tx, &self.keys, &self.name)?;

        job.queue = self.name.clone();
        let id = job.id.clone();
        tx.save(&self.keys.job(id.as_str()), &job)?;

        let mut pending = self.pending(tx)?;
        pending.push(id.clone());
        tx.save(&self.keys.pending(&self.name), &pending)?;

        JobMetrics::job_enqueued(&self.name, &job.call.callable);
        debug!(queue = %self.name, job_id = %id, call = %job.call, "Job enqueued");
        Ok(id)
    }

    /// Pending job ids in claim order.
    pub fn pending(&self, tx: &mut dyn Transaction) -> DispatchResult<Vec<JobId>> {
        Ok(tx.load(&self.keys.pending(&self.name))?.unwrap_or_default())
    }

    /// Number of pending jobs.
    pub fn len(&self, tx: &mut dyn Transaction) -> DispatchResult<usize> {
        Ok(self.pending(tx)?.len())
    }

    /// Quota table.
    pub fn quotas(&self, tx: &mut dyn Transaction) -> DispatchResult<QuotaTable> {
        Ok(tx.load(&self.keys.quotas(&self.name))?.unwrap_or_default())
    }

    /// Sets the cap for a quota name.
    pub fn set_quota(&self, tx: &mut dyn Transaction, name: &str, size: usize) -> DispatchResult<()> {
        let mut quotas = self.quotas(tx)?;
        if quotas.caps.get(name) == Some(&size) {
            return Ok(());
        }
        quotas.caps.insert(name.to_string(), size);
        tx.save(&self.keys.quotas(&self.name), &quotas)?;
        info!(queue = %self.name, quota = %name, size = size, "Quota configured");
        Ok(())
    }

    /// Loads one dispatcher registration.
    pub fn registration(
        &self,
        tx: &mut dyn Transaction,
        dispatcher: &Uuid,
    ) -> DispatchResult<Option<DispatcherRegistration>> {
        Ok(tx.load(&self.keys.registration(&self.name, dispatcher))?)
    }

    /// Stores a dispatcher registration.
    pub fn save_registration(
        &self,
        tx: &mut dyn Transaction,
        registration: &DispatcherRegistration,
    ) -> DispatchResult<()> {
        tx.save(&self.keys.registration(&self.name, &registration.uuid), registration)?;
        Ok(())
    }

    /// Every registration in the queue.
    pub fn registrations(&self, tx: &mut dyn Transaction) -> DispatchResult<Vec<DispatcherRegistration>> {
        Ok(tx
            .load_prefix(&self.keys.registrations(&self.name))?
            .into_iter()
            .map(|(_, reg)| reg)
            .collect())
    }

    /// Deletes a registration. Activated registrations are kept.
    pub fn remove_registration(&self, tx: &mut dyn Transaction, dispatcher: &Uuid) -> DispatchResult<bool> {
        let Some(mut registration) = self.registration(tx, dispatcher)? else {
            return Ok(false);
        };
        if registration.activated {
            return Err(DispatchError::InvalidState {
                expected: "deactivated registration".to_string(),
                actual: "activated registration".to_string(),
            });
        }
        if registration.active_count() > 0 {
            self.reclaim_held(tx, &mut registration, &HashSet::new())?;
        }
        tx.delete(&self.keys.registration(&self.name, dispatcher))?;
        info!(queue = %self.name, dispatcher_id = %dispatcher, "Registration removed");
        Ok(true)
    }

    /// Claims up to `limit` jobs for `agent`.
    ///
    /// Scans pending jobs in order and takes each one that is due, fits
    /// every quota cap and passes the agent's filter. Ineligible jobs keep
    /// their position. Finding nothing is not an error.
    #[allow(clippy::too_many_arguments)]
    pub fn claim(
        &self,
        tx: &mut dyn Transaction,
        agent: &mut AgentRecord,
        dispatcher: Uuid,
        poll_id: u64,
        filters: &FilterRegistry,
        now: DateTime<Utc>,
        limit: usize,
    ) -> DispatchResult<Vec<JobId>> {
        let limit = limit.min(agent.available());
        if limit == 0 {
            return Ok(Vec::new());
        }

        let pending = self.pending(tx)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut quotas = self.quotas(tx)?;
        let mut claimed = Vec::new();
        let mut remaining = Vec::with_capacity(pending.len());
        let mut dropped = false;

        for id in pending {
            if claimed.len() >= limit {
                remaining.push(id);
                continue;
            }

            let Some(mut job) = tx.load::<JobRecord>(&self.keys.job(id.as_str()))? else {
                warn!(queue = %self.name, job_id = %id, "Dropping pending id without a job record");
                dropped = true;
                continue;
            };
            if job.status != JobStatus::Pending {
                warn!(queue = %self.name, job_id = %id, status = %job.status, "Dropping non-pending job from pending list");
                dropped = true;
                continue;
            }

            if !job.is_due(now) || !quotas.has_capacity(&job.quota_names) || !agent.accepts(&job, filters) {
                remaining.push(id);
                continue;
            }

            job.claim(
                ClaimInfo {
                    dispatcher,
                    agent: agent.name.clone(),
                    poll_id,
                },
                now,
            )?;
            quotas.acquire(&job.quota_names, &id);
            agent.active.insert(id.clone());
            tx.save(&self.keys.job(id.as_str()), &job)?;
            claimed.push(id);
        }

        if !claimed.is_empty() || dropped {
            tx.save(&self.keys.pending(&self.name), &remaining)?;
        }
        if !claimed.is_empty() {
            tx.save(&self.keys.quotas(&self.name), &quotas)?;
            debug!(
                queue = %self.name,
                agent = %agent.name,
                claimed = claimed.len(),
                "Agent claimed jobs"
            );
        }

        Ok(claimed)
    }

    /// Returns jobs held by `registration` to the front of the queue,
    /// skipping ids in `keep`. Returns the reclaimed ids.
    pub fn reclaim_held(
        &self,
        tx: &mut dyn Transaction,
        registration: &mut DispatcherRegistration,
        keep: &HashSet<JobId>,
    ) -> DispatchResult<Vec<JobId>> {
        let mut quotas = self.quotas(tx)?;
        let mut reclaimed = Vec::new();
        let mut touched = false;

        for agent in registration.agents.values_mut() {
            let held: Vec<JobId> = agent.active.iter().filter(|id| !keep.contains(*id)).cloned().collect();
            for id in held {
                agent.active.remove(&id);
                touched = true;
                let key = self.keys.job(id.as_str());
                let Some(mut job) = tx.load::<JobRecord>(&key)? else {
                    continue;
                };
                quotas.release(&job.quota_names, &id);
                if job.is_claimed_by(&registration.uuid) {
                    job.reclaim()?;
                    tx.save(&key, &job)?;
                    reclaimed.push(id);
                }
            }
        }

        if !reclaimed.is_empty() {
            let mut front = reclaimed.clone();
            front.extend(self.pending(tx)?);
            tx.save(&self.keys.pending(&self.name), &front)?;
        }
        if touched {
            tx.save(&self.keys.quotas(&self.name), &quotas)?;
        }

        Ok(reclaimed)
    }

    /// Declares a registration dead and reclaims all of its jobs.
    pub fn reclaim_dead(
        &self,
        tx: &mut dyn Transaction,
        registration: &mut DispatcherRegistration,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<JobId>> {
        let reclaimed = self.reclaim_held(tx, registration, &HashSet::new())?;
        registration.deactivate(now);
        registration.dead = true;
        self.save_registration(tx, registration)?;

        for _ in &reclaimed {
            JobMetrics::job_reclaimed(&self.name);
        }
        warn!(
            queue = %self.name,
            dispatcher_id = %registration.uuid,
            last_ping = ?registration.last_ping,
            reclaimed = reclaimed.len(),
            "Dispatcher declared dead"
        );
        Ok(reclaimed)
    }

    /// Drops jobs from `registration`'s agents that it no longer owns,
    /// typically because they completed. Returns the dropped ids.
    pub fn prune_finished(
        &self,
        tx: &mut dyn Transaction,
        registration: &mut DispatcherRegistration,
    ) -> DispatchResult<Vec<JobId>> {
        let mut finished: Vec<(JobId, Vec<String>)> = Vec::new();
        for agent in registration.agents.values_mut() {
            let held: Vec<JobId> = agent.active.iter().cloned().collect();
            for id in held {
                let job = tx.load::<JobRecord>(&self.keys.job(id.as_str()))?;
                let still_ours = job.as_ref().is_some_and(|j| j.is_claimed_by(&registration.uuid));
                if !still_ours {
                    agent.active.remove(&id);
                    finished.push((id, job.map(|j| j.quota_names).unwrap_or_default()));
                }
            }
        }

        if finished.iter().any(|(_, quotas)| !quotas.is_empty()) {
            let mut quotas = self.quotas(tx)?;
            for (id, names) in &finished {
                quotas.release(names, id);
            }
            tx.save(&self.keys.quotas(&self.name), &quotas)?;
        }

        Ok(finished.into_iter().map(|(id, _)| id).collect())
    }

    /// Releases a completed job's agent slot and quota entries.
    pub fn release(
        &self,
        tx: &mut dyn Transaction,
        registration: &mut DispatcherRegistration,
        job_id: &JobId,
        quota_names: &[String],
    ) -> DispatchResult<bool> {
        let mut removed = false;
        for agent in registration.agents.values_mut() {
            removed |= agent.active.remove(job_id);
        }

        if !quota_names.is_empty() {
            let mut quotas = self.quotas(tx)?;
            if quotas.release(quota_names, job_id) {
                tx.save(&self.keys.quotas(&self.name), &quotas)?;
            }
        }

        Ok(removed)
    }
}
