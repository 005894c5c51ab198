//! The dispatcher: activation, the poll cycle and introspection.
//!
//! A dispatcher registers itself in every queue, then polls on the reactor
//! thread. Each cycle pings its registrations, claims work for its agents,
//! declares silent peers dead and hands the claimed jobs to worker threads.

use crate::agent::{AgentRecord, FilterRegistry};
use crate::context::CallableRegistry;
use crate::error::{DispatchError, DispatchResult};
use crate::events::{DispatcherEvent, EventBus};
use crate::job::{JobId, JobRecord};
use crate::metrics::{JobMetrics, PollMetrics, StoreMetrics};
use crate::poll::{AgentPoll, PollHistory, PollLookup, PollRecord, QueuePoll};
use crate::queue::{Queue, DEFAULT_QUEUE};
use crate::reactor::Reactor;
use crate::registration::{DispatcherRegistration, DEFAULT_PING_DEATH_INTERVAL, DEFAULT_PING_INTERVAL};
use crate::retry::{transact, RetryPolicy};
use crate::status::{DispatcherStatus, JobInfo, Statistics, StatusInfo};
use crate::store::{Store, StoreKeys, Transaction, TransactionExt};
use crate::worker::JobRunner;
use chrono::{DateTime, Utc};
use conveyor_config::{AgentConfig, DispatcherConfig, QuotaConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default poll record retention.
pub const DEFAULT_POLL_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Resolved dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Stable dispatcher identity.
    pub uuid: Uuid,
    /// Queues created at activation.
    pub queues: Vec<String>,
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// Promised heartbeat interval.
    pub ping_interval: Duration,
    /// Heartbeat age at which peers declare this dispatcher dead.
    pub ping_death_interval: Duration,
    /// How long poll records are kept.
    pub poll_retention: Duration,
    /// Agents installed in registrations that have none.
    pub agents: Vec<AgentConfig>,
    /// Quota caps applied at activation.
    pub quotas: Vec<QuotaConfig>,
    /// Conflict retry policy.
    pub retry: RetryPolicy,
}

impl DispatcherSettings {
    /// Default settings for a dispatcher identity.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval: DEFAULT_POLL_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_death_interval: DEFAULT_PING_DEATH_INTERVAL,
            poll_retention: DEFAULT_POLL_RETENTION,
            agents: vec![AgentConfig::default()],
            quotas: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat and death intervals.
    pub fn with_ping_intervals(mut self, ping: Duration, death: Duration) -> Self {
        self.ping_interval = ping;
        self.ping_death_interval = death;
        self
    }

    /// Sets the poll record retention.
    pub fn with_poll_retention(mut self, retention: Duration) -> Self {
        self.poll_retention = retention;
        self
    }

    /// Adds a queue to create at activation.
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.queues.contains(&name) {
            self.queues.push(name);
        }
        self
    }

    /// Replaces the default agents.
    pub fn with_agents(mut self, agents: Vec<AgentConfig>) -> Self {
        self.agents = agents;
        self
    }

    /// Adds a quota cap.
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quotas.push(quota);
        self
    }

    /// Sets the conflict retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn validate(&self) -> DispatchResult<()> {
        if self.poll_interval.is_zero() {
            return Err(DispatchError::Configuration("poll interval must be positive".to_string()));
        }
        if self.ping_interval.as_millis() == 0 {
            return Err(DispatchError::Configuration(
                "ping interval must be at least one millisecond".to_string(),
            ));
        }
        if self.ping_death_interval.as_millis() <= self.ping_interval.as_millis() {
            return Err(DispatchError::Configuration(format!(
                "ping death interval {:?} must exceed ping interval {:?}",
                self.ping_death_interval, self.ping_interval
            )));
        }
        if let Some(agent) = self.agents.iter().find(|a| a.size == 0) {
            return Err(DispatchError::Configuration(format!(
                "agent '{}' must have a positive size",
                agent.name
            )));
        }
        Ok(())
    }
}

impl TryFrom<&DispatcherConfig> for DispatcherSettings {
    type Error = DispatchError;

    fn try_from(config: &DispatcherConfig) -> DispatchResult<Self> {
        let uuid = match &config.uuid {
            Some(raw) => Uuid::parse_str(raw).map_err(|e| {
                DispatchError::Configuration(format!("invalid dispatcher uuid '{}': {}", raw, e))
            })?,
            None => {
                let uuid = Uuid::new_v4();
                info!(dispatcher_id = %uuid, "No dispatcher UUID configured, generated one");
                uuid
            }
        };

        Ok(Self {
            uuid,
            queues: config.queues.clone(),
            poll_interval: config.poll_interval(),
            ping_interval: config.ping_interval(),
            ping_death_interval: config.ping_death_interval(),
            poll_retention: config.poll_retention(),
            agents: config.agents.clone(),
            quotas: config.quotas.clone(),
            retry: RetryPolicy::from(&config.commit_retry),
        })
    }
}

struct State {
    status: DispatcherStatus,
    activated_at: Option<Instant>,
    last_poll: Option<Instant>,
    last_poll_utc: Option<DateTime<Utc>>,
    next_poll_id: u64,
    /// Bumped on every activation and deactivation so stale timers expire.
    generation: u64,
    /// Pool allowance this dispatcher added to the store.
    pool_delta: isize,
    /// Jobs handed to worker threads and not yet released.
    running_jobs: HashSet<JobId>,
}

struct QueueOutcome {
    poll: QueuePoll,
    claimed: Vec<JobId>,
    /// Pool share of a registration created during this poll.
    registered: Option<usize>,
}

struct Inner {
    settings: DispatcherSettings,
    store: Arc<dyn Store>,
    reactor: Arc<dyn Reactor>,
    filters: Arc<FilterRegistry>,
    callables: Arc<CallableRegistry>,
    events: EventBus,
    keys: StoreKeys,
    polls: PollHistory,
    runner: JobRunner,
    state: Mutex<State>,
    /// Held for the duration of a poll cycle.
    poll_lock: Mutex<()>,
}

/// A job dispatcher. Cheap to clone; clones share one dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Dispatcher identity.
    pub fn uuid(&self) -> Uuid {
        self.inner.settings.uuid
    }

    /// Current lifecycle status.
    pub fn status(&self) -> DispatcherStatus {
        self.inner.state.lock().status
    }

    /// Resolved settings.
    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    /// Store key layout.
    pub fn keys(&self) -> &StoreKeys {
        &self.inner.keys
    }

    /// Callables available to jobs.
    pub fn callables(&self) -> &CallableRegistry {
        &self.inner.callables
    }

    /// Job filters available to agents.
    pub fn filters(&self) -> &FilterRegistry {
        &self.inner.filters
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribes to dispatcher events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.inner.events.subscribe()
    }

    /// Ties the dispatcher to its reactor: activates once the reactor runs
    /// and deactivates in a before-shutdown hook.
    pub fn start(&self) {
        let activating = self.clone();
        self.inner.reactor.when_running(Box::new(move || {
            if let Err(e) = activating.activate() {
                error!(dispatcher_id = %activating.uuid(), error = %e, "Dispatcher activation failed");
            }
        }));

        let deactivating = self.clone();
        self.inner.reactor.add_before_shutdown(Box::new(move || {
            if let Err(e) = deactivating.deactivate() {
                error!(dispatcher_id = %deactivating.uuid(), error = %e, "Dispatcher deactivation failed");
            }
        }));
    }

    /// Registers in every queue and starts polling. Idempotent.
    pub fn activate(&self) -> DispatchResult<()> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                DispatcherStatus::Running | DispatcherStatus::Starting => {
                    debug!(dispatcher_id = %self.uuid(), "Dispatcher already active");
                    return Ok(());
                }
                DispatcherStatus::Stopping => {
                    return Err(DispatchError::InvalidState {
                        expected: DispatcherStatus::Stopped.to_string(),
                        actual: DispatcherStatus::Stopping.to_string(),
                    });
                }
                DispatcherStatus::Stopped => state.status = DispatcherStatus::Starting,
            }
        }

        match self.inner.register() {
            Ok((queues, pool_share)) => {
                let latest = self
                    .inner
                    .read(|tx| self.inner.polls.latest(tx))
                    .unwrap_or_else(|e| {
                        warn!(dispatcher_id = %self.uuid(), error = %e, "Failed to read poll history");
                        None
                    });
                let generation = {
                    let mut state = self.inner.state.lock();
                    state.status = DispatcherStatus::Running;
                    state.activated_at = Some(Instant::now());
                    state.last_poll = None;
                    if let Some(latest) = latest {
                        state.next_poll_id = state.next_poll_id.max(latest.id + 1);
                        state.last_poll_utc = Some(latest.utc);
                    }
                    state.generation += 1;
                    state.generation
                };
                self.inner.adjust_pool(isize::try_from(pool_share).unwrap_or(isize::MAX));

                info!(
                    dispatcher_id = %self.uuid(),
                    queues = ?queues,
                    pool_size = self.inner.store.pool_size(),
                    poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
                    "Dispatcher activated"
                );
                self.inner.events.publish(DispatcherEvent::DispatcherActivated {
                    dispatcher: self.uuid(),
                    queues,
                });

                self.inner.schedule_poll(Duration::ZERO, generation);
                Ok(())
            }
            Err(e) => {
                self.inner.state.lock().status = DispatcherStatus::Stopped;
                error!(dispatcher_id = %self.uuid(), error = %e, "Dispatcher activation failed");
                Err(e)
            }
        }
    }

    /// Stops polling, waits for an in-flight cycle and marks every
    /// registration deactivated. Idempotent.
    pub fn deactivate(&self) -> DispatchResult<()> {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                DispatcherStatus::Stopped | DispatcherStatus::Stopping => {
                    debug!(dispatcher_id = %self.uuid(), "Dispatcher already inactive");
                    return Ok(());
                }
                DispatcherStatus::Starting => {
                    return Err(DispatchError::InvalidState {
                        expected: DispatcherStatus::Running.to_string(),
                        actual: DispatcherStatus::Starting.to_string(),
                    });
                }
                DispatcherStatus::Running => {
                    state.status = DispatcherStatus::Stopping;
                    state.generation += 1;
                }
            }
        }

        let _cycle = self.inner.poll_lock.lock();
        let result = self.inner.deregister();

        let (delta, running) = {
            let mut state = self.inner.state.lock();
            state.status = DispatcherStatus::Stopped;
            state.activated_at = None;
            state.last_poll = None;
            (std::mem::take(&mut state.pool_delta), state.running_jobs.len())
        };
        self.inner.store.adjust_pool_size(-delta);
        StoreMetrics::set_pool_size(self.inner.store.pool_size());

        info!(
            dispatcher_id = %self.uuid(),
            pool_size = self.inner.store.pool_size(),
            running_jobs = running,
            "Dispatcher deactivated"
        );
        self.inner.events.publish(DispatcherEvent::DispatcherDeactivated {
            dispatcher: self.uuid(),
        });
        result
    }

    /// Adds or resizes an agent in one queue's registration.
    pub fn register_agent(&self, queue: &str, config: AgentConfig) -> DispatchResult<()> {
        if config.size == 0 {
            return Err(DispatchError::Configuration(format!(
                "agent '{}' must have a positive size",
                config.name
            )));
        }

        let inner = &self.inner;
        let uuid = self.uuid();
        let running = self.status() == DispatcherStatus::Running;
        let delta = transact(inner.store.as_ref(), &inner.settings.retry, |tx| {
            let queue = Queue::create(tx, &inner.keys, queue)?;
            // A new registration brings its default agents into the pool too
            let (mut registration, previous_total) = match queue.registration(tx, &uuid)? {
                Some(registration) => {
                    let total = registration.total_size();
                    (registration, total)
                }
                None => {
                    let mut registration = inner.new_registration();
                    if running {
                        registration.activate(Utc::now());
                    }
                    (registration, 0)
                }
            };

            let mut agent = AgentRecord::from(&config);
            if let Some(existing) = registration.agents.get(&config.name) {
                agent.active = existing.active.clone();
            }
            registration.agents.insert(config.name.clone(), agent);
            queue.save_registration(tx, &registration)?;
            Ok(registration.total_size() as isize - previous_total as isize)
        })?;

        info!(dispatcher_id = %uuid, queue = %queue, agent = %config.name, size = config.size, "Agent registered");
        if self.status() == DispatcherStatus::Running {
            inner.adjust_pool(delta);
        }
        Ok(())
    }

    /// Removes an agent. Agents still holding jobs are kept.
    pub fn remove_agent(&self, queue: &str, name: &str) -> DispatchResult<()> {
        let inner = &self.inner;
        let uuid = self.uuid();
        let queue_handle = Queue::new(inner.keys.clone(), queue);
        let size = transact(inner.store.as_ref(), &inner.settings.retry, |tx| {
            let Some(mut registration) = queue_handle.registration(tx, &uuid)? else {
                return Err(DispatchError::NotFound(format!("registration in queue '{}'", queue)));
            };
            queue_handle.prune_finished(tx, &mut registration)?;

            let Some(agent) = registration.agents.get(name) else {
                return Err(DispatchError::NotFound(format!("agent '{}' in queue '{}'", name, queue)));
            };
            if !agent.active.is_empty() {
                return Err(DispatchError::AgentBusy {
                    agent: name.to_string(),
                    active: agent.active.len(),
                });
            }
            let size = agent.size;
            registration.agents.remove(name);
            queue_handle.save_registration(tx, &registration)?;
            Ok(size)
        })?;

        info!(dispatcher_id = %uuid, queue = %queue, agent = %name, "Agent removed");
        if self.status() == DispatcherStatus::Running {
            inner.adjust_pool(-(size as isize));
        }
        Ok(())
    }

    /// Status snapshot.
    pub fn status_info(&self) -> StatusInfo {
        let state = self.inner.state.lock();
        StatusInfo {
            status: state.status,
            poll_interval: self.inner.settings.poll_interval,
            uptime: state.activated_at.map(|t| t.elapsed()),
            time_since_last_poll: state.last_poll.map(|t| t.elapsed()),
        }
    }

    /// Statistics over the retained polls, or over the last `window` of them.
    pub fn statistics(&self, window: Option<Duration>) -> DispatchResult<Statistics> {
        let now = Utc::now();
        self.inner.read(|tx| {
            let mut polls = self.inner.polls.all(tx)?;
            if let Some(cutoff) = window.and_then(|w| cutoff(now, w)) {
                polls.retain(|p| p.utc >= cutoff);
            }
            Statistics::collect(tx, &self.inner.keys, &self.inner.settings.uuid, &polls, now)
        })
    }

    /// Looks up a poll record.
    pub fn poll_info(&self, lookup: PollLookup) -> DispatchResult<Option<PollRecord>> {
        self.inner.read(|tx| self.inner.polls.find(tx, lookup))
    }

    /// Reports on a job claimed in the given poll.
    pub fn job_info(&self, poll_id: u64, job_id: &JobId) -> DispatchResult<JobInfo> {
        self.inner.read(|tx| {
            let poll = self
                .inner
                .polls
                .get(tx, poll_id)?
                .ok_or_else(|| DispatchError::NotFound(format!("poll {}", poll_id)))?;
            if !poll.new_jobs().any(|id| id == job_id) {
                return Err(DispatchError::NotFound(format!("job {} in poll {}", job_id, poll_id)));
            }
            let job = tx
                .load::<JobRecord>(&self.inner.keys.job(job_id.as_str()))?
                .ok_or_else(|| DispatchError::NotFound(format!("job {}", job_id)))?;
            Ok(JobInfo::new(&job, poll_id))
        })
    }
}

impl Inner {
    /// Runs read-only work in a transaction that is never committed.
    fn read<T>(&self, work: impl FnOnce(&mut dyn Transaction) -> DispatchResult<T>) -> DispatchResult<T> {
        let mut tx = self.store.begin();
        let result = work(tx.as_mut());
        tx.abort();
        result
    }

    fn new_registration(&self) -> DispatcherRegistration {
        let mut registration = DispatcherRegistration::new(
            self.settings.uuid,
            self.settings.ping_interval,
            self.settings.ping_death_interval,
        );
        self.install_default_agents(&mut registration);
        registration
    }

    fn install_default_agents(&self, registration: &mut DispatcherRegistration) {
        for agent in &self.settings.agents {
            registration
                .agents
                .insert(agent.name.clone(), AgentRecord::from(agent));
        }
    }

    fn adjust_pool(&self, delta: isize) {
        if delta == 0 {
            return;
        }
        self.state.lock().pool_delta += delta;
        self.store.adjust_pool_size(delta);
        StoreMetrics::set_pool_size(self.store.pool_size());
    }

    /// Creates queues and quotas, then registers or reactivates in every
    /// queue. Returns the queue names and the pool share to add.
    fn register(&self) -> DispatchResult<(Vec<String>, usize)> {
        let uuid = self.settings.uuid;
        let names = transact(self.store.as_ref(), &self.settings.retry, |tx| {
            for name in &self.settings.queues {
                Queue::create(tx, &self.keys, name)?;
            }
            for quota in &self.settings.quotas {
                Queue::create(tx, &self.keys, &quota.queue)?.set_quota(tx, &quota.name, quota.size)?;
            }
            Queue::names(tx, &self.keys)
        })?;

        let keep = self.state.lock().running_jobs.clone();
        let mut pool_share = 1;

        for name in &names {
            let queue = Queue::new(self.keys.clone(), name.clone());
            let (first, reclaimed, size) = transact(self.store.as_ref(), &self.settings.retry, |tx| {
                let (mut registration, first) = match queue.registration(tx, &uuid)? {
                    Some(registration) => (registration, false),
                    None => (self.new_registration(), true),
                };

                let reclaimed = queue.reclaim_held(tx, &mut registration, &keep)?;
                if registration.agents.is_empty() {
                    self.install_default_agents(&mut registration);
                }
                registration.set_ping_intervals(self.settings.ping_interval, self.settings.ping_death_interval);
                registration.activate(Utc::now());
                queue.save_registration(tx, &registration)?;
                Ok((first, reclaimed, registration.total_size()))
            })?;

            if !reclaimed.is_empty() {
                for _ in &reclaimed {
                    JobMetrics::job_reclaimed(name);
                }
                warn!(
                    dispatcher_id = %uuid,
                    queue = %name,
                    reclaimed = reclaimed.len(),
                    "Reclaimed jobs left active by a previous run of this dispatcher"
                );
            }
            if first {
                info!(dispatcher_id = %uuid, queue = %name, "Dispatcher registered in queue");
                self.events.publish(DispatcherEvent::DispatcherRegistered {
                    dispatcher: uuid,
                    queue: name.clone(),
                });
            }
            pool_share += size;
        }

        Ok((names, pool_share))
    }

    /// Marks every registration of this dispatcher deactivated.
    fn deregister(&self) -> DispatchResult<()> {
        let uuid = self.settings.uuid;
        let names = self.read(|tx| Queue::names(tx, &self.keys))?;
        let mut first_error = None;

        for name in names {
            let queue = Queue::new(self.keys.clone(), name.clone());
            let result = transact(self.store.as_ref(), &self.settings.retry, |tx| {
                let Some(mut registration) = queue.registration(tx, &uuid)? else {
                    return Ok(());
                };
                if registration.activated {
                    registration.deactivate(Utc::now());
                    queue.save_registration(tx, &registration)?;
                }
                Ok(())
            });
            if let Err(e) = result {
                error!(dispatcher_id = %uuid, queue = %name, error = %e, "Failed to deactivate registration");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.status == DispatcherStatus::Running && state.generation == generation
    }

    fn schedule_poll(self: &Arc<Self>, delay: Duration, generation: u64) {
        let weak = Arc::downgrade(self);
        let scheduled = self.reactor.call_later(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_scheduled_poll(generation);
                }
            }),
        );
        if let Err(e) = scheduled {
            error!(dispatcher_id = %self.settings.uuid, error = %e, "Failed to schedule poll");
        }
    }

    fn run_scheduled_poll(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        let started = Instant::now();
        if let Err(e) = self.poll_cycle() {
            error!(dispatcher_id = %self.settings.uuid, error = %e, "Poll cycle failed");
        }
        PollMetrics::poll_completed(started.elapsed());

        if self.is_current(generation) {
            self.schedule_poll(self.settings.poll_interval, generation);
        }
    }

    fn poll_cycle(self: &Arc<Self>) -> DispatchResult<Option<PollRecord>> {
        let _cycle = self.poll_lock.lock();
        let (poll_id, utc) = {
            let mut state = self.state.lock();
            if state.status != DispatcherStatus::Running {
                return Ok(None);
            }
            let id = state.next_poll_id;
            state.next_poll_id += 1;
            let now = Utc::now();
            let utc = state.last_poll_utc.map_or(now, |last| last.max(now));
            state.last_poll_utc = Some(utc);
            (id, utc)
        };

        let uuid = self.settings.uuid;
        let names = self.read(|tx| Queue::names(tx, &self.keys))?;
        let mut record = PollRecord::new(poll_id, utc);
        let mut claimed: Vec<(JobId, String)> = Vec::new();
        let mut registered = 0;

        for name in names {
            let queue = Queue::new(self.keys.clone(), name.clone());
            match self.poll_queue(&queue, poll_id) {
                Ok(outcome) => {
                    for (agent, poll) in &outcome.poll.agents {
                        if !poll.new.is_empty() {
                            JobMetrics::jobs_claimed(&name, agent, poll.new.len());
                        }
                    }
                    if let Some(size) = outcome.registered {
                        registered += size;
                        info!(dispatcher_id = %uuid, queue = %name, "Dispatcher registered in queue");
                        self.events.publish(DispatcherEvent::DispatcherRegistered {
                            dispatcher: uuid,
                            queue: name.clone(),
                        });
                    }
                    claimed.extend(outcome.claimed.into_iter().map(|id| (id, name.clone())));
                    record.queues.insert(name.clone(), outcome.poll);
                }
                Err(e) => {
                    error!(dispatcher_id = %uuid, queue = %name, poll_id = poll_id, error = %e, "Poll failed for queue");
                    PollMetrics::poll_error(&name);
                    record.queues.insert(name.clone(), QueuePoll::failed(e.to_string()));
                }
            }

            if let Err(e) = self.detect_deaths(&queue) {
                error!(dispatcher_id = %uuid, queue = %name, error = %e, "Death detection failed for queue");
                PollMetrics::poll_error(&name);
            }
        }

        // Recorded before dispatch so every started job appears in the history
        let retention_cutoff = cutoff(utc, self.settings.poll_retention);
        let stored = transact(self.store.as_ref(), &self.settings.retry, |tx| {
            self.polls.append(tx, &record)?;
            if let Some(cutoff) = retention_cutoff {
                self.polls.prune(tx, cutoff)?;
            }
            Ok(())
        });
        if let Err(e) = stored {
            error!(dispatcher_id = %uuid, poll_id = poll_id, error = %e, "Failed to store poll record");
        }

        let active = {
            let mut state = self.state.lock();
            state.last_poll = Some(Instant::now());
            state.running_jobs.extend(claimed.iter().map(|(id, _)| id.clone()));
            state.running_jobs.len()
        };
        self.adjust_pool(isize::try_from(registered).unwrap_or(isize::MAX));
        JobMetrics::set_active(active);

        debug!(
            dispatcher_id = %uuid,
            poll_id = poll_id,
            queues = record.queues.len(),
            claimed = claimed.len(),
            active = active,
            "Poll cycle completed"
        );

        for (job_id, queue) in claimed {
            self.dispatch(job_id, queue);
        }

        Ok(Some(record))
    }

    /// Pings, prunes and claims for one queue in a single transaction.
    fn poll_queue(&self, queue: &Queue, poll_id: u64) -> DispatchResult<QueueOutcome> {
        let uuid = self.settings.uuid;
        transact(self.store.as_ref(), &self.settings.retry, |tx| {
            let now = Utc::now();
            let (mut registration, registered) = match queue.registration(tx, &uuid)? {
                Some(registration) => (registration, None),
                None => {
                    let registration = self.new_registration();
                    let size = registration.total_size();
                    (registration, Some(size))
                }
            };

            if registration.activated {
                registration.ping(now);
            } else {
                if registered.is_none() {
                    warn!(
                        dispatcher_id = %uuid,
                        queue = %queue.name(),
                        dead = registration.dead,
                        "Registration was deactivated by another process, reactivating"
                    );
                }
                registration.activate(now);
            }

            queue.prune_finished(tx, &mut registration)?;

            let mut poll = QueuePoll::default();
            let mut claimed = Vec::new();
            for agent in registration.agents.values_mut() {
                let limit = agent.available();
                let new = queue.claim(tx, agent, uuid, poll_id, &self.filters, now, limit)?;
                poll.agents.insert(
                    agent.name.clone(),
                    AgentPoll {
                        size: agent.size,
                        active: agent.active.iter().cloned().collect(),
                        new: new.clone(),
                    },
                );
                claimed.extend(new);
            }
            poll.len = Some(queue.len(tx)?);

            queue.save_registration(tx, &registration)?;
            Ok(QueueOutcome {
                poll,
                claimed,
                registered,
            })
        })
    }

    /// Declares peers dead whose heartbeat is too old and reclaims their jobs.
    fn detect_deaths(&self, queue: &Queue) -> DispatchResult<()> {
        let uuid = self.settings.uuid;
        let now = Utc::now();
        let candidates: Vec<Uuid> = self
            .read(|tx| queue.registrations(tx))?
            .into_iter()
            .filter(|r| r.uuid != uuid && r.is_dead(now))
            .map(|r| r.uuid)
            .collect();

        for dead in candidates {
            let reclaimed = transact(self.store.as_ref(), &self.settings.retry, |tx| {
                let Some(mut registration) = queue.registration(tx, &dead)? else {
                    return Ok(None);
                };
                let now = Utc::now();
                if !registration.is_dead(now) {
                    return Ok(None);
                }
                queue.reclaim_dead(tx, &mut registration, now).map(Some)
            })?;

            if let Some(reclaimed) = reclaimed {
                PollMetrics::dispatcher_dead(queue.name());
                self.events.publish(DispatcherEvent::DispatcherDied {
                    dispatcher: dead,
                    queue: queue.name().to_string(),
                    declared_by: uuid,
                    reclaimed,
                });
            }
        }
        Ok(())
    }

    /// Runs a claimed job on a worker thread, then releases its slot on the
    /// reactor thread.
    fn dispatch(self: &Arc<Self>, job_id: JobId, queue: String) {
        let inner = Arc::clone(self);
        let id = job_id.clone();
        let handed = self.reactor.call_in_thread(Box::new(move || {
            inner.runner.run(&id);

            let releaser = Arc::clone(&inner);
            let (release_id, release_queue) = (id.clone(), queue.clone());
            let scheduled = inner
                .reactor
                .call_from_thread(Box::new(move || releaser.release(&release_id, &release_queue)));
            if scheduled.is_err() {
                inner.release(&id, &queue);
            }
        }));

        if let Err(e) = handed {
            error!(dispatcher_id = %self.settings.uuid, job_id = %job_id, error = %e, "Failed to hand job to a worker thread");
            self.state.lock().running_jobs.remove(&job_id);
        }
    }

    /// Frees a finished job's agent slot and quota entries.
    fn release(&self, job_id: &JobId, queue_name: &str) {
        let uuid = self.settings.uuid;
        let queue = Queue::new(self.keys.clone(), queue_name);
        let result = transact(self.store.as_ref(), &self.settings.retry, |tx| {
            let Some(mut registration) = queue.registration(tx, &uuid)? else {
                return Ok(false);
            };
            let job = tx.load::<JobRecord>(&self.keys.job(job_id.as_str()))?;
            // Still ours means the result never committed; keep the slot
            if job.as_ref().is_some_and(|j| j.is_claimed_by(&uuid)) {
                return Ok(false);
            }
            let quota_names = job.map(|j| j.quota_names).unwrap_or_default();
            let released = queue.release(tx, &mut registration, job_id, &quota_names)?;
            if released {
                queue.save_registration(tx, &registration)?;
            }
            Ok(released)
        });

        let active = {
            let mut state = self.state.lock();
            state.running_jobs.remove(job_id);
            state.running_jobs.len()
        };
        JobMetrics::set_active(active);

        match result {
            Ok(released) => debug!(dispatcher_id = %uuid, job_id = %job_id, released = released, "Job slot released"),
            Err(e) => warn!(dispatcher_id = %uuid, job_id = %job_id, error = %e, "Failed to release job slot"),
        }
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    store: Option<Arc<dyn Store>>,
    reactor: Option<Arc<dyn Reactor>>,
    settings: Option<DispatcherSettings>,
    callables: Option<Arc<CallableRegistry>>,
    filters: Option<Arc<FilterRegistry>>,
    events: Option<EventBus>,
    keys: Option<StoreKeys>,
}

impl DispatcherBuilder {
    /// Sets the store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the reactor.
    pub fn reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Sets the settings.
    pub fn settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Shares a callable registry.
    pub fn callables(mut self, callables: Arc<CallableRegistry>) -> Self {
        self.callables = Some(callables);
        self
    }

    /// Shares a filter registry.
    pub fn filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Shares an event bus.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the store key layout.
    pub fn keys(mut self, keys: StoreKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Builds the dispatcher in the stopped state.
    pub fn build(self) -> DispatchResult<Dispatcher> {
        let store = self
            .store
            .ok_or_else(|| DispatchError::Configuration("a store is required".to_string()))?;
        let reactor = self
            .reactor
            .ok_or_else(|| DispatchError::Configuration("a reactor is required".to_string()))?;
        let settings = self
            .settings
            .unwrap_or_else(|| DispatcherSettings::new(Uuid::new_v4()));
        settings.validate()?;

        let callables = self.callables.unwrap_or_default();
        let filters = self.filters.unwrap_or_default();
        let events = self.events.unwrap_or_default();
        let keys = self.keys.unwrap_or_default();

        let runner = JobRunner::new(
            settings.uuid,
            Arc::clone(&store),
            keys.clone(),
            settings.retry.clone(),
            Arc::clone(&callables),
            events.clone(),
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                polls: PollHistory::new(keys.clone(), settings.uuid),
                settings,
                store,
                reactor,
                filters,
                callables,
                events,
                keys,
                runner,
                state: Mutex::new(State {
                    status: DispatcherStatus::Stopped,
                    activated_at: None,
                    last_poll: None,
                    last_poll_utc: None,
                    next_poll_id: 1,
                    generation: 0,
                    pool_delta: 0,
                    running_jobs: HashSet::new(),
                }),
                poll_lock: Mutex::new(()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{ReactorConfig, TokioReactor};
    use crate::store::MemoryStore;

    #[test]
    fn test_settings_from_config() {
        let mut config = DispatcherConfig::default();
        config.uuid = Some("8f14e45f-ceea-4e1b-9b6c-8d9a3c1f2b7a".to_string());
        config.poll_interval_secs = 2;

        let settings = DispatcherSettings::try_from(&config).unwrap();
        assert_eq!(settings.uuid.to_string(), "8f14e45f-ceea-4e1b-9b6c-8d9a3c1f2b7a");
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.queues, vec![String::new()]);
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn test_settings_reject_bad_uuid() {
        let mut config = DispatcherConfig::default();
        config.uuid = Some("not-a-uuid".to_string());
        assert!(matches!(
            DispatcherSettings::try_from(&config),
            Err(DispatchError::Configuration(_))
        ));
    }

    #[test]
    fn test_builder_requires_store_and_reactor() {
        assert!(Dispatcher::builder().build().is_err());

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(Dispatcher::builder().store(store).build().is_err());
    }

    #[test]
    fn test_builder_rejects_zero_poll_interval() {
        let reactor = Arc::new(TokioReactor::start(ReactorConfig::default()).unwrap());
        let result = Dispatcher::builder()
            .store(Arc::new(MemoryStore::new()))
            .reactor(reactor.clone())
            .settings(DispatcherSettings::new(Uuid::new_v4()).with_poll_interval(Duration::ZERO))
            .build();
        assert!(matches!(result, Err(DispatchError::Configuration(_))));
        reactor.stop().unwrap();
    }

    #[test]
    fn test_builder_rejects_bad_ping_intervals() {
        let reactor = Arc::new(TokioReactor::start(ReactorConfig::default()).unwrap());
        let build = |ping: Duration, death: Duration| {
            Dispatcher::builder()
                .store(Arc::new(MemoryStore::new()))
                .reactor(reactor.clone())
                .settings(DispatcherSettings::new(Uuid::new_v4()).with_ping_intervals(ping, death))
                .build()
        };

        assert!(matches!(
            build(Duration::ZERO, Duration::from_secs(1)),
            Err(DispatchError::Configuration(_))
        ));
        assert!(matches!(
            build(Duration::from_micros(100), Duration::from_secs(1)),
            Err(DispatchError::Configuration(_))
        ));
        assert!(matches!(
            build(Duration::from_millis(500), Duration::from_millis(500)),
            Err(DispatchError::Configuration(_))
        ));
        assert!(build(Duration::from_millis(200), Duration::from_millis(500)).is_ok());
        reactor.stop().unwrap();
    }

    #[test]
    fn test_new_dispatcher_is_stopped() {
        let reactor = Arc::new(TokioReactor::start(ReactorConfig::default()).unwrap());
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(MemoryStore::new()))
            .reactor(reactor.clone())
            .build()
            .unwrap();

        let info = dispatcher.status_info();
        assert_eq!(info.status, DispatcherStatus::Stopped);
        assert!(info.uptime.is_none());
        assert!(info.time_since_last_poll.is_none());
        assert!(dispatcher.deactivate().is_ok());
        reactor.stop().unwrap();
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();
        assert!(cutoff(now, Duration::MAX).is_none());
        assert_eq!(cutoff(now, Duration::from_secs(60)), Some(now - chrono::Duration::seconds(60)));
    }
}
