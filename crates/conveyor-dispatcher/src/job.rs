//! Job records and the job status state machine.

use crate::error::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a queue.
    Pending,
    /// Claimed by an agent and executing.
    Active,
    /// Main call finished; follow-up callbacks are running.
    Callbacks,
    /// Result durably recorded.
    Completed,
}

impl JobStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Callbacks => "callbacks",
            JobStatus::Completed => "completed",
        }
    }

    /// Returns true while an agent owns the job.
    pub fn is_claimed(&self) -> bool {
        matches!(self, JobStatus::Active | JobStatus::Callbacks)
    }

    /// Forward transitions only; reclamation is separate.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Callbacks)
                | (JobStatus::Active, JobStatus::Completed)
                | (JobStatus::Callbacks, JobStatus::Completed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A call to a registered callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    /// Registered callable name.
    pub callable: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl CallSpec {
    /// Creates a call with no arguments.
    pub fn new(callable: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for CallSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        parts.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        write!(f, "{}({})", self.callable, parts.join(", "))
    }
}

/// A captured abnormal termination of a callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Condition kind, e.g. `TypeError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Trace text recorded with the result and logged.
    pub trace: String,
}

impl Failure {
    /// Creates a failure whose trace is just the kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let trace = format!("{}: {}", kind, message);
        Self {
            kind,
            message,
            trace,
        }
    }

    /// A call received arguments of the wrong type.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// A call received the right type with an unusable value.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// Prepends a frame line to the trace.
    pub fn with_frame(mut self, frame: impl fmt::Display) -> Self {
        self.trace = format!("  at {}\n{}", frame, self.trace);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal result of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "lowercase")]
pub enum JobOutcome {
    /// The call returned a value.
    Success(Value),
    /// The call failed.
    Failure(Failure),
}

impl JobOutcome {
    /// Returns true for a successful outcome.
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }

    /// Returns the successful value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            JobOutcome::Success(v) => Some(v),
            JobOutcome::Failure(_) => None,
        }
    }

    /// Returns the failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            JobOutcome::Success(_) => None,
            JobOutcome::Failure(f) => Some(f),
        }
    }
}

impl From<Result<Value, Failure>> for JobOutcome {
    fn from(result: Result<Value, Failure>) -> Self {
        match result {
            Ok(v) => JobOutcome::Success(v),
            Err(f) => JobOutcome::Failure(f),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success(v) => write!(f, "{}", v),
            JobOutcome::Failure(failure) => write!(f, "<Failure {}>", failure),
        }
    }
}

/// Which agent of which dispatcher owns a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimInfo {
    /// Claiming dispatcher.
    pub dispatcher: Uuid,
    /// Claiming agent.
    pub agent: String,
    /// Poll cycle that claimed the job.
    pub poll_id: u64,
}

/// Durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID.
    pub id: JobId,
    /// Owning queue name.
    pub queue: String,
    /// Main call.
    pub call: CallSpec,
    /// Calls run after a successful main call, each given the result first.
    #[serde(default)]
    pub callbacks: Vec<CallSpec>,
    /// Outcomes of the callbacks that have run.
    #[serde(default)]
    pub callback_results: Vec<JobOutcome>,
    /// Current status.
    pub status: JobStatus,
    /// Result of the main call once recorded.
    pub result: Option<JobOutcome>,
    /// Quota names; jobs sharing one are mutually exclusive queue-wide.
    #[serde(default)]
    pub quota_names: Vec<String>,
    /// Do not start before this time.
    pub begin_after: Option<DateTime<Utc>>,
    /// Current owner while claimed.
    pub claimed: Option<ClaimInfo>,
    /// When the job was created.
    pub enqueued_at: DateTime<Utc>,
    /// When the current claim began.
    pub active_start: Option<DateTime<Utc>>,
    /// When the result was recorded.
    pub active_end: Option<DateTime<Utc>>,
    /// Name of the thread that executed the job.
    pub thread: Option<String>,
    /// How many times the job was reclaimed from a dead dispatcher.
    #[serde(default)]
    pub reclaim_count: u32,
}

impl JobRecord {
    /// Creates a pending job.
    pub fn new(queue: impl Into<String>, call: CallSpec) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            call,
            callbacks: Vec::new(),
            callback_results: Vec::new(),
            status: JobStatus::Pending,
            result: None,
            quota_names: Vec::new(),
            begin_after: None,
            claimed: None,
            enqueued_at: Utc::now(),
            active_start: None,
            active_end: None,
            thread: None,
            reclaim_count: 0,
        }
    }

    /// Adds a quota name.
    pub fn with_quota(mut self, name: impl Into<String>) -> Self {
        self.quota_names.push(name.into());
        self
    }

    /// Adds a callback.
    pub fn with_callback(mut self, call: CallSpec) -> Self {
        self.callbacks.push(call);
        self
    }

    /// Delays the job.
    pub fn begin_after(mut self, at: DateTime<Utc>) -> Self {
        self.begin_after = Some(at);
        self
    }

    /// Returns true if the job may start at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.begin_after.map_or(true, |at| at <= now)
    }

    /// Returns true if the recorded result is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self.result, Some(JobOutcome::Failure(_)))
    }

    /// Returns true if `dispatcher` holds the current claim.
    pub fn is_claimed_by(&self, dispatcher: &Uuid) -> bool {
        self.status.is_claimed()
            && self
                .claimed
                .as_ref()
                .is_some_and(|c| &c.dispatcher == dispatcher)
    }

    /// Moves the job forward in the state machine.
    pub fn transition(&mut self, next: JobStatus) -> DispatchResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidState {
                expected: format!("a status that may become {}", next),
                actual: self.status.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks the job active under a claim.
    pub fn claim(&mut self, claim: ClaimInfo, now: DateTime<Utc>) -> DispatchResult<()> {
        self.transition(JobStatus::Active)?;
        self.claimed = Some(claim);
        self.active_start = Some(now);
        Ok(())
    }

    /// Returns a claimed job to pending, discarding partial results.
    pub fn reclaim(&mut self) -> DispatchResult<()> {
        if !self.status.is_claimed() {
            return Err(DispatchError::InvalidState {
                expected: "active or callbacks".to_string(),
                actual: self.status.to_string(),
            });
        }
        self.status = JobStatus::Pending;
        self.claimed = None;
        self.result = None;
        self.callback_results.clear();
        self.active_start = None;
        self.thread = None;
        self.reclaim_count += 1;
        Ok(())
    }
}
