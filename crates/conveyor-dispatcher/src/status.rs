//! Introspection reports.

use crate::error::DispatchResult;
use crate::job::{CallSpec, JobId, JobOutcome, JobRecord, JobStatus};
use crate::poll::PollRecord;
use crate::store::{StoreKeys, Transaction, TransactionExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Dispatcher lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherStatus {
    /// Activation in progress.
    Starting,
    /// Polling.
    Running,
    /// Deactivation in progress.
    Stopping,
    /// Not polling.
    Stopped,
}

impl DispatcherStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherStatus::Starting => "starting",
            DispatcherStatus::Running => "running",
            DispatcherStatus::Stopping => "stopping",
            DispatcherStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DispatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatcher status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Lifecycle status.
    pub status: DispatcherStatus,
    /// Configured poll interval.
    pub poll_interval: Duration,
    /// Time since activation while running.
    pub uptime: Option<Duration>,
    /// Time since the last completed poll cycle.
    pub time_since_last_poll: Option<Duration>,
}

/// Duration of one job, with the poll that claimed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTiming {
    /// Job ID.
    pub job_id: JobId,
    /// Claiming poll id.
    pub poll_id: u64,
    /// Run time so far, or total run time once completed.
    pub duration: Duration,
}

/// Aggregate counts over a window of poll records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Jobs claimed in the window.
    pub started: usize,
    /// Completed with a success.
    pub successful: usize,
    /// Completed with a failure.
    pub failed: usize,
    /// Still running under this dispatcher.
    pub active: usize,
    /// Missing, reclaimed or owned by someone else.
    pub unknown: usize,
    /// Longest running active job.
    pub longest_active: Option<JobTiming>,
    /// Shortest running active job.
    pub shortest_active: Option<JobTiming>,
    /// Longest failed job.
    pub longest_failed: Option<JobTiming>,
    /// Shortest failed job.
    pub shortest_failed: Option<JobTiming>,
    /// Longest successful job.
    pub longest_successful: Option<JobTiming>,
    /// Shortest successful job.
    pub shortest_successful: Option<JobTiming>,
    /// Oldest poll in the window.
    pub start: Option<DateTime<Utc>>,
    /// Newest poll in the window.
    pub end: Option<DateTime<Utc>>,
}

impl Statistics {
    /// Walks the jobs claimed in `polls` and classifies each one.
    pub fn collect(
        tx: &mut dyn Transaction,
        keys: &StoreKeys,
        dispatcher: &Uuid,
        polls: &[PollRecord],
        now: DateTime<Utc>,
    ) -> DispatchResult<Self> {
        let mut stats = Statistics {
            start: polls.first().map(|p| p.utc),
            end: polls.last().map(|p| p.utc),
            ..Statistics::default()
        };
        let mut seen = HashSet::new();

        for poll in polls {
            for job_id in poll.new_jobs() {
                if !seen.insert(job_id.clone()) {
                    continue;
                }
                stats.started += 1;

                let Some(job) = tx.load::<JobRecord>(&keys.job(job_id.as_str()))? else {
                    stats.unknown += 1;
                    continue;
                };
                let poll_id = job.claimed.as_ref().map_or(poll.id, |c| c.poll_id);
                let timing = |end: DateTime<Utc>| JobTiming {
                    job_id: job_id.clone(),
                    poll_id,
                    duration: job
                        .active_start
                        .and_then(|start| (end - start).to_std().ok())
                        .unwrap_or_default(),
                };

                match (&job.status, &job.result) {
                    (JobStatus::Completed, Some(JobOutcome::Failure(_))) => {
                        stats.failed += 1;
                        let t = timing(job.active_end.unwrap_or(now));
                        track(&mut stats.longest_failed, &mut stats.shortest_failed, t);
                    }
                    (JobStatus::Completed, _) => {
                        stats.successful += 1;
                        let t = timing(job.active_end.unwrap_or(now));
                        track(&mut stats.longest_successful, &mut stats.shortest_successful, t);
                    }
                    (JobStatus::Active | JobStatus::Callbacks, _) if job.is_claimed_by(dispatcher) => {
                        stats.active += 1;
                        let t = timing(now);
                        track(&mut stats.longest_active, &mut stats.shortest_active, t);
                    }
                    _ => stats.unknown += 1,
                }
            }
        }

        Ok(stats)
    }
}

fn track(longest: &mut Option<JobTiming>, shortest: &mut Option<JobTiming>, timing: JobTiming) {
    if longest.as_ref().map_or(true, |l| timing.duration > l.duration) {
        *longest = Some(timing.clone());
    }
    if shortest.as_ref().map_or(true, |s| timing.duration < s.duration) {
        *shortest = Some(timing);
    }
}

/// Report on one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID.
    pub job_id: JobId,
    /// Poll that claimed the job.
    pub poll_id: u64,
    /// Main call.
    pub call: CallSpec,
    /// Queue name.
    pub queue: String,
    /// Current status.
    pub status: JobStatus,
    /// When the current claim began.
    pub started: Option<DateTime<Utc>>,
    /// When the result was recorded.
    pub completed: Option<DateTime<Utc>>,
    /// Executing thread.
    pub thread: Option<String>,
    /// Display form of the result.
    pub result: Option<String>,
    /// Returns true if the result is a failure.
    pub failed: bool,
    /// Quota names.
    pub quota_names: Vec<String>,
    /// Times reclaimed from dead dispatchers.
    pub reclaim_count: u32,
}

impl JobInfo {
    /// Builds a report from a job record.
    pub fn new(job: &JobRecord, poll_id: u64) -> Self {
        Self {
            job_id: job.id.clone(),
            poll_id,
            call: job.call.clone(),
            queue: job.queue.clone(),
            status: job.status,
            started: job.active_start,
            completed: job.active_end,
            thread: job.thread.clone(),
            result: job.result.as_ref().map(ToString::to_string),
            failed: job.is_failure(),
            quota_names: job.quota_names.clone(),
            reclaim_count: job.reclaim_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ClaimInfo, Failure};
    use crate::poll::{AgentPoll, QueuePoll};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn claimed(dispatcher: Uuid, start: DateTime<Utc>) -> JobRecord {
        let mut job = JobRecord::new("", CallSpec::new("noop"));
        job.claim(
            ClaimInfo {
                dispatcher,
                agent: "main".into(),
                poll_id: 1,
            },
            start,
        )
        .unwrap();
        job
    }

    fn completed(dispatcher: Uuid, start: DateTime<Utc>, secs: i64, outcome: JobOutcome) -> JobRecord {
        let mut job = claimed(dispatcher, start);
        job.result = Some(outcome);
        job.transition(JobStatus::Completed).unwrap();
        job.active_end = Some(start + chrono::Duration::seconds(secs));
        job
    }

    #[test]
    fn test_statistics_classification() {
        let store = MemoryStore::new();
        let keys = StoreKeys::default();
        let me = Uuid::new_v4();
        let start = Utc::now() - chrono::Duration::minutes(1);

        let jobs = vec![
            completed(me, start, 1, JobOutcome::Success(json!(1))),
            completed(me, start, 5, JobOutcome::Success(json!(2))),
            completed(me, start, 2, JobOutcome::Failure(Failure::type_error("bad"))),
            claimed(me, start),
            claimed(Uuid::new_v4(), start),
        ];

        let mut tx = store.begin();
        for job in &jobs {
            tx.save(&keys.job(job.id.as_str()), job).unwrap();
        }
        let mut ids: Vec<JobId> = jobs.iter().map(|j| j.id.clone()).collect();
        ids.push(JobId::from("vanished"));

        let mut poll = PollRecord::new(1, start);
        let mut queue = QueuePoll::default();
        queue.agents.insert(
            "main".into(),
            AgentPoll {
                size: 10,
                active: ids.clone(),
                new: ids,
            },
        );
        poll.queues.insert(String::new(), queue);

        let stats = Statistics::collect(tx.as_mut(), &keys, &me, &[poll], Utc::now()).unwrap();
        assert_eq!(stats.started, 6);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.unknown, 2);
        assert_eq!(stats.longest_successful.unwrap().duration, Duration::from_secs(5));
        assert_eq!(stats.shortest_successful.unwrap().duration, Duration::from_secs(1));
        assert_eq!(stats.start, Some(start));
    }

    #[test]
    fn test_job_info() {
        let job = completed(Uuid::new_v4(), Utc::now(), 3, JobOutcome::Success(json!(42)));
        let info = JobInfo::new(&job, 7);
        assert_eq!(info.poll_id, 7);
        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.result.as_deref(), Some("42"));
        assert!(!info.failed);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DispatcherStatus::Stopped.to_string(), "stopped");
    }
}
