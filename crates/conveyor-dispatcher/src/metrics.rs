//! Metrics for dispatcher monitoring.
//!
//! Recorded through the `metrics` facade; the host decides whether and
//! where to export them.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the dispatcher.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "conveyor_jobs_enqueued_total";
    /// Total jobs claimed by agents.
    pub const JOBS_CLAIMED_TOTAL: &str = "conveyor_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "conveyor_jobs_succeeded_total";
    /// Total jobs completed with a failure.
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    /// Total jobs returned to pending from dead dispatchers.
    pub const JOBS_RECLAIMED_TOTAL: &str = "conveyor_jobs_reclaimed_total";
    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "conveyor_job_duration_seconds";

    /// Jobs currently held by this process's agents.
    pub const AGENT_ACTIVE_JOBS: &str = "conveyor_agent_active_jobs";

    /// Total poll cycles.
    pub const POLLS_TOTAL: &str = "conveyor_polls_total";
    /// Total per-queue poll errors.
    pub const POLL_ERRORS_TOTAL: &str = "conveyor_poll_errors_total";
    /// Poll cycle duration in seconds.
    pub const POLL_DURATION_SECONDS: &str = "conveyor_poll_duration_seconds";
    /// Total dispatchers declared dead by this process.
    pub const DISPATCHERS_DEAD_TOTAL: &str = "conveyor_dispatchers_declared_dead_total";

    /// Total store commit conflicts.
    pub const STORE_CONFLICTS_TOTAL: &str = "conveyor_store_conflicts_total";
    /// Store connection pool allowance.
    pub const STORE_POOL_SIZE: &str = "conveyor_store_pool_size";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of jobs claimed by agents");
    describe_counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs completed with a failure"
    );
    describe_counter!(
        names::JOBS_RECLAIMED_TOTAL,
        "Total number of jobs reclaimed from dead dispatchers"
    );
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_gauge!(
        names::AGENT_ACTIVE_JOBS,
        "Number of jobs held by this process's agents"
    );

    describe_counter!(names::POLLS_TOTAL, "Total number of poll cycles");
    describe_counter!(
        names::POLL_ERRORS_TOTAL,
        "Total number of per-queue poll errors"
    );
    describe_histogram!(
        names::POLL_DURATION_SECONDS,
        "Poll cycle duration in seconds"
    );
    describe_counter!(
        names::DISPATCHERS_DEAD_TOTAL,
        "Total number of dispatchers declared dead"
    );

    describe_counter!(
        names::STORE_CONFLICTS_TOTAL,
        "Total number of store commit conflicts"
    );
    describe_gauge!(
        names::STORE_POOL_SIZE,
        "Store connection pool allowance"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, callable: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "callable" => callable.to_string()
        )
        .increment(1);
    }

    /// Record jobs claimed by an agent.
    pub fn jobs_claimed(queue: &str, agent: &str, count: usize) {
        counter!(
            names::JOBS_CLAIMED_TOTAL,
            "queue" => queue.to_string(),
            "agent" => agent.to_string()
        )
        .increment(count as u64);
    }

    /// Record a job succeeded.
    pub fn job_succeeded(queue: &str, callable: &str, duration: Duration) {
        counter!(
            names::JOBS_SUCCEEDED_TOTAL,
            "queue" => queue.to_string(),
            "callable" => callable.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "callable" => callable.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed.
    pub fn job_failed(queue: &str, callable: &str, kind: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "callable" => callable.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "callable" => callable.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job reclaimed from a dead dispatcher.
    pub fn job_reclaimed(queue: &str) {
        counter!(names::JOBS_RECLAIMED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Set the number of jobs held by this process.
    pub fn set_active(count: usize) {
        gauge!(names::AGENT_ACTIVE_JOBS).set(count as f64);
    }
}

/// Poll cycle metrics recorder.
#[derive(Clone)]
pub struct PollMetrics;

impl PollMetrics {
    /// Record a completed poll cycle.
    pub fn poll_completed(duration: Duration) {
        counter!(names::POLLS_TOTAL).increment(1);
        histogram!(names::POLL_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Record a per-queue poll error.
    pub fn poll_error(queue: &str) {
        counter!(names::POLL_ERRORS_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a dispatcher declared dead.
    pub fn dispatcher_dead(queue: &str) {
        counter!(names::DISPATCHERS_DEAD_TOTAL, "queue" => queue.to_string()).increment(1);
    }
}

/// Store metrics recorder.
#[derive(Clone)]
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a commit conflict.
    pub fn conflict() {
        counter!(names::STORE_CONFLICTS_TOTAL).increment(1);
    }

    /// Set the pool allowance.
    pub fn set_pool_size(size: usize) {
        gauge!(names::STORE_POOL_SIZE).set(size as f64);
    }
}
