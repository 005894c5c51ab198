//! Job execution on worker threads.
//!
//! A run binds the job to a fresh transaction, invokes its callable and
//! commits the result together with everything the callable wrote. When
//! that commit conflicts the whole call runs again.

use crate::context::{CallArgs, CallableRegistry, JobContext};
use crate::error::{DispatchError, DispatchResult};
use crate::events::{DispatcherEvent, EventBus};
use crate::job::{Failure, JobId, JobOutcome, JobRecord, JobStatus};
use crate::metrics::{JobMetrics, StoreMetrics};
use crate::retry::{transact, RetryPolicy};
use crate::store::{Store, StoreKeys, TransactionExt};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum Step {
    /// The job is gone or no longer ours.
    Abandoned,
    /// The main call committed and callbacks remain.
    Callbacks,
    /// The result is durably recorded.
    Completed(Box<JobRecord>),
}

/// Executes claimed jobs for one dispatcher.
#[derive(Clone)]
pub struct JobRunner {
    dispatcher: Uuid,
    store: Arc<dyn Store>,
    keys: StoreKeys,
    retry: RetryPolicy,
    callables: Arc<CallableRegistry>,
    events: EventBus,
}

impl JobRunner {
    /// Creates a runner.
    pub fn new(
        dispatcher: Uuid,
        store: Arc<dyn Store>,
        keys: StoreKeys,
        retry: RetryPolicy,
        callables: Arc<CallableRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            dispatcher,
            store,
            keys,
            retry,
            callables,
            events,
        }
    }

    /// Runs a claimed job to completion.
    ///
    /// Returns the recorded outcome, or `None` when the job was abandoned
    /// because it no longer belongs to this dispatcher.
    pub fn run(&self, job_id: &JobId) -> Option<JobOutcome> {
        let started = Instant::now();
        let thread = std::thread::current().name().map(ToString::to_string);
        let mut announced = false;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(job_id, thread.as_deref(), &mut announced) {
                Ok(Step::Abandoned) => {
                    debug!(job_id = %job_id, "Job no longer claimed by this dispatcher, abandoning");
                    return None;
                }
                Ok(Step::Callbacks) => {
                    attempts = 0;
                }
                Ok(Step::Completed(job)) => {
                    let job = *job;
                    self.finish(&job, started);
                    return job.result;
                }
                Err(e) if e.is_retryable() => {
                    StoreMetrics::conflict();
                    if !self.retry.should_retry(attempts) {
                        warn!(job_id = %job_id, attempts = attempts, "Job result commit kept conflicting");
                        let failure = Failure::from(DispatchError::ConflictRetriesExhausted { attempts });
                        return self.record_failure(job_id, failure, thread.as_deref(), started);
                    }
                    let delay = self.retry.delay_for_attempt(attempts);
                    debug!(job_id = %job_id, attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying job after commit conflict");
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job execution hit a store error");
                    return self.record_failure(job_id, Failure::from(e), thread.as_deref(), started);
                }
            }
        }
    }

    fn attempt(&self, job_id: &JobId, thread: Option<&str>, announced: &mut bool) -> DispatchResult<Step> {
        let key = self.keys.job(job_id.as_str());
        let mut tx = self.store.begin();
        let job = match tx.load::<JobRecord>(&key) {
            Ok(job) => job,
            Err(e) => {
                tx.abort();
                return Err(e.into());
            }
        };
        let Some(mut job) = job.filter(|job| job.is_claimed_by(&self.dispatcher)) else {
            tx.abort();
            return Ok(Step::Abandoned);
        };

        if !*announced {
            *announced = true;
            debug!(job_id = %job_id, queue = %job.queue, call = %job.call, "Job started");
            self.events.publish(DispatcherEvent::JobStarted {
                job_id: job_id.clone(),
                queue: job.queue.clone(),
                dispatcher: self.dispatcher,
            });
        }

        let mut ctx = JobContext::new(
            job_id.clone(),
            job.queue.clone(),
            tx,
            Arc::clone(&self.store),
            self.keys.clone(),
            self.retry.clone(),
        );

        match job.status {
            JobStatus::Active => {
                let args = CallArgs::from(&job.call);
                let result = self
                    .callables
                    .invoke(&job.call.callable, &mut ctx, &args)
                    .map_err(|failure| failure.with_frame(&job.call));
                let mut tx = ctx.into_transaction();

                let succeeded = result.is_ok();
                job.result = Some(result.into());
                job.thread = thread.map(ToString::to_string);

                if succeeded && !job.callbacks.is_empty() {
                    job.transition(JobStatus::Callbacks)?;
                    tx.save(&key, &job)?;
                    tx.commit()?;
                    debug!(job_id = %job_id, callbacks = job.callbacks.len(), "Running job callbacks");
                    return Ok(Step::Callbacks);
                }

                job.transition(JobStatus::Completed)?;
                job.active_end = Some(Utc::now());
                tx.save(&key, &job)?;
                tx.commit()?;
                Ok(Step::Completed(Box::new(job)))
            }
            JobStatus::Callbacks => {
                let value = job
                    .result
                    .as_ref()
                    .and_then(JobOutcome::value)
                    .cloned()
                    .unwrap_or(Value::Null);

                let mut outcomes = Vec::with_capacity(job.callbacks.len());
                for callback in &job.callbacks {
                    let args = CallArgs::from(callback).with_leading(value.clone());
                    let outcome = self
                        .callables
                        .invoke(&callback.callable, &mut ctx, &args)
                        .map_err(|failure| failure.with_frame(callback));
                    if let Err(failure) = &outcome {
                        error!(
                            job_id = %job_id,
                            callback = %callback,
                            kind = %failure.kind,
                            trace = %failure.trace,
                            "Job callback failed"
                        );
                    }
                    outcomes.push(JobOutcome::from(outcome));
                }
                let mut tx = ctx.into_transaction();

                job.callback_results = outcomes;
                job.transition(JobStatus::Completed)?;
                job.active_end = Some(Utc::now());
                tx.save(&key, &job)?;
                tx.commit()?;
                Ok(Step::Completed(Box::new(job)))
            }
            JobStatus::Pending | JobStatus::Completed => {
                ctx.into_transaction().abort();
                Ok(Step::Abandoned)
            }
        }
    }

    /// Records a failure without running the callable again.
    fn record_failure(
        &self,
        job_id: &JobId,
        failure: Failure,
        thread: Option<&str>,
        started: Instant,
    ) -> Option<JobOutcome> {
        let key = self.keys.job(job_id.as_str());
        let recorded = transact(self.store.as_ref(), &self.retry, |tx| {
            let Some(mut job) = tx.load::<JobRecord>(&key)? else {
                return Ok(None);
            };
            if !job.is_claimed_by(&self.dispatcher) {
                return Ok(None);
            }
            job.result = Some(JobOutcome::Failure(failure.clone()));
            job.thread = thread.map(ToString::to_string);
            job.transition(JobStatus::Completed)?;
            job.active_end = Some(Utc::now());
            tx.save(&key, &job)?;
            Ok(Some(job))
        });

        match recorded {
            Ok(Some(job)) => {
                self.finish(&job, started);
                job.result
            }
            Ok(None) => None,
            Err(e) => {
                error!(job_id = %job_id, error = %e, failure = %failure, "Failed to record job failure");
                None
            }
        }
    }

    fn finish(&self, job: &JobRecord, started: Instant) {
        let duration = started.elapsed();
        match &job.result {
            Some(JobOutcome::Success(value)) => {
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    call = %job.call,
                    result = %value,
                    duration_ms = duration.as_millis() as u64,
                    "Job succeeded"
                );
                JobMetrics::job_succeeded(&job.queue, &job.call.callable, duration);
                self.events.publish(DispatcherEvent::JobSucceeded {
                    job_id: job.id.clone(),
                    queue: job.queue.clone(),
                    result: value.clone(),
                });
            }
            Some(JobOutcome::Failure(failure)) => {
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    call = %job.call,
                    kind = %failure.kind,
                    trace = %failure.trace,
                    duration_ms = duration.as_millis() as u64,
                    "Job failed"
                );
                JobMetrics::job_failed(&job.queue, &job.call.callable, &failure.kind, duration);
                self.events.publish(DispatcherEvent::JobFailed {
                    job_id: job.id.clone(),
                    queue: job.queue.clone(),
                    failure: failure.clone(),
                });
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRecord, FilterRegistry};
    use crate::job::CallSpec;
    use crate::queue::Queue;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryStore>,
        runner: JobRunner,
        events: EventBus,
        queue: Queue,
        dispatcher: Uuid,
    }

    fn harness(callables: CallableRegistry) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let dispatcher = Uuid::new_v4();
        let runner = JobRunner::new(
            dispatcher,
            store.clone(),
            StoreKeys::default(),
            RetryPolicy::fixed(3, 0),
            Arc::new(callables),
            events.clone(),
        );
        Harness {
            store,
            runner,
            events,
            queue: Queue::new(StoreKeys::default(), ""),
            dispatcher,
        }
    }

    fn enqueue_and_claim(h: &Harness, job: JobRecord) -> JobId {
        let mut tx = h.store.begin();
        let id = h.queue.put(tx.as_mut(), job).unwrap();
        let mut agent = AgentRecord::new("main", 1);
        h.queue
            .claim(tx.as_mut(), &mut agent, h.dispatcher, 1, &FilterRegistry::new(), Utc::now(), 1)
            .unwrap();
        tx.commit().unwrap();
        id
    }

    fn load(h: &Harness, id: &JobId) -> JobRecord {
        let mut tx = h.store.begin();
        tx.load(&StoreKeys::default().job(id.as_str())).unwrap().unwrap()
    }

    fn arithmetic() -> CallableRegistry {
        let callables = CallableRegistry::new();
        callables.register("mul", |_: &mut JobContext, args: &CallArgs| {
            Ok(json!(args.i64(0)? * args.i64(1)?))
        });
        callables.register("add", |_: &mut JobContext, args: &CallArgs| {
            Ok(json!(args.i64(0)? + args.i64(1)?))
        });
        callables
    }

    #[test]
    fn test_success_is_recorded() {
        let h = harness(arithmetic());
        let mut rx = h.events.subscribe();
        let id = enqueue_and_claim(&h, JobRecord::new("", CallSpec::new("mul").arg(14).arg(3)));

        let outcome = h.runner.run(&id).unwrap();
        assert_eq!(outcome, JobOutcome::Success(json!(42)));

        let job = load(&h, &id);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.active_end.is_some());

        assert_eq!(rx.try_recv().unwrap().name(), "job_started");
        assert_eq!(rx.try_recv().unwrap().name(), "job_succeeded");
    }

    #[test]
    fn test_type_error_is_recorded_as_failure() {
        let h = harness(arithmetic());
        let mut rx = h.events.subscribe();
        let id = enqueue_and_claim(&h, JobRecord::new("", CallSpec::new("mul").arg(14).arg(Value::Null)));

        let outcome = h.runner.run(&id).unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, "TypeError");
        assert!(failure.trace.contains("mul(14, null)"));

        let job = load(&h, &id);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.is_failure());

        rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), DispatcherEvent::JobFailed { .. }));
    }

    #[test]
    fn test_callbacks_receive_result() {
        let h = harness(arithmetic());
        let id = enqueue_and_claim(
            &h,
            JobRecord::new("", CallSpec::new("mul").arg(6).arg(7)).with_callback(CallSpec::new("add").arg(1)),
        );

        h.runner.run(&id).unwrap();
        let job = load(&h, &id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(JobOutcome::Success(json!(42))));
        assert_eq!(job.callback_results, vec![JobOutcome::Success(json!(43))]);
    }

    #[test]
    fn test_job_claimed_elsewhere_is_abandoned() {
        let h = harness(arithmetic());
        let mut tx = h.store.begin();
        let id = h
            .queue
            .put(tx.as_mut(), JobRecord::new("", CallSpec::new("mul").arg(1).arg(1)))
            .unwrap();
        let mut agent = AgentRecord::new("main", 1);
        h.queue
            .claim(tx.as_mut(), &mut agent, Uuid::new_v4(), 1, &FilterRegistry::new(), Utc::now(), 1)
            .unwrap();
        tx.commit().unwrap();

        assert!(h.runner.run(&id).is_none());
        assert_eq!(load(&h, &id).status, JobStatus::Active);
        assert!(h.runner.run(&JobId::from("missing")).is_none());
    }

    #[test]
    fn test_conflicting_commits_exhaust_retries() {
        let store_slot: Arc<parking_lot::Mutex<Option<Arc<MemoryStore>>>> = Arc::default();
        let callables = CallableRegistry::new();
        let slot = Arc::clone(&store_slot);
        callables.register("contended", move |ctx: &mut JobContext, _: &CallArgs| {
            // Read a key, then let another writer change it before we commit
            let _: Option<i64> = ctx.transaction().load("hot").map_err(DispatchError::from)?;
            if let Some(store) = slot.lock().as_ref() {
                let mut other = store.begin();
                other.save("hot", &Utc::now().timestamp_micros()).map_err(DispatchError::from)?;
                other.commit().map_err(DispatchError::from)?;
            }
            Ok(json!("done"))
        });

        let h = harness(callables);
        *store_slot.lock() = Some(h.store.clone());
        let id = enqueue_and_claim(&h, JobRecord::new("", CallSpec::new("contended")));

        let outcome = h.runner.run(&id).unwrap();
        assert_eq!(outcome.failure().unwrap().kind, "ConflictRetriesExhausted");
        assert_eq!(load(&h, &id).status, JobStatus::Completed);
    }
}
