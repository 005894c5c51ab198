//! Producer and observer API over a store.

use crate::annotation::{self, Annotations};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{CallSpec, JobId, JobRecord, JobStatus};
use crate::queue::Queue;
use crate::registration::DispatcherRegistration;
use crate::retry::{transact, RetryPolicy};
use crate::store::{Store, StoreKeys, Transaction, TransactionExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Enqueues jobs and reads their state, each call in its own transaction.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn Store>,
    keys: StoreKeys,
    retry: RetryPolicy,
}

impl QueueClient {
    /// Creates a client with the default key layout and retry policy.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            keys: StoreKeys::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Uses a different key layout.
    pub fn with_keys(mut self, keys: StoreKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Uses a different conflict retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn read<T>(&self, work: impl FnOnce(&mut dyn Transaction) -> DispatchResult<T>) -> DispatchResult<T> {
        let mut tx = self.store.begin();
        let result = work(tx.as_mut());
        tx.abort();
        result
    }

    /// Enqueues a call in `queue` and commits.
    pub fn put(&self, queue: &str, call: CallSpec) -> DispatchResult<JobId> {
        self.put_job(JobRecord::new(queue, call))
    }

    /// Enqueues a prepared job in its own queue and commits.
    pub fn put_job(&self, job: JobRecord) -> DispatchResult<JobId> {
        let queue = Queue::new(self.keys.clone(), job.queue.clone());
        transact(self.store.as_ref(), &self.retry, |tx| queue.put(tx, job.clone()))
    }

    /// Creates a queue if missing.
    pub fn create_queue(&self, name: &str) -> DispatchResult<()> {
        transact(self.store.as_ref(), &self.retry, |tx| {
            Queue::create(tx, &self.keys, name).map(|_| ())
        })
    }

    /// Sets a queue-wide quota cap.
    pub fn set_quota(&self, queue: &str, name: &str, size: usize) -> DispatchResult<()> {
        transact(self.store.as_ref(), &self.retry, |tx| {
            Queue::create(tx, &self.keys, queue)?.set_quota(tx, name, size)
        })
    }

    /// Names of every queue.
    pub fn queues(&self) -> DispatchResult<Vec<String>> {
        self.read(|tx| Queue::names(tx, &self.keys))
    }

    /// Number of pending jobs in `queue`.
    pub fn queue_length(&self, queue: &str) -> DispatchResult<usize> {
        let queue = Queue::new(self.keys.clone(), queue);
        self.read(|tx| queue.len(tx))
    }

    /// Loads a job.
    pub fn job(&self, job_id: &JobId) -> DispatchResult<JobRecord> {
        self.read(|tx| {
            tx.load::<JobRecord>(&self.keys.job(job_id.as_str()))?
                .ok_or_else(|| DispatchError::NotFound(format!("job {}", job_id)))
        })
    }

    /// Polls until the job completes or `timeout` elapses.
    pub fn wait_for_completion(&self, job_id: &JobId, timeout: Duration, poll: Duration) -> DispatchResult<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.job(job_id)?;
            if job.status == JobStatus::Completed {
                debug!(job_id = %job_id, failed = job.is_failure(), "Job completed");
                return Ok(job);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DispatchError::CompletionTimeout {
                    job_id: job_id.to_string(),
                    timeout,
                });
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Every dispatcher registration in `queue`.
    pub fn registrations(&self, queue: &str) -> DispatchResult<Vec<DispatcherRegistration>> {
        let queue = Queue::new(self.keys.clone(), queue);
        self.read(|tx| queue.registrations(tx))
    }

    /// Deletes a deactivated registration, reclaiming anything it still holds.
    pub fn remove_registration(&self, queue: &str, dispatcher: &Uuid) -> DispatchResult<bool> {
        let queue = Queue::new(self.keys.clone(), queue);
        let removed = transact(self.store.as_ref(), &self.retry, |tx| queue.remove_registration(tx, dispatcher))?;
        if removed {
            info!(queue = %queue.name(), dispatcher_id = %dispatcher, "Registration removed by client");
        }
        Ok(removed)
    }

    /// Committed annotations of a job.
    pub fn annotations(&self, job_id: &JobId) -> DispatchResult<Annotations> {
        self.read(|tx| annotation::read_annotations(tx, &self.keys, job_id))
    }

    /// Sets an annotation on a job and commits.
    pub fn set_live_annotation(&self, job_id: &JobId, key: &str, value: Value) -> DispatchResult<()> {
        annotation::set_live(self.store.as_ref(), &self.keys, &self.retry, job_id, key, value)
    }

    /// Waits for an annotation set by the running job.
    pub fn get_live_annotation(
        &self,
        job_id: &JobId,
        key: &str,
        timeout: Duration,
        poll: Duration,
    ) -> DispatchResult<Value> {
        annotation::get_live(self.store.as_ref(), &self.keys, job_id, key, timeout, poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{DEFAULT_PING_DEATH_INTERVAL, DEFAULT_PING_INTERVAL};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn client() -> QueueClient {
        QueueClient::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_put_and_load() {
        let client = client();
        let id = client.put("reports", CallSpec::new("render").arg(3)).unwrap();

        let job = client.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.queue, "reports");
        assert_eq!(client.queue_length("reports").unwrap(), 1);
        assert_eq!(client.queues().unwrap(), vec!["reports".to_string()]);
    }

    #[test]
    fn test_missing_job() {
        let client = client();
        assert!(matches!(
            client.job(&JobId::from("nope")),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_wait_times_out_on_pending_job() {
        let client = client();
        let id = client.put("", CallSpec::new("noop")).unwrap();

        let err = client
            .wait_for_completion(&id, Duration::from_millis(30), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, DispatchError::CompletionTimeout { .. }));
    }

    #[test]
    fn test_live_annotations() {
        let client = client();
        let id = client.put("", CallSpec::new("noop")).unwrap();

        client.set_live_annotation(&id, "hello", json!("world")).unwrap();
        assert_eq!(client.annotations(&id).unwrap().get("hello"), Some(&json!("world")));
        assert_eq!(
            client
                .get_live_annotation(&id, "hello", Duration::ZERO, Duration::from_millis(5))
                .unwrap(),
            json!("world")
        );
    }

    #[test]
    fn test_remove_active_registration_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let client = QueueClient::new(store.clone());
        let keys = StoreKeys::default();
        let uuid = Uuid::new_v4();

        let mut registration = DispatcherRegistration::new(uuid, DEFAULT_PING_INTERVAL, DEFAULT_PING_DEATH_INTERVAL);
        registration.activate(chrono::Utc::now());
        let mut tx = store.begin();
        Queue::create(tx.as_mut(), &keys, "").unwrap();
        Queue::new(keys.clone(), "")
            .save_registration(tx.as_mut(), &registration)
            .unwrap();
        tx.commit().unwrap();

        assert!(client.remove_registration("", &uuid).is_err());

        registration.deactivate(chrono::Utc::now());
        let mut tx = store.begin();
        Queue::new(keys, "").save_registration(tx.as_mut(), &registration).unwrap();
        tx.commit().unwrap();

        assert!(client.remove_registration("", &uuid).unwrap());
        assert!(client.registrations("").unwrap().is_empty());
    }
}
