//! Job annotations.
//!
//! Annotations are small JSON values attached to a job under its own key.
//! Live annotations are committed immediately in their own transaction so
//! other processes can see them while the job is still running.

use crate::error::{DispatchError, DispatchResult};
use crate::job::JobId;
use crate::retry::{transact, RetryPolicy};
use crate::store::{Store, StoreKeys, Transaction, TransactionExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default interval between reads while waiting for a live annotation.
pub const DEFAULT_ANNOTATION_POLL: Duration = Duration::from_millis(50);

/// Annotations of one job by key.
pub type Annotations = BTreeMap<String, Value>;

/// Reads every annotation of a job.
pub fn read_annotations(
    tx: &mut dyn Transaction,
    keys: &StoreKeys,
    job_id: &JobId,
) -> DispatchResult<Annotations> {
    Ok(tx.load(&keys.annotations(job_id.as_str()))?.unwrap_or_default())
}

/// Sets an annotation inside the caller's transaction.
pub fn set_annotation(
    tx: &mut dyn Transaction,
    keys: &StoreKeys,
    job_id: &JobId,
    key: &str,
    value: Value,
) -> DispatchResult<()> {
    let mut annotations = read_annotations(tx, keys, job_id)?;
    annotations.insert(key.to_string(), value);
    tx.save(&keys.annotations(job_id.as_str()), &annotations)?;
    Ok(())
}

/// Sets an annotation and commits it right away, retrying conflicts.
pub fn set_live(
    store: &dyn Store,
    keys: &StoreKeys,
    policy: &RetryPolicy,
    job_id: &JobId,
    key: &str,
    value: Value,
) -> DispatchResult<()> {
    transact(store, policy, |tx| set_annotation(tx, keys, job_id, key, value.clone()))?;
    debug!(job_id = %job_id, key = %key, "Live annotation set");
    Ok(())
}

/// Waits for an annotation to appear, re-reading through a fresh
/// transaction every `poll` until `timeout` elapses.
pub fn get_live(
    store: &dyn Store,
    keys: &StoreKeys,
    job_id: &JobId,
    key: &str,
    timeout: Duration,
    poll: Duration,
) -> DispatchResult<Value> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut tx = store.begin();
        let found = read_annotations(tx.as_mut(), keys, job_id);
        tx.abort();
        if let Some(value) = found?.remove(key) {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DispatchError::AnnotationTimeout {
                key: key.to_string(),
                timeout,
            });
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_set_live_is_visible_to_fresh_transactions() {
        let store = MemoryStore::new();
        let keys = StoreKeys::default();
        let job = JobId::from("j1");

        set_live(&store, &keys, &RetryPolicy::default(), &job, "progress", json!(0.5)).unwrap();

        let value = get_live(&store, &keys, &job, "progress", Duration::ZERO, DEFAULT_ANNOTATION_POLL).unwrap();
        assert_eq!(value, json!(0.5));
    }

    #[test]
    fn test_annotations_are_merged() {
        let store = MemoryStore::new();
        let keys = StoreKeys::default();
        let job = JobId::from("j1");
        let policy = RetryPolicy::default();

        set_live(&store, &keys, &policy, &job, "a", json!(1)).unwrap();
        set_live(&store, &keys, &policy, &job, "b", json!("two")).unwrap();

        let mut tx = store.begin();
        let all = read_annotations(tx.as_mut(), &keys, &job).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"], json!("two"));
    }

    #[test]
    fn test_get_live_times_out() {
        let store = MemoryStore::new();
        let started = Instant::now();
        let err = get_live(
            &store,
            &StoreKeys::default(),
            &JobId::from("j1"),
            "missing",
            Duration::from_millis(60),
            Duration::from_millis(10),
        )
        .unwrap_err();

        assert!(matches!(err, DispatchError::AnnotationTimeout { ref key, .. } if key == "missing"));
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_get_live_waits_for_writer() {
        let store = Arc::new(MemoryStore::new());
        let keys = StoreKeys::default();
        let job = JobId::from("j1");

        let writer_store = Arc::clone(&store);
        let writer_job = job.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            set_live(
                writer_store.as_ref(),
                &StoreKeys::default(),
                &RetryPolicy::default(),
                &writer_job,
                "ready",
                json!(true),
            )
            .unwrap();
        });

        let value = get_live(
            store.as_ref(),
            &keys,
            &job,
            "ready",
            Duration::from_secs(2),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(value, json!(true));
        writer.join().unwrap();
    }
}
