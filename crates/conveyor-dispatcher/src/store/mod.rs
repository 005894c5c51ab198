//! Durable store contract.
//!
//! The dispatcher persists every queue, registration, job and poll record
//! through snapshot-isolated transactions. A transaction sees the store as
//! of `begin()`; `commit()` fails with [`StoreError::Conflict`] when any key
//! it read or wrote was changed by another transaction in the meantime, so
//! the first committer wins and the loser retries.

mod memory;

pub use memory::{MemoryStore, DEFAULT_POOL_SIZE};

use crate::error::{StoreError, StoreResult};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A shared transactional key-value store.
pub trait Store: Send + Sync {
    /// Opens a transaction over a consistent snapshot.
    fn begin(&self) -> Box<dyn Transaction>;

    /// Current connection pool allowance.
    fn pool_size(&self) -> usize;

    /// Raises or lowers the connection pool allowance.
    fn adjust_pool_size(&self, delta: isize);
}

/// One snapshot-isolated unit of work.
pub trait Transaction: Send {
    /// Reads a value, seeing this transaction's own writes.
    fn get(&mut self, key: &str) -> StoreResult<Option<Value>>;

    /// Buffers a write.
    fn put(&mut self, key: &str, value: Value) -> StoreResult<()>;

    /// Buffers a delete.
    fn delete(&mut self, key: &str) -> StoreResult<()>;

    /// Returns every key under `prefix` in key order.
    fn scan_prefix(&mut self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Publishes buffered writes atomically.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards buffered writes.
    fn abort(self: Box<Self>);
}

/// Typed access on top of [`Transaction`].
pub trait TransactionExt {
    /// Reads and decodes a value.
    fn load<T: DeserializeOwned>(&mut self, key: &str) -> StoreResult<Option<T>>;

    /// Encodes and writes a value.
    fn save<T: Serialize>(&mut self, key: &str, value: &T) -> StoreResult<()>;

    /// Decodes every value under a prefix.
    fn load_prefix<T: DeserializeOwned>(&mut self, prefix: &str) -> StoreResult<Vec<(String, T)>>;
}

impl<X: Transaction + ?Sized> TransactionExt for X {
    fn load<T: DeserializeOwned>(&mut self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn save<T: Serialize>(&mut self, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.put(key, value)
    }

    fn load_prefix<T: DeserializeOwned>(&mut self, prefix: &str) -> StoreResult<Vec<(String, T)>> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value)
                    .map(|decoded| (key, decoded))
                    .map_err(StoreError::from)
            })
            .collect()
    }
}

/// Key builder for the persisted layout.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Root container listing queue names.
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Ordered pending job ids of a queue.
    pub fn pending(&self, queue: &str) -> String {
        format!("{}:queue:{}:pending", self.prefix, queue)
    }

    /// Quota caps and active quota holders of a queue.
    pub fn quotas(&self, queue: &str) -> String {
        format!("{}:queue:{}:quotas", self.prefix, queue)
    }

    /// One dispatcher registration inside a queue.
    pub fn registration(&self, queue: &str, dispatcher: &Uuid) -> String {
        format!("{}{}", self.registrations(queue), dispatcher)
    }

    /// Prefix covering every registration of a queue.
    pub fn registrations(&self, queue: &str) -> String {
        format!("{}:queue:{}:dispatcher:", self.prefix, queue)
    }

    /// Job record.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Annotations of a job, kept apart from the job record.
    pub fn annotations(&self, job_id: &str) -> String {
        format!("{}:job:{}:annotations", self.prefix, job_id)
    }

    /// Poll record; ids are zero padded so key order is id order.
    pub fn poll(&self, dispatcher: &Uuid, poll_id: u64) -> String {
        format!("{}{:020}", self.polls(dispatcher), poll_id)
    }

    /// Prefix covering every poll record of a dispatcher.
    pub fn polls(&self, dispatcher: &Uuid) -> String {
        format!("{}:dispatcher:{}:poll:", self.prefix, dispatcher)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("conveyor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = StoreKeys::default();
        let uuid = Uuid::nil();
        assert_eq!(keys.queues(), "conveyor:queues");
        assert_eq!(keys.pending(""), "conveyor:queue::pending");
        assert_eq!(keys.job("abc"), "conveyor:job:abc");
        assert_eq!(keys.annotations("abc"), "conveyor:job:abc:annotations");
        assert_eq!(
            keys.registration("reports", &uuid),
            "conveyor:queue:reports:dispatcher:00000000-0000-0000-0000-000000000000"
        );
        assert!(keys.registration("reports", &uuid).starts_with(&keys.registrations("reports")));
    }

    #[test]
    fn test_poll_keys_sort_by_id() {
        let keys = StoreKeys::new("test");
        let uuid = Uuid::new_v4();
        assert!(keys.poll(&uuid, 9) < keys.poll(&uuid, 10));
        assert!(keys.poll(&uuid, 10).starts_with(&keys.polls(&uuid)));
    }

    #[test]
    fn test_typed_round_trip_through_transaction() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.save("conveyor:queues", &vec!["a".to_string()]).unwrap();
        let names: Option<Vec<String>> = tx.load("conveyor:queues").unwrap();
        assert_eq!(names, Some(vec!["a".to_string()]));
        tx.commit().unwrap();
    }
}
