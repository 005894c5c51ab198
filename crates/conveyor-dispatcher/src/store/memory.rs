//! In-memory snapshot-isolated store.

use super::{Store, Transaction};
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default connection pool allowance.
pub const DEFAULT_POOL_SIZE: usize = 7;

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    value: Value,
}

type Snapshot = Arc<BTreeMap<String, Entry>>;

struct Shared {
    data: RwLock<Snapshot>,
    /// Sequence number of the last commit.
    clock: AtomicU64,
    pool_size: AtomicIsize,
}

/// Multi-version in-memory store.
///
/// Every commit publishes a new immutable map; transactions hold the map
/// they started from. Commit validates that no key in the read or write
/// set, and no key under a scanned prefix, changed since the snapshot.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store with the default pool allowance.
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    /// Creates an empty store with the given pool allowance.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: RwLock::new(Arc::new(BTreeMap::new())),
                clock: AtomicU64::new(0),
                pool_size: AtomicIsize::new(isize::try_from(pool_size).unwrap_or(isize::MAX)),
            }),
        }
    }

    /// Number of committed writes so far.
    pub fn commit_count(&self) -> u64 {
        self.shared.clock.load(Ordering::Acquire)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Box<dyn Transaction> {
        // Snapshot and clock are read under the same lock as commit
        let data = self.shared.data.read();
        let seq = self.shared.clock.load(Ordering::Acquire);
        Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            snapshot: Arc::clone(&data),
            seq,
            reads: BTreeSet::new(),
            scans: Vec::new(),
            writes: BTreeMap::new(),
        })
    }

    fn pool_size(&self) -> usize {
        usize::try_from(self.shared.pool_size.load(Ordering::Acquire)).unwrap_or(0)
    }

    fn adjust_pool_size(&self, delta: isize) {
        let previous = self.shared.pool_size.fetch_add(delta, Ordering::AcqRel);
        trace!(previous = previous, delta = delta, "Pool allowance adjusted");
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    snapshot: Snapshot,
    seq: u64,
    reads: BTreeSet<String>,
    scans: Vec<String>,
    /// `None` marks a delete.
    writes: BTreeMap<String, Option<Value>>,
}

impl MemoryTransaction {
    fn first_conflict(&self, current: &BTreeMap<String, Entry>) -> Option<String> {
        let changed = |key: &String| {
            let then = self.snapshot.get(key).map(|e| e.version);
            let now = current.get(key).map(|e| e.version);
            then != now
        };

        if let Some(key) = self.reads.iter().chain(self.writes.keys()).find(|k| changed(k)) {
            return Some(key.clone());
        }

        // Keys inserted under a scanned prefix since the snapshot
        for prefix in &self.scans {
            let inserted = current
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .find(|(k, e)| e.version > self.seq && !self.reads.contains(*k));
            if let Some((key, _)) = inserted {
                return Some(key.clone());
            }
        }

        None
    }
}

impl Transaction for MemoryTransaction {
    fn get(&mut self, key: &str) -> StoreResult<Option<Value>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        self.reads.insert(key.to_string());
        Ok(self.snapshot.get(key).map(|e| e.value.clone()))
    }

    fn put(&mut self, key: &str, value: Value) -> StoreResult<()> {
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let mut merged: BTreeMap<String, Value> = self
            .snapshot
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();

        for key in merged.keys() {
            self.reads.insert(key.clone());
        }
        self.scans.push(prefix.to_string());

        for (key, write) in self
            .writes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match write {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut data = shared.data.write();

        if let Some(key) = self.first_conflict(&data) {
            trace!(key = %key, "Commit rejected");
            return Err(StoreError::Conflict { key });
        }

        let version = shared.clock.load(Ordering::Acquire) + 1;
        let map = Arc::make_mut(&mut data);
        for (key, write) in self.writes {
            match write {
                Some(value) => {
                    map.insert(key, Entry { version, value });
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        shared.clock.store(version, Ordering::Release);

        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TransactionExt;
    use serde_json::json;

    #[test]
    fn test_snapshot_isolation() {
        let store = MemoryStore::new();
        let mut writer = store.begin();
        writer.put("k", json!(1)).unwrap();
        writer.commit().unwrap();

        let mut reader = store.begin();

        let mut writer = store.begin();
        writer.put("k", json!(2)).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.get("k").unwrap(), Some(json!(1)));
        assert_eq!(store.begin().get("k").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_first_committer_wins() {
        let store = MemoryStore::new();
        let mut a = store.begin();
        let mut b = store.begin();

        a.get("pending").unwrap();
        b.get("pending").unwrap();
        a.put("pending", json!(["x"])).unwrap();
        b.put("pending", json!(["y"])).unwrap();

        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_stale_read_conflicts_even_without_overlapping_write() {
        let store = MemoryStore::new();
        let mut reader = store.begin();
        reader.get("a").unwrap();
        reader.put("b", json!(true)).unwrap();

        let mut writer = store.begin();
        writer.put("a", json!(1)).unwrap();
        writer.commit().unwrap();

        assert!(reader.commit().is_err());
    }

    #[test]
    fn test_disjoint_writes_both_commit() {
        let store = MemoryStore::new();
        let mut a = store.begin();
        let mut b = store.begin();
        a.put("job:1", json!(1)).unwrap();
        b.put("job:2", json!(2)).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_scan_sees_own_writes_and_deletes() {
        let store = MemoryStore::new();
        let mut setup = store.begin();
        setup.put("p:1", json!(1)).unwrap();
        setup.put("p:2", json!(2)).unwrap();
        setup.put("q:1", json!(9)).unwrap();
        setup.commit().unwrap();

        let mut tx = store.begin();
        tx.delete("p:1").unwrap();
        tx.put("p:3", json!(3)).unwrap();
        let keys: Vec<String> = tx.scan_prefix("p:").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["p:2".to_string(), "p:3".to_string()]);
    }

    #[test]
    fn test_insert_under_scanned_prefix_conflicts() {
        let store = MemoryStore::new();
        let mut scanner = store.begin();
        assert!(scanner.scan_prefix("reg:").unwrap().is_empty());
        scanner.put("summary", json!(0)).unwrap();

        let mut inserter = store.begin();
        inserter.put("reg:new", json!(1)).unwrap();
        inserter.commit().unwrap();

        assert!(scanner.commit().is_err());
    }

    #[test]
    fn test_read_only_commit_never_conflicts() {
        let store = MemoryStore::new();
        let mut reader = store.begin();
        reader.get("k").unwrap();

        let mut writer = store.begin();
        writer.put("k", json!(1)).unwrap();
        writer.commit().unwrap();

        assert!(reader.commit().is_ok());
    }

    #[test]
    fn test_abort_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin();
        tx.save("k", &5_u8).unwrap();
        tx.abort();
        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_pool_allowance() {
        let store = MemoryStore::with_pool_size(7);
        store.adjust_pool_size(4);
        assert_eq!(store.pool_size(), 11);
        store.adjust_pool_size(-4);
        assert_eq!(store.pool_size(), 7);
    }
}
