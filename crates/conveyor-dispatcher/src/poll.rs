//! Poll records and the per-dispatcher poll history.
//!
//! Every poll cycle leaves one record describing what each agent held and
//! claimed. Ids increase strictly and timestamps never go backwards, so the
//! history can be searched by either.

use crate::error::DispatchResult;
use crate::job::JobId;
use crate::store::{StoreKeys, Transaction, TransactionExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One agent's state at the end of a poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPoll {
    /// Agent size.
    pub size: usize,
    /// Jobs held after claiming.
    pub active: Vec<JobId>,
    /// Jobs claimed in this poll.
    pub new: Vec<JobId>,
}

/// One queue's state at the end of a poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePoll {
    /// Pending jobs left in the queue.
    pub len: Option<usize>,
    /// Error that aborted this queue's part of the cycle.
    pub error: Option<String>,
    /// Agents by name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentPoll>,
}

impl QueuePoll {
    /// A queue whose poll failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Durable summary of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    /// Poll id, strictly increasing per dispatcher.
    pub id: u64,
    /// When the cycle started.
    pub utc: DateTime<Utc>,
    /// Queues by name.
    #[serde(default)]
    pub queues: BTreeMap<String, QueuePoll>,
}

impl PollRecord {
    /// Creates an empty record.
    pub fn new(id: u64, utc: DateTime<Utc>) -> Self {
        Self {
            id,
            utc,
            queues: BTreeMap::new(),
        }
    }

    /// Jobs claimed in this cycle, across queues and agents.
    pub fn new_jobs(&self) -> impl Iterator<Item = &JobId> {
        self.queues
            .values()
            .flat_map(|q| q.agents.values())
            .flat_map(|a| a.new.iter())
    }

    /// Number of jobs claimed in this cycle.
    pub fn claimed_count(&self) -> usize {
        self.new_jobs().count()
    }

    /// Returns true if any queue failed.
    pub fn has_errors(&self) -> bool {
        self.queues.values().any(|q| q.error.is_some())
    }
}

/// A point in the poll history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKey {
    /// Poll id.
    Id(u64),
    /// Timestamp.
    Time(DateTime<Utc>),
}

impl PollKey {
    fn at_or_before(&self, record: &PollRecord) -> bool {
        match self {
            PollKey::Id(id) => record.id <= *id,
            PollKey::Time(t) => record.utc <= *t,
        }
    }

    fn before(&self, record: &PollRecord) -> bool {
        match self {
            PollKey::Id(id) => record.id < *id,
            PollKey::Time(t) => record.utc < *t,
        }
    }
}

/// Poll history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLookup {
    /// Most recent record.
    Latest,
    /// Nearest record at or preceding the key.
    At(PollKey),
    /// Nearest record strictly preceding the key.
    Before(PollKey),
}

/// Poll records of one dispatcher.
#[derive(Debug, Clone)]
pub struct PollHistory {
    keys: StoreKeys,
    dispatcher: Uuid,
}

impl PollHistory {
    /// Creates a history handle.
    pub fn new(keys: StoreKeys, dispatcher: Uuid) -> Self {
        Self { keys, dispatcher }
    }

    /// Stores a record.
    pub fn append(&self, tx: &mut dyn Transaction, record: &PollRecord) -> DispatchResult<()> {
        tx.save(&self.keys.poll(&self.dispatcher, record.id), record)?;
        Ok(())
    }

    /// Loads one record by id.
    pub fn get(&self, tx: &mut dyn Transaction, id: u64) -> DispatchResult<Option<PollRecord>> {
        Ok(tx.load(&self.keys.poll(&self.dispatcher, id))?)
    }

    /// Every retained record, oldest first.
    pub fn all(&self, tx: &mut dyn Transaction) -> DispatchResult<Vec<PollRecord>> {
        Ok(tx
            .load_prefix::<PollRecord>(&self.keys.polls(&self.dispatcher))?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Most recent record.
    pub fn latest(&self, tx: &mut dyn Transaction) -> DispatchResult<Option<PollRecord>> {
        Ok(self.all(tx)?.pop())
    }

    /// Resolves a lookup against the retained records.
    pub fn find(&self, tx: &mut dyn Transaction, lookup: PollLookup) -> DispatchResult<Option<PollRecord>> {
        let records = self.all(tx)?;
        let found = match lookup {
            PollLookup::Latest => records.into_iter().next_back(),
            PollLookup::At(key) => records.into_iter().rev().find(|r| key.at_or_before(r)),
            PollLookup::Before(key) => records.into_iter().rev().find(|r| key.before(r)),
        };
        Ok(found)
    }

    /// Deletes records older than `cutoff`, always keeping the newest one.
    /// Returns the number deleted.
    pub fn prune(&self, tx: &mut dyn Transaction, cutoff: DateTime<Utc>) -> DispatchResult<usize> {
        let records = self.all(tx)?;
        let keep_from = records.len().saturating_sub(1);
        let mut pruned = 0;
        for record in records.iter().take(keep_from).filter(|r| r.utc < cutoff) {
            tx.delete(&self.keys.poll(&self.dispatcher, record.id))?;
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};

    fn seeded(count: u64) -> (MemoryStore, PollHistory, DateTime<Utc>) {
        let store = MemoryStore::new();
        let history = PollHistory::new(StoreKeys::default(), Uuid::new_v4());
        let start = Utc::now() - chrono::Duration::minutes(30);

        let mut tx = store.begin();
        for id in 1..=count {
            let utc = start + chrono::Duration::minutes(id as i64);
            history.append(tx.as_mut(), &PollRecord::new(id, utc)).unwrap();
        }
        tx.commit().unwrap();
        (store, history, start)
    }

    #[test]
    fn test_records_are_ordered_by_id() {
        let (store, history, _) = seeded(12);
        let mut tx = store.begin();
        let ids: Vec<u64> = history.all(tx.as_mut()).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());
        assert_eq!(history.latest(tx.as_mut()).unwrap().unwrap().id, 12);
    }

    #[test]
    fn test_lookup_by_id() {
        let (store, history, _) = seeded(5);
        let mut tx = store.begin();

        let at = history.find(tx.as_mut(), PollLookup::At(PollKey::Id(3))).unwrap();
        assert_eq!(at.unwrap().id, 3);

        let before = history.find(tx.as_mut(), PollLookup::Before(PollKey::Id(3))).unwrap();
        assert_eq!(before.unwrap().id, 2);

        let at_missing = history.find(tx.as_mut(), PollLookup::At(PollKey::Id(99))).unwrap();
        assert_eq!(at_missing.unwrap().id, 5);

        assert!(history.find(tx.as_mut(), PollLookup::Before(PollKey::Id(1))).unwrap().is_none());
    }

    #[test]
    fn test_lookup_by_time() {
        let (store, history, start) = seeded(5);
        let mut tx = store.begin();

        let exact = start + chrono::Duration::minutes(2);
        let at = history.find(tx.as_mut(), PollLookup::At(PollKey::Time(exact))).unwrap();
        assert_eq!(at.unwrap().id, 2);

        let before = history.find(tx.as_mut(), PollLookup::Before(PollKey::Time(exact))).unwrap();
        assert_eq!(before.unwrap().id, 1);

        let between = start + chrono::Duration::seconds(150);
        let at = history.find(tx.as_mut(), PollLookup::At(PollKey::Time(between))).unwrap();
        assert_eq!(at.unwrap().id, 2);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (store, history, start) = seeded(5);
        let mut tx = store.begin();

        let pruned = history
            .prune(tx.as_mut(), start + chrono::Duration::seconds(210))
            .unwrap();
        assert_eq!(pruned, 3);
        let ids: Vec<u64> = history.all(tx.as_mut()).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 5]);

        let pruned = history.prune(tx.as_mut(), Utc::now()).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(history.latest(tx.as_mut()).unwrap().unwrap().id, 5);
    }

    #[test]
    fn test_new_jobs_across_agents() {
        let mut record = PollRecord::new(1, Utc::now());
        let mut queue = QueuePoll::default();
        queue.agents.insert(
            "main".into(),
            AgentPoll {
                size: 3,
                active: vec![JobId::from("a"), JobId::from("b")],
                new: vec![JobId::from("b")],
            },
        );
        record.queues.insert(String::new(), queue);
        record.queues.insert("broken".into(), QueuePoll::failed("store unavailable"));

        assert_eq!(record.claimed_count(), 1);
        assert!(record.has_errors());
    }
}
