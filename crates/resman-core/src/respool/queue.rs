//! Priority-FIFO gang queue.
//!
//! Gangs are ordered by priority descending, then enqueue order
//! ascending. Backed by an ordered map plus a gang-id index so removal
//! by id stays O(log n). The queue itself is not synchronized; the
//! owning pool guards it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use resman_api::{Error, Gang, Result, TaskDesc, TaskId};

/// Ordering key: higher priority first, earlier enqueue first within a
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueKey {
    priority: u32,
    seq: u64,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct GangQueue {
    name: String,
    /// Maximum number of queued gangs; `None` is unbounded.
    bound: Option<usize>,
    seq: u64,
    items: BTreeMap<QueueKey, Gang>,
    index: HashMap<TaskId, QueueKey>,
}

impl GangQueue {
    pub fn new(name: impl Into<String>, bound: Option<usize>) -> Self {
        Self {
            name: name.into(),
            bound,
            seq: 0,
            items: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, gang_id: &TaskId) -> bool {
        self.index.contains_key(gang_id)
    }

    pub fn enqueue(&mut self, gang: Gang) -> Result<()> {
        if let Some(bound) = self.bound {
            if self.items.len() >= bound {
                return Err(Error::QueueFull(self.name.clone()));
            }
        }
        let key = QueueKey {
            priority: gang.priority(),
            seq: self.seq,
        };
        self.seq += 1;
        self.index.insert(gang.id().clone(), key);
        self.items.insert(key, gang);
        Ok(())
    }

    /// Remove and return the highest-ordered gang.
    pub fn dequeue(&mut self) -> Option<Gang> {
        let key = *self.items.keys().next()?;
        let gang = self.items.remove(&key)?;
        self.index.remove(gang.id());
        Some(gang)
    }

    /// Non-destructive, stable view of the first `limit` gangs in
    /// dequeue order.
    pub fn peek(&self, limit: usize) -> Vec<&Gang> {
        self.items.values().take(limit).collect()
    }

    /// The gang that would be dequeued next.
    pub fn head(&self) -> Option<&Gang> {
        self.items.values().next()
    }

    pub fn remove(&mut self, gang_id: &TaskId) -> Option<Gang> {
        let key = self.index.remove(gang_id)?;
        self.items.remove(&key)
    }

    /// Remove a single member from a queued gang, dropping the gang
    /// entirely when it becomes empty. The gang keeps its queue
    /// position.
    pub fn remove_member(&mut self, gang_id: &TaskId, task_id: &TaskId) -> Option<TaskDesc> {
        let key = *self.index.get(gang_id)?;
        let gang = self.items.get_mut(&key)?;
        let pos = gang.tasks.iter().position(|t| &t.id == task_id)?;
        let removed = gang.tasks.remove(pos);
        if gang.tasks.is_empty() {
            self.items.remove(&key);
            self.index.remove(gang_id);
        }
        Some(removed)
    }
}
