//! A resource-pool node.
//!
//! Each pool owns four pending sub-queues (selected by a gang's
//! preemption class), a ready queue of admitted gangs, and the
//! allocation/entitlement bookkeeping the scheduler admits against. All
//! queue and allocation state sits behind one mutex; allocation changes
//! propagate to ancestors through [`super::Tree`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use resman_api::{Error, Gang, Resources, ResourcePoolConfig, Result, SchedulingPolicy, TaskId};

use super::queue::GangQueue;

/// Which sub-queue a gang lives in. Admission walks the pending classes
/// in the declared order so low-priority classes cannot starve
/// guaranteed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueue {
    NonPreemptible,
    Controller,
    Pending,
    Revocable,
    Ready,
}

impl SubQueue {
    /// Admission order over the pending classes.
    pub const ADMISSION_ORDER: [SubQueue; 4] = [
        SubQueue::NonPreemptible,
        SubQueue::Controller,
        SubQueue::Pending,
        SubQueue::Revocable,
    ];
}

impl fmt::Display for SubQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NonPreemptible => "non_preemptible",
            Self::Controller => "controller",
            Self::Pending => "pending",
            Self::Revocable => "revocable",
            Self::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// A gang pulled out of a pending sub-queue by the scheduler, not yet
/// pushed to the ready queue.
#[derive(Debug)]
pub struct AdmittedGang {
    pub gang: Gang,
    pub demand: Resources,
}

#[derive(Debug)]
struct PoolState {
    non_preemptible: GangQueue,
    controller: GangQueue,
    pending: GangQueue,
    revocable: GangQueue,
    ready: GangQueue,
    /// Member task id -> (queue holding the gang, gang id).
    gang_index: HashMap<TaskId, (SubQueue, TaskId)>,
    allocation: Resources,
    entitlement: Resources,
}

impl PoolState {
    fn queue_mut(&mut self, which: SubQueue) -> &mut GangQueue {
        match which {
            SubQueue::NonPreemptible => &mut self.non_preemptible,
            SubQueue::Controller => &mut self.controller,
            SubQueue::Pending => &mut self.pending,
            SubQueue::Revocable => &mut self.revocable,
            SubQueue::Ready => &mut self.ready,
        }
    }

    fn queue(&self, which: SubQueue) -> &GangQueue {
        match which {
            SubQueue::NonPreemptible => &self.non_preemptible,
            SubQueue::Controller => &self.controller,
            SubQueue::Pending => &self.pending,
            SubQueue::Revocable => &self.revocable,
            SubQueue::Ready => &self.ready,
        }
    }

    fn index_gang(&mut self, gang: &Gang, which: SubQueue) {
        let gang_id = gang.id().clone();
        for task in &gang.tasks {
            self.gang_index
                .insert(task.id.clone(), (which, gang_id.clone()));
        }
    }

    fn unindex_gang(&mut self, gang: &Gang) {
        for task in &gang.tasks {
            self.gang_index.remove(&task.id);
        }
    }
}

pub struct ResourcePool {
    id: String,
    parent: Option<String>,
    reservation: Resources,
    limit: Resources,
    share: f64,
    policy: SchedulingPolicy,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(config: &ResourcePoolConfig, queue_bound: usize) -> Self {
        let queue = |class: &str| {
            GangQueue::new(format!("{}/{}", config.name, class), Some(queue_bound))
        };
        Self {
            id: config.name.clone(),
            parent: config.parent.clone(),
            reservation: config.reservation,
            limit: config.limit,
            share: config.share,
            policy: config.policy,
            state: Mutex::new(PoolState {
                non_preemptible: queue("non_preemptible"),
                controller: queue("controller"),
                pending: queue("pending"),
                revocable: queue("revocable"),
                ready: GangQueue::new(format!("{}/ready", config.name), None),
                gang_index: HashMap::new(),
                allocation: Resources::ZERO,
                entitlement: Resources::ZERO,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn reservation(&self) -> Resources {
        self.reservation
    }

    pub fn limit(&self) -> Resources {
        self.limit
    }

    pub fn share(&self) -> f64 {
        self.share
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Sub-queue a gang belongs in, from the class flags of its first
    /// member (all members share them).
    pub fn classify(gang: &Gang) -> SubQueue {
        let first = &gang.tasks[0];
        if first.controller {
            SubQueue::Controller
        } else if first.revocable {
            SubQueue::Revocable
        } else if !first.preemptible {
            SubQueue::NonPreemptible
        } else {
            SubQueue::Pending
        }
    }

    /// Insert a gang into its pending sub-queue.
    pub fn enqueue_gang(&self, gang: Gang) -> Result<()> {
        if gang.tasks.is_empty() {
            return Err(Error::Internal("empty gang".to_owned()));
        }
        let which = Self::classify(&gang);
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.queue_mut(which).enqueue(gang.clone())?;
        state.index_gang(&gang, which);
        Ok(())
    }

    /// Pull the next admissible gang off the pending classes, in class
    /// order, without pushing it to the ready queue. The caller
    /// transitions its tasks and then calls [`Self::push_ready`].
    pub fn admit_next(&self) -> Option<AdmittedGang> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let available = state.entitlement.saturating_sub(&state.allocation);
        for which in SubQueue::ADMISSION_ORDER {
            let fits = state
                .queue(which)
                .head()
                .map(|gang| gang.resources().fits_in(&available))
                .unwrap_or(false);
            if !fits {
                continue;
            }
            let gang = state
                .queue_mut(which)
                .dequeue()
                .expect("head checked above");
            let demand = gang.resources();
            state.unindex_gang(&gang);
            return Some(AdmittedGang { gang, demand });
        }
        None
    }

    /// Push an admitted gang onto the ready queue.
    pub fn push_ready(&self, gang: Gang) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.index_gang(&gang, SubQueue::Ready);
        state
            .ready
            .enqueue(gang)
            .expect("ready queue is unbounded");
    }

    /// Dequeue up to `max` gangs from the ready queue.
    pub fn dequeue_ready(&self, max: usize) -> Vec<Gang> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let mut out = Vec::new();
        while out.len() < max {
            match state.ready.dequeue() {
                Some(gang) => {
                    state.unindex_gang(&gang);
                    out.push(gang);
                }
                None => break,
            }
        }
        out
    }

    /// Re-insert a gang into its pending sub-queue (placement retries
    /// exhausted; allocation has already been released by the caller).
    pub fn requeue_pending(&self, gang: Gang) -> Result<()> {
        self.enqueue_gang(gang)
    }

    /// Remove one task from whichever queue its gang sits in. Returns
    /// the sub-queue it was found in, or `None` when the task is not
    /// queued here.
    pub fn remove_task(&self, task_id: &TaskId) -> Option<SubQueue> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let (which, gang_id) = state.gang_index.remove(task_id)?;
        state.queue_mut(which).remove_member(&gang_id, task_id);
        Some(which)
    }

    /// Stable snapshot of pending gangs per sub-queue, as member id
    /// lists, up to `limit` gangs per queue.
    pub fn pending_snapshot(&self, limit: usize) -> Vec<(String, Vec<Vec<TaskId>>)> {
        let state = self.state.lock().expect("pool lock poisoned");
        let mut out = Vec::new();
        for which in SubQueue::ADMISSION_ORDER {
            let gangs = state
                .queue(which)
                .peek(limit)
                .into_iter()
                .map(|gang| gang.tasks.iter().map(|t| t.id.clone()).collect())
                .collect();
            out.push((which.to_string(), gangs));
        }
        out
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").ready.len()
    }

    pub fn allocation(&self) -> Resources {
        self.state.lock().expect("pool lock poisoned").allocation
    }

    pub fn entitlement(&self) -> Resources {
        self.state.lock().expect("pool lock poisoned").entitlement
    }

    /// Set the non-slack entitlement. Pushed down by the entitlement
    /// calculator, which is external to the manager.
    pub fn set_entitlement(&self, entitlement: Resources) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.entitlement = entitlement;
    }

    pub(crate) fn add_allocation(&self, delta: Resources) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.allocation += delta;
    }

    pub(crate) fn release_allocation(&self, delta: Resources) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.allocation = state.allocation.saturating_sub(&delta);
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use resman_api::AttemptId;
    use resman_api::TaskDesc;

    use super::*;

    fn config(name: &str) -> ResourcePoolConfig {
        ResourcePoolConfig {
            name: name.to_owned(),
            parent: Some("root".to_owned()),
            reservation: Resources::new(10.0, 100.0, 100.0, 0.0),
            limit: Resources::new(100.0, 1000.0, 1000.0, 4.0),
            share: 1.0,
            policy: SchedulingPolicy::PriorityFifo,
        }
    }

    fn gang(job: &str, priority: u32, members: u32, cpu: f64) -> Gang {
        let tasks = (0..members)
            .map(|i| TaskDesc {
                id: TaskId::new(job, i),
                attempt_id: AttemptId::from(format!("{job}-{i}-0").as_str()),
                name: format!("{job}-{i}"),
                resources: Resources::new(cpu, 10.0, 1.0, 0.0),
                priority,
                preemptible: true,
                controller: false,
                revocable: false,
                min_instances: members,
                placement_timeout_seconds: 60,
                placement_retry_limit: 3,
            })
            .collect();
        Gang::new(tasks)
    }

    #[test]
    fn test_gang_admission_is_atomic() {
        let pool = ResourcePool::new(&config("p"), 100);
        pool.set_entitlement(Resources::new(1.0, 100.0, 100.0, 0.0));
        pool.enqueue_gang(gang("g", 0, 2, 1.0)).unwrap();

        // Two tasks of 1 cpu each cannot fit a 1-cpu entitlement.
        assert!(pool.admit_next().is_none());

        // Raising the entitlement admits both members together.
        pool.set_entitlement(Resources::new(2.0, 100.0, 100.0, 0.0));
        let admitted = pool.admit_next().expect("gang should fit now");
        assert_eq!(admitted.gang.tasks.len(), 2);
        assert_eq!(admitted.demand.cpu, 2.0);
    }

    #[test]
    fn test_admission_class_order() {
        let pool = ResourcePool::new(&config("p"), 100);
        pool.set_entitlement(Resources::new(10.0, 1000.0, 1000.0, 0.0));

        let mut revocable = gang("rev", 9, 1, 1.0);
        revocable.tasks[0].revocable = true;
        let mut non_preemptible = gang("np", 0, 1, 1.0);
        non_preemptible.tasks[0].preemptible = false;
        let batch = gang("batch", 5, 1, 1.0);

        pool.enqueue_gang(revocable).unwrap();
        pool.enqueue_gang(batch).unwrap();
        pool.enqueue_gang(non_preemptible).unwrap();

        // Non-preemptible admits first despite its lower priority.
        let order: Vec<String> = std::iter::from_fn(|| pool.admit_next())
            .map(|a| a.gang.id().job_id.clone())
            .collect();
        assert_eq!(order, vec!["np", "batch", "rev"]);
    }

    #[test]
    fn test_remove_task_from_pending_gang() {
        let pool = ResourcePool::new(&config("p"), 100);
        pool.enqueue_gang(gang("g", 0, 2, 1.0)).unwrap();

        let which = pool
            .remove_task(&TaskId::new("g", 1))
            .expect("task is queued");
        assert_eq!(which, SubQueue::Pending);
        assert!(pool.remove_task(&TaskId::new("g", 1)).is_none());

        // Remaining member is still queued.
        pool.set_entitlement(Resources::new(10.0, 1000.0, 1000.0, 0.0));
        let admitted = pool.admit_next().expect("remaining member admits");
        assert_eq!(admitted.gang.tasks.len(), 1);
    }

    #[test]
    fn test_ready_round_trip() {
        let pool = ResourcePool::new(&config("p"), 100);
        pool.push_ready(gang("g", 0, 1, 1.0));
        assert_eq!(pool.ready_len(), 1);
        let out = pool.dequeue_ready(10);
        assert_eq!(out.len(), 1);
        assert_eq!(pool.ready_len(), 0);
    }

    #[test]
    fn test_queue_bound_propagates() {
        let pool = ResourcePool::new(&config("p"), 1);
        pool.enqueue_gang(gang("a", 0, 1, 1.0)).unwrap();
        let err = pool.enqueue_gang(gang("b", 0, 1, 1.0)).unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
    }
}
