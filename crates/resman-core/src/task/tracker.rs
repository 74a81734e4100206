//! The task tracker: an in-memory, sharded map from task id to tracked
//! task.
//!
//! Shard locks are held only to look up or mutate the map itself; state
//! transitions take the per-task mutex, so global reads snapshot without
//! blocking transitions. Queue eviction and allocation release go
//! through the tree (pool then tracker, leaf-first).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use resman_api::{AttemptId, Error, Result, TaskId, TaskState};

use crate::respool::Tree;

use super::{RmTask, TaskSnapshot};

const SHARD_COUNT: usize = 32;

pub struct Tracker {
    shards: Vec<RwLock<HashMap<TaskId, Arc<RmTask>>>>,
    tree: Arc<Tree>,
}

impl Tracker {
    pub fn new(tree: Arc<Tree>) -> Arc<Self> {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Arc::new(Self { shards, tree })
    }

    fn shard(&self, id: &TaskId) -> &RwLock<HashMap<TaskId, Arc<RmTask>>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub fn add_task(&self, task: Arc<RmTask>) -> Result<()> {
        let mut shard = self.shard(task.id()).write().expect("shard lock poisoned");
        if shard.contains_key(task.id()) {
            return Err(Error::AlreadyExist(task.id().clone()));
        }
        shard.insert(task.id().clone(), task);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Arc<RmTask>> {
        self.shard(id).read().expect("shard lock poisoned").get(id).cloned()
    }

    pub fn delete_task(&self, id: &TaskId) -> Option<Arc<RmTask>> {
        self.shard(id).write().expect("shard lock poisoned").remove(id)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("shard lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate a task attempt.
    ///
    /// Tasks still in `initialized` or `pending` are evicted from their
    /// pool queue and from the tracker. Tasks mid-flight (claimed by
    /// placement or launch) only record the invalidation and complete
    /// their current transition.
    pub fn mark_it_invalid(&self, id: &TaskId, attempt: &AttemptId) -> Result<bool> {
        let task = self
            .get_task(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let current = task.attempt_id();
        if &current != attempt {
            return Err(Error::StaleAttempt {
                task: id.clone(),
                current,
                got: attempt.clone(),
            });
        }
        match task.state() {
            TaskState::Initialized | TaskState::Pending => {
                let pool = self.tree.get(task.pool_id())?;
                pool.remove_task(id);
                self.delete_task(id);
                Ok(true)
            }
            _ => {
                task.mark_invalid();
                Ok(false)
            }
        }
    }

    /// Finish a terminal task: release its admitted allocation and drop
    /// it from the tracker.
    pub fn mark_it_done(&self, id: &TaskId, attempt: &AttemptId) -> Result<()> {
        let task = self
            .get_task(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let current = task.attempt_id();
        if &current != attempt {
            return Err(Error::StaleAttempt {
                task: id.clone(),
                current,
                got: attempt.clone(),
            });
        }
        if task.is_admitted() {
            self.tree.uncharge(task.pool_id(), task.desc().resources)?;
            task.set_admitted(false);
        }
        self.delete_task(id);
        tracing::debug!(task_id = %id, "task done");
        Ok(())
    }

    /// Snapshot tasks currently in any of `states` (all tasks when
    /// `states` is empty), optionally restricted to one job.
    pub fn tasks_in_states(
        &self,
        states: &[TaskState],
        job_id: Option<&str>,
    ) -> Vec<TaskSnapshot> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().expect("shard lock poisoned");
            for task in shard.values() {
                if let Some(job) = job_id {
                    if task.id().job_id != job {
                        continue;
                    }
                }
                let snapshot = task.snapshot();
                if states.is_empty() || states.contains(&snapshot.state) {
                    out.push(snapshot);
                }
            }
        }
        out.sort_by(|a, b| a.id.job_id.cmp(&b.id.job_id).then(a.id.instance_id.cmp(&b.id.instance_id)));
        out
    }

    /// Live tasks belonging to one pool.
    pub fn tasks_for_pool(&self, pool_id: &str) -> Vec<Arc<RmTask>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().expect("shard lock poisoned");
            out.extend(
                shard
                    .values()
                    .filter(|task| task.pool_id() == pool_id)
                    .cloned(),
            );
        }
        out
    }

    /// Snapshot of placed-or-later tasks grouped by hostname. An empty
    /// `hostnames` filter returns every host.
    pub fn tasks_by_hosts(&self, hostnames: &[String]) -> HashMap<String, Vec<TaskSnapshot>> {
        let mut out: HashMap<String, Vec<TaskSnapshot>> = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read().expect("shard lock poisoned");
            for task in shard.values() {
                let snapshot = task.snapshot();
                let Some(host) = snapshot.hostname.clone() else {
                    continue;
                };
                if hostnames.is_empty() || hostnames.contains(&host) {
                    out.entry(host).or_default().push(snapshot);
                }
            }
        }
        for tasks in out.values_mut() {
            tasks.sort_by(|a, b| {
                a.id.job_id
                    .cmp(&b.id.job_id)
                    .then(a.id.instance_id.cmp(&b.id.instance_id))
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use resman_api::{Resources, ResourcePoolConfig, SchedulingPolicy, TaskDesc};

    use super::*;

    fn sample_tree() -> Arc<Tree> {
        Tree::build(
            &[
                ResourcePoolConfig {
                    name: "root".to_owned(),
                    parent: None,
                    reservation: Resources::new(10.0, 100.0, 100.0, 0.0),
                    limit: Resources::new(100.0, 1000.0, 1000.0, 4.0),
                    share: 1.0,
                    policy: SchedulingPolicy::PriorityFifo,
                },
                ResourcePoolConfig {
                    name: "respool1".to_owned(),
                    parent: Some("root".to_owned()),
                    reservation: Resources::new(10.0, 100.0, 100.0, 0.0),
                    limit: Resources::new(100.0, 1000.0, 1000.0, 4.0),
                    share: 1.0,
                    policy: SchedulingPolicy::PriorityFifo,
                },
            ],
            100,
        )
        .expect("valid tree")
    }

    fn desc(instance: u32) -> TaskDesc {
        TaskDesc {
            id: TaskId::new("job1", instance),
            attempt_id: AttemptId::from(format!("job1-{instance}-a").as_str()),
            name: format!("job1-{instance}"),
            resources: Resources::new(1.0, 10.0, 1.0, 0.0),
            priority: 0,
            preemptible: true,
            controller: false,
            revocable: false,
            min_instances: 1,
            placement_timeout_seconds: 60,
            placement_retry_limit: 3,
        }
    }

    #[test]
    fn test_add_twice_is_already_exist() {
        let tracker = Tracker::new(sample_tree());
        tracker
            .add_task(Arc::new(RmTask::new(desc(0), "respool1")))
            .unwrap();
        let err = tracker
            .add_task(Arc::new(RmTask::new(desc(0), "respool1")))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExist(_)));
    }

    #[test]
    fn test_mark_it_invalid_evicts_pending_only() {
        let tree = sample_tree();
        let tracker = Tracker::new(tree.clone());
        let task = Arc::new(RmTask::new(desc(0), "respool1"));
        tracker.add_task(task.clone()).unwrap();
        task.transition(TaskState::Pending).unwrap();

        let evicted = tracker
            .mark_it_invalid(&TaskId::new("job1", 0), &AttemptId::from("job1-0-a"))
            .unwrap();
        assert!(evicted);
        assert!(tracker.get_task(&TaskId::new("job1", 0)).is_none());

        // A mid-flight task is only flagged.
        let task = Arc::new(RmTask::new(desc(1), "respool1"));
        tracker.add_task(task.clone()).unwrap();
        task.transition(TaskState::Pending).unwrap();
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Placing).unwrap();

        let evicted = tracker
            .mark_it_invalid(&TaskId::new("job1", 1), &AttemptId::from("job1-1-a"))
            .unwrap();
        assert!(!evicted);
        assert!(task.is_invalidated());
        assert!(tracker.get_task(&TaskId::new("job1", 1)).is_some());
    }

    #[test]
    fn test_mark_it_done_releases_allocation() {
        let tree = sample_tree();
        let tracker = Tracker::new(tree.clone());
        let task = Arc::new(RmTask::new(desc(0), "respool1"));
        tracker.add_task(task.clone()).unwrap();

        // Simulate admission accounting.
        tree.charge("respool1", task.desc().resources).unwrap();
        task.set_admitted(true);
        for to in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
            TaskState::Launched,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Succeeded,
        ] {
            task.transition(to).unwrap();
        }

        tracker
            .mark_it_done(&TaskId::new("job1", 0), &AttemptId::from("job1-0-a"))
            .unwrap();
        assert!(tracker.is_empty());
        assert_eq!(
            tree.get("respool1").unwrap().allocation(),
            Resources::ZERO
        );
        assert_eq!(tree.get("root").unwrap().allocation(), Resources::ZERO);
    }

    #[test]
    fn test_mark_it_done_rejects_stale_attempt() {
        let tracker = Tracker::new(sample_tree());
        let task = Arc::new(RmTask::new(desc(0), "respool1"));
        tracker.add_task(task).unwrap();

        let err = tracker
            .mark_it_done(&TaskId::new("job1", 0), &AttemptId::from("job1-0-z"))
            .unwrap_err();
        assert!(matches!(err, Error::StaleAttempt { .. }));
        assert!(!tracker.is_empty());
    }
}
