//! The admission scheduler.
//!
//! A single cooperative loop that walks pool leaves round-robin in id
//! order, admitting head gangs whose demand fits the remaining
//! entitlement. Admitted tasks transition `pending -> ready` and their
//! gang lands on the pool's ready queue for the placement coordinator.
//! Ticking faster than needed is safe; a pass with nothing to admit is
//! a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use resman_api::{Gang, TaskState};

use crate::respool::Tree;

use super::tracker::Tracker;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission pass period.
    pub period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
        }
    }
}

pub struct Scheduler {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    ready_notify: Arc<Notify>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        tree: Arc<Tree>,
        tracker: Arc<Tracker>,
        ready_notify: Arc<Notify>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            tracker,
            ready_notify,
            config,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("task scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let admitted = self.schedule_once();
                    if admitted > 0 {
                        tracing::debug!(admitted, "admission pass");
                    }
                }
            }
        }
    }

    /// One full admission pass. Rounds continue until no leaf admits
    /// anything, taking at most one gang per leaf per round so a deep
    /// queue in one pool cannot starve its siblings.
    pub fn schedule_once(&self) -> usize {
        let mut admitted = 0;
        loop {
            let mut progress = false;
            for pool in self.tree.leaves() {
                let Some(batch) = pool.admit_next() else {
                    continue;
                };
                let mut gang = batch.gang;
                let mut kept = Vec::with_capacity(gang.tasks.len());
                for desc in gang.tasks.drain(..) {
                    let Some(task) = self.tracker.get_task(&desc.id) else {
                        tracing::warn!(task_id = %desc.id, "admitted task no longer tracked");
                        continue;
                    };
                    if task.is_invalidated() {
                        self.tracker.delete_task(&desc.id);
                        continue;
                    }
                    match task.transition(TaskState::Ready) {
                        Ok(_) => {
                            task.set_admitted(true);
                            if let Err(e) = self.tree.charge(pool.id(), desc.resources) {
                                tracing::error!(
                                    task_id = %desc.id,
                                    error = %e,
                                    "allocation charge failed"
                                );
                            }
                            kept.push(desc);
                        }
                        Err(e) => {
                            tracing::warn!(
                                task_id = %desc.id,
                                error = %e,
                                "skipping task on admission"
                            );
                        }
                    }
                }
                if !kept.is_empty() {
                    pool.push_ready(Gang::new(kept));
                    admitted += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        if admitted > 0 {
            self.ready_notify.notify_waiters();
        }
        admitted
    }
}
