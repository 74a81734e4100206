//! Preemption: the victim queue and the entitlement-violation
//! evaluator.
//!
//! When the entitlement calculator shrinks a pool below its current
//! allocation, the evaluator picks preemptible running tasks as victims
//! until the overage is covered. Victims wait in a bounded queue until a
//! consumer collects them via the service surface, which moves them to
//! `preempting`.

use std::collections::{HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use resman_api::{Error, Result, TaskId, TaskState};

use crate::respool::Tree;
use crate::task::tracker::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionReason {
    /// Pool allocation exceeds its entitlement on some dimension.
    EntitlementViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionCandidate {
    pub task_id: TaskId,
    pub pool_id: String,
    pub reason: PreemptionReason,
}

#[derive(Debug, Clone)]
pub struct PreemptorConfig {
    /// Evaluation period.
    pub period: Duration,
    /// Running time under which a task is still protected from
    /// preemption.
    pub grace_period: Duration,
    /// Victim queue bound.
    pub queue_bound: usize,
}

impl Default for PreemptorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            grace_period: Duration::ZERO,
            queue_bound: 10_000,
        }
    }
}

struct QueueState {
    queue: VecDeque<PreemptionCandidate>,
    /// Tasks currently enqueued, to keep repeated evaluations from
    /// duplicating victims.
    enqueued: HashSet<TaskId>,
}

/// Bounded queue of preemption candidates with blocking dequeue.
pub struct PreemptionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    bound: usize,
}

impl PreemptionQueue {
    pub fn new(bound: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                enqueued: HashSet::new(),
            }),
            notify: Notify::new(),
            bound,
        })
    }

    pub fn enqueue(&self, candidate: PreemptionCandidate) -> Result<()> {
        {
            let mut state = self.state.lock().expect("preemption lock poisoned");
            if state.enqueued.contains(&candidate.task_id) {
                return Ok(());
            }
            if state.queue.len() >= self.bound {
                return Err(Error::QueueFull("preemption".to_owned()));
            }
            state.enqueued.insert(candidate.task_id.clone());
            state.queue.push_back(candidate);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("preemption lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dequeue up to `limit` candidates, waiting up to `timeout` for the
    /// first one. An empty result after the timeout is not an error.
    pub async fn dequeue(&self, limit: usize, timeout: Duration) -> Vec<PreemptionCandidate> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("preemption lock poisoned");
                while out.len() < limit {
                    match state.queue.pop_front() {
                        Some(candidate) => {
                            state.enqueued.remove(&candidate.task_id);
                            out.push(candidate);
                        }
                        None => break,
                    }
                }
            }
            if out.len() >= limit || Instant::now() >= deadline {
                return out;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Final sweep after the deadline.
                let mut state = self.state.lock().expect("preemption lock poisoned");
                while out.len() < limit {
                    match state.queue.pop_front() {
                        Some(candidate) => {
                            state.enqueued.remove(&candidate.task_id);
                            out.push(candidate);
                        }
                        None => break,
                    }
                }
                return out;
            }
        }
    }
}

/// Periodic evaluator that surfaces entitlement violations as
/// preemption candidates.
pub struct Preemptor {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    queue: Arc<PreemptionQueue>,
    config: PreemptorConfig,
}

impl Preemptor {
    pub fn new(
        tree: Arc<Tree>,
        tracker: Arc<Tracker>,
        queue: Arc<PreemptionQueue>,
        config: PreemptorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            tracker,
            queue,
            config,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("preemption evaluator stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let picked = self.evaluate_once();
                    if picked > 0 {
                        tracing::info!(victims = picked, "preemption candidates enqueued");
                    }
                }
            }
        }
    }

    /// One evaluation pass over all leaves. Returns the number of
    /// victims enqueued.
    pub fn evaluate_once(&self) -> usize {
        let mut picked = 0;
        for pool in self.tree.leaves() {
            let allocation = pool.allocation();
            let entitlement = pool.entitlement();
            if !allocation.exceeds(&entitlement) {
                continue;
            }
            let mut overage = allocation.saturating_sub(&entitlement);
            tracing::info!(
                pool = %pool.id(),
                overage = %overage,
                "entitlement violated, selecting victims"
            );

            let now = chrono::Utc::now();
            let grace =
                chrono::Duration::from_std(self.config.grace_period).unwrap_or_default();
            let mut candidates: Vec<_> = self
                .tracker
                .tasks_for_pool(pool.id())
                .into_iter()
                .filter(|task| {
                    task.state() == TaskState::Running
                        && task.desc().preemptible
                        && task
                            .started_at()
                            .map(|started| now - started >= grace)
                            .unwrap_or(false)
                })
                .collect();
            // Lowest priority first; within a priority the youngest
            // task loses the least progress.
            candidates.sort_by(|a, b| {
                a.desc()
                    .priority
                    .cmp(&b.desc().priority)
                    .then(b.started_at().cmp(&a.started_at()))
            });

            for task in candidates {
                if overage.is_zero() {
                    break;
                }
                let candidate = PreemptionCandidate {
                    task_id: task.id().clone(),
                    pool_id: pool.id().to_owned(),
                    reason: PreemptionReason::EntitlementViolation,
                };
                match self.queue.enqueue(candidate) {
                    Ok(()) => {
                        overage = overage.saturating_sub(&task.desc().resources);
                        picked += 1;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id(), error = %e, "victim enqueue failed");
                        break;
                    }
                }
            }
        }
        picked
    }
}
