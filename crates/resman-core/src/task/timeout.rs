//! Shared timeout wheel for placing and launching deadlines.
//!
//! One wheel task serves every tracked task, so timer memory stays
//! bounded under large fleets. Expiries are checked against the task's
//! current state and attempt before acting, which makes stale timers
//! harmless.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use resman_api::{AttemptId, Gang, TaskId, TaskState};

use crate::respool::Tree;

use super::backoff::backoff_delay;
use super::tracker::Tracker;
use super::RmTask;

/// Timer settings shared across all tasks.
#[derive(Debug, Clone)]
pub struct TaskTimerConfig {
    /// Deadline for `launching` before the attempt is restarted.
    pub launching_timeout: Duration,
    /// Backoff floor for pending re-entry after exhausted placement
    /// retries.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for TaskTimerConfig {
    fn default() -> Self {
        Self {
            launching_timeout: Duration::from_secs(120),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Placing,
    Launching,
    PendingRequeue,
}

#[derive(Debug)]
struct TimerRegistration {
    task_id: TaskId,
    attempt: AttemptId,
    kind: TimerKind,
    delay: Duration,
}

/// Handle for registering deadlines on the shared wheel.
#[derive(Clone)]
pub struct TimeoutWheel {
    tx: mpsc::UnboundedSender<TimerRegistration>,
}

impl TimeoutWheel {
    /// Spawn the wheel worker. It runs until the cancellation token
    /// fires.
    pub fn spawn(
        tracker: Arc<Tracker>,
        tree: Arc<Tree>,
        ready_notify: Arc<Notify>,
        config: TaskTimerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let wheel = Self { tx };
        let worker = WheelWorker {
            tracker,
            tree,
            ready_notify,
            config,
            wheel: wheel.clone(),
        };
        tokio::spawn(worker.run(rx, cancel));
        wheel
    }

    /// Arm the placing deadline for a task that just moved to
    /// `placing`. The deadline comes from the task's own description.
    pub fn register_placing(&self, task: &RmTask) {
        self.register(
            task,
            TimerKind::Placing,
            Duration::from_secs(task.desc().placement_timeout_seconds),
        );
    }

    /// Arm the launching deadline for a task that just moved to
    /// `launching`.
    pub fn register_launching(&self, task: &RmTask, timeout: Duration) {
        self.register(task, TimerKind::Launching, timeout);
    }

    fn register(&self, task: &RmTask, kind: TimerKind, delay: Duration) {
        let registration = TimerRegistration {
            task_id: task.id().clone(),
            attempt: task.attempt_id(),
            kind,
            delay,
        };
        // Send only fails when the wheel worker has shut down.
        let _ = self.tx.send(registration);
    }
}

struct WheelWorker {
    tracker: Arc<Tracker>,
    tree: Arc<Tree>,
    ready_notify: Arc<Notify>,
    config: TaskTimerConfig,
    wheel: TimeoutWheel,
}

impl WheelWorker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<TimerRegistration>,
        cancel: CancellationToken,
    ) {
        let mut queue: DelayQueue<TimerRegistration> = DelayQueue::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("timeout wheel stopped");
                    break;
                }
                registration = rx.recv() => {
                    match registration {
                        Some(registration) => {
                            let delay = registration.delay;
                            queue.insert(registration, delay);
                        }
                        None => break,
                    }
                }
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    self.handle_expiry(expired.into_inner());
                }
            }
        }
    }

    fn handle_expiry(&self, registration: TimerRegistration) {
        let Some(task) = self.tracker.get_task(&registration.task_id) else {
            return;
        };
        if task.attempt_id() != registration.attempt {
            return;
        }
        match registration.kind {
            TimerKind::Placing => self.handle_placing_expiry(&task),
            TimerKind::Launching => self.handle_launching_expiry(&task),
            TimerKind::PendingRequeue => self.handle_pending_requeue(&task),
        }
    }

    /// Placement deadline hit: back to `ready` while the retry budget
    /// lasts, otherwise release the allocation and fall back to
    /// `pending` after backoff.
    fn handle_placing_expiry(&self, task: &Arc<RmTask>) {
        if task.state() != TaskState::Placing {
            return;
        }
        let retries = task.increment_placement_retries();
        if retries < task.desc().placement_retry_limit {
            if task.transition(TaskState::Ready).is_ok() {
                tracing::info!(task_id = %task.id(), retries, "placement timed out, back to ready");
                self.requeue_ready(task);
                // Arm the next placing deadline when it is dequeued again.
            }
            return;
        }
        if task.transition(TaskState::Pending).is_ok() {
            tracing::warn!(
                task_id = %task.id(),
                retries,
                "placement retries exhausted, falling back to pending"
            );
            if task.is_admitted() {
                if let Err(e) = self.tree.uncharge(task.pool_id(), task.desc().resources) {
                    tracing::error!(task_id = %task.id(), error = %e, "failed to release allocation");
                }
                task.set_admitted(false);
            }
            let delay = backoff_delay(retries, self.config.backoff_base, self.config.backoff_max);
            self.wheel.register(task, TimerKind::PendingRequeue, delay);
        }
    }

    /// Launch deadline hit: restart with a fresh attempt id and return
    /// the task to `ready`.
    fn handle_launching_expiry(&self, task: &Arc<RmTask>) {
        if task.state() != TaskState::Launching {
            return;
        }
        match task.restart_attempt() {
            Ok(attempt) => {
                tracing::warn!(
                    task_id = %task.id(),
                    attempt = %attempt,
                    "launch timed out, restarting attempt"
                );
                self.requeue_ready(task);
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id(), error = %e, "launch timeout raced a transition");
            }
        }
    }

    /// Backoff elapsed: re-enter the pool's pending sub-queue.
    fn handle_pending_requeue(&self, task: &Arc<RmTask>) {
        if task.state() != TaskState::Pending {
            return;
        }
        let pool = match self.tree.get(task.pool_id()) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(task_id = %task.id(), error = %e, "pool gone for requeue");
                return;
            }
        };
        let mut desc = task.desc().clone();
        desc.attempt_id = task.attempt_id();
        if let Err(e) = pool.enqueue_gang(Gang::new(vec![desc])) {
            tracing::warn!(task_id = %task.id(), error = %e, "pending requeue failed");
        }
    }

    fn requeue_ready(&self, task: &Arc<RmTask>) {
        let pool = match self.tree.get(task.pool_id()) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(task_id = %task.id(), error = %e, "pool gone for ready requeue");
                return;
            }
        };
        let mut desc = task.desc().clone();
        desc.attempt_id = task.attempt_id();
        pool.push_ready(Gang::new(vec![desc]));
        self.ready_notify.notify_waiters();
    }
}
