//! The service handler: the request/response surface the job manager,
//! placement engine, and upstream event stream drive.
//!
//! Batch operations never fail wholesale; per-task failures are
//! accumulated and returned beside the partial result. Blocking reads
//! (`dequeue_gangs`, `get_placements`, `get_preemptible_tasks`) wait on
//! notifications up to the caller's timeout and return empty on expiry,
//! which is not an error.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use resman_api::{
    AttemptId, Error, Gang, Placement, Result, TaskDesc, TaskError, TaskEvent, TaskId, TaskState,
};

use crate::preemption::{PreemptionCandidate, PreemptionQueue};
use crate::respool::Tree;
use crate::task::timeout::TimeoutWheel;
use crate::task::tracker::Tracker;
use crate::task::RmTask;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueGangsRequest {
    pub pool_id: String,
    pub gangs: Vec<Gang>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueGangsResponse {
    pub failed: Vec<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueGangsRequest {
    pub limit: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DequeueGangsResponse {
    pub gangs: Vec<Gang>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPlacementsRequest {
    pub placements: Vec<Placement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetPlacementsResponse {
    pub failed: Vec<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPlacementsRequest {
    pub limit: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPlacementsResponse {
    pub placements: Vec<Placement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillTasksRequest {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillTasksResponse {
    pub failed: Vec<TaskError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateUpdate {
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTasksStateRequest {
    pub updates: Vec<TaskStateUpdate>,
}

/// Tagged outcome counts for a batch of upstream state updates. Events
/// that do not apply are dropped silently from the caller's point of
/// view but metered here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTasksStateResponse {
    pub applied: u32,
    pub stale_attempt: u32,
    pub illegal_transition: u32,
    pub dropped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyTaskUpdatesRequest {
    pub events: Vec<TaskEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyTaskUpdatesResponse {
    /// Highest consumed event offset; the caller may purge up to it.
    pub purge_offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetActiveTasksRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub states: Vec<TaskState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub pool_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetActiveTasksResponse {
    pub tasks: Vec<ActiveTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPendingTasksRequest {
    pub pool_id: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPendingTasksResponse {
    /// Sub-queue name -> gangs (as member task-id lists) in dequeue
    /// order.
    pub queues: Vec<PendingQueueEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQueueEntry {
    pub queue: String,
    pub gangs: Vec<Vec<TaskId>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetTasksByHostsRequest {
    #[serde(default)]
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetTasksByHostsResponse {
    pub hosts: HashMap<String, Vec<ActiveTask>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPreemptibleTasksRequest {
    pub limit: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPreemptibleTasksResponse {
    pub tasks: Vec<PreemptionCandidate>,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Placement queue bound.
    pub max_placements: usize,
    /// Launching deadline armed when placements are handed off.
    pub launching_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_placements: 10_000,
            launching_timeout: Duration::from_secs(120),
        }
    }
}

pub struct ServiceHandler {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    wheel: TimeoutWheel,
    ready_notify: Arc<Notify>,
    placements: Mutex<VecDeque<Placement>>,
    placement_notify: Notify,
    preemption_queue: Arc<PreemptionQueue>,
    config: HandlerConfig,
}

impl ServiceHandler {
    pub fn new(
        tree: Arc<Tree>,
        tracker: Arc<Tracker>,
        wheel: TimeoutWheel,
        ready_notify: Arc<Notify>,
        preemption_queue: Arc<PreemptionQueue>,
        config: HandlerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            tracker,
            wheel,
            ready_notify,
            placements: Mutex::new(VecDeque::new()),
            placement_notify: Notify::new(),
            preemption_queue,
            config,
        })
    }

    // -----------------------------------------------------------------------
    // Enqueue / dequeue
    // -----------------------------------------------------------------------

    /// Validate and insert gangs into the addressed pool's pending
    /// sub-queue. A task already live under a different attempt id in a
    /// recoverable state is superseded and returned straight to
    /// `ready`.
    pub async fn enqueue_gangs(&self, request: EnqueueGangsRequest) -> EnqueueGangsResponse {
        let mut failed = Vec::new();
        let pool = match self.tree.get(&request.pool_id).and_then(|pool| {
            if self.tree.is_leaf(pool.id())? {
                Ok(pool)
            } else {
                Err(Error::Internal(format!(
                    "resource pool {} is not a leaf",
                    pool.id()
                )))
            }
        }) {
            Ok(pool) => pool,
            Err(e) => {
                for gang in &request.gangs {
                    for task in &gang.tasks {
                        failed.push(TaskError::new(task.id.clone(), &e));
                    }
                }
                return EnqueueGangsResponse { failed };
            }
        };

        for gang in request.gangs {
            if gang.tasks.is_empty() {
                continue;
            }
            let mut fresh: Vec<TaskDesc> = Vec::new();
            for desc in gang.tasks {
                match self.tracker.get_task(&desc.id) {
                    None => match self.admit_new_task(&desc, pool.id()) {
                        Ok(()) => fresh.push(desc),
                        Err(e) => failed.push(TaskError::new(desc.id.clone(), &e)),
                    },
                    Some(existing) => {
                        if let Err(e) = self.re_enqueue(&existing, &desc, |gang| {
                            pool.push_ready(gang);
                            self.ready_notify.notify_waiters();
                        }) {
                            failed.push(TaskError::new(desc.id.clone(), &e));
                        }
                    }
                }
            }
            if fresh.is_empty() {
                continue;
            }
            if let Err(e) = pool.enqueue_gang(Gang::new(fresh.clone())) {
                tracing::warn!(pool = %pool.id(), error = %e, "gang enqueue rejected");
                for desc in &fresh {
                    self.tracker.delete_task(&desc.id);
                    failed.push(TaskError::new(desc.id.clone(), &e));
                }
            }
        }
        EnqueueGangsResponse { failed }
    }

    fn admit_new_task(&self, desc: &TaskDesc, pool_id: &str) -> Result<()> {
        let task = Arc::new(RmTask::new(desc.clone(), pool_id));
        self.tracker.add_task(task.clone())?;
        task.transition(TaskState::Pending)?;
        Ok(())
    }

    /// Handle an enqueue for a task that is already tracked.
    fn re_enqueue(
        &self,
        existing: &Arc<RmTask>,
        desc: &TaskDesc,
        requeue_ready: impl FnOnce(Gang),
    ) -> Result<()> {
        if existing.attempt_id() == desc.attempt_id {
            return Err(Error::AlreadyExist(desc.id.clone()));
        }
        let state = existing.state();
        if state.is_terminal() {
            return Err(Error::Internal(format!(
                "task {} re-enqueued in terminal state {}",
                desc.id, state
            )));
        }
        if !state.is_recoverable() {
            return Err(Error::AlreadyExist(desc.id.clone()));
        }
        existing.supersede(desc.attempt_id.clone())?;
        let mut superseded = existing.desc().clone();
        superseded.attempt_id = desc.attempt_id.clone();
        tracing::info!(
            task_id = %desc.id,
            attempt = %desc.attempt_id,
            "attempt superseded, task back to ready"
        );
        requeue_ready(Gang::new(vec![superseded]));
        Ok(())
    }

    /// Block up to the caller's timeout for up to `limit` ready gangs,
    /// transitioning their tasks `ready -> placing`.
    pub async fn dequeue_gangs(&self, request: DequeueGangsRequest) -> DequeueGangsResponse {
        let limit = request.limit.max(1);
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
        let mut gangs = Vec::new();
        loop {
            let mut notified = pin!(self.ready_notify.notified());
            notified.as_mut().enable();
            self.collect_ready(limit, &mut gangs);
            if gangs.len() >= limit || Instant::now() >= deadline {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.collect_ready(limit, &mut gangs);
                break;
            }
        }
        DequeueGangsResponse { gangs }
    }

    fn collect_ready(&self, limit: usize, out: &mut Vec<Gang>) {
        for pool in self.tree.leaves() {
            if out.len() >= limit {
                return;
            }
            for mut gang in pool.dequeue_ready(limit - out.len()) {
                let mut kept = Vec::with_capacity(gang.tasks.len());
                for mut desc in gang.tasks.drain(..) {
                    let Some(task) = self.tracker.get_task(&desc.id) else {
                        tracing::warn!(task_id = %desc.id, "ready gang member no longer tracked");
                        continue;
                    };
                    match task.transition(TaskState::Placing) {
                        Ok(_) => {
                            self.wheel.register_placing(&task);
                            desc.attempt_id = task.attempt_id();
                            kept.push(desc);
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %desc.id, error = %e, "skipping gang member");
                        }
                    }
                }
                if !kept.is_empty() {
                    out.push(Gang::new(kept));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Placements
    // -----------------------------------------------------------------------

    /// Accept placement-engine results. Tasks no longer in `placing`
    /// are stripped from the placement, transparent to the caller.
    pub async fn set_placements(&self, request: SetPlacementsRequest) -> SetPlacementsResponse {
        let mut failed = Vec::new();
        for placement in request.placements {
            let mut kept: Vec<TaskId> = Vec::new();
            for task_id in &placement.tasks {
                let Some(task) = self.tracker.get_task(task_id) else {
                    tracing::debug!(task_id = %task_id, "placement for unknown task stripped");
                    continue;
                };
                match task.transition(TaskState::Placed) {
                    Ok(_) => {
                        task.set_hostname(Some(placement.hostname.clone()));
                        kept.push(task_id.clone());
                    }
                    Err(e) => {
                        tracing::info!(
                            task_id = %task_id,
                            error = %e,
                            "stripping task from placement"
                        );
                    }
                }
            }
            if kept.is_empty() {
                continue;
            }

            let accepted = {
                let mut queue = self.placements.lock().expect("placements lock poisoned");
                if queue.len() >= self.config.max_placements {
                    false
                } else {
                    queue.push_back(Placement {
                        tasks: kept.clone(),
                        ..placement.clone()
                    });
                    true
                }
            };
            if accepted {
                self.placement_notify.notify_waiters();
                continue;
            }

            // Queue full: roll the tasks back to ready so they get
            // re-placed instead of hanging in placed.
            let full = Error::QueueFull("placement".to_owned());
            for task_id in kept {
                if let Some(task) = self.tracker.get_task(&task_id) {
                    task.set_hostname(None);
                    if task.transition(TaskState::Ready).is_ok() {
                        if let Ok(pool) = self.tree.get(task.pool_id()) {
                            let mut desc = task.desc().clone();
                            desc.attempt_id = task.attempt_id();
                            pool.push_ready(Gang::new(vec![desc]));
                        }
                    }
                }
                failed.push(TaskError::new(task_id, &full));
            }
            self.ready_notify.notify_waiters();
        }
        SetPlacementsResponse { failed }
    }

    /// Block up to the caller's timeout for placements ready to launch,
    /// transitioning their tasks `placed -> launching`.
    pub async fn get_placements(&self, request: GetPlacementsRequest) -> GetPlacementsResponse {
        let limit = request.limit.max(1);
        let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
        let mut placements = Vec::new();
        loop {
            let mut notified = pin!(self.placement_notify.notified());
            notified.as_mut().enable();
            self.collect_placements(limit, &mut placements);
            if placements.len() >= limit || Instant::now() >= deadline {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.collect_placements(limit, &mut placements);
                break;
            }
        }
        GetPlacementsResponse { placements }
    }

    fn collect_placements(&self, limit: usize, out: &mut Vec<Placement>) {
        while out.len() < limit {
            let placement = {
                let mut queue = self.placements.lock().expect("placements lock poisoned");
                queue.pop_front()
            };
            let Some(mut placement) = placement else {
                return;
            };
            placement.tasks.retain(|task_id| {
                let Some(task) = self.tracker.get_task(task_id) else {
                    return false;
                };
                match task.transition(TaskState::Launching) {
                    Ok(_) => {
                        self.wheel
                            .register_launching(&task, self.config.launching_timeout);
                        true
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "dropping task from launch");
                        false
                    }
                }
            });
            if !placement.tasks.is_empty() {
                out.push(placement);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Kill / state updates
    // -----------------------------------------------------------------------

    /// Record a kill goal for each task and move it toward `killing`.
    /// Tasks that have not reached placement are killed locally and
    /// collected immediately.
    pub async fn kill_tasks(&self, request: KillTasksRequest) -> KillTasksResponse {
        let mut failed = Vec::new();
        for task_id in request.task_ids {
            let Some(task) = self.tracker.get_task(&task_id) else {
                failed.push(TaskError::new(
                    task_id.clone(),
                    &Error::NotFound(format!("task {task_id}")),
                ));
                continue;
            };
            task.set_goal_state(TaskState::Killed);
            match task.state() {
                TaskState::Initialized | TaskState::Pending => {
                    // Unadmitted: eviction from the queue and tracker is
                    // the whole kill.
                    let attempt = task.attempt_id();
                    if let Err(e) = self.tracker.mark_it_invalid(&task_id, &attempt) {
                        failed.push(TaskError::new(task_id.clone(), &e));
                    }
                }
                TaskState::Ready => {
                    if let Ok(pool) = self.tree.get(task.pool_id()) {
                        pool.remove_task(&task_id);
                    }
                    let result = task
                        .transition(TaskState::Killing)
                        .and_then(|_| task.transition(TaskState::Killed));
                    match result {
                        Ok(_) => {
                            let attempt = task.attempt_id();
                            if let Err(e) = self.tracker.mark_it_done(&task_id, &attempt) {
                                tracing::error!(task_id = %task_id, error = %e, "kill cleanup failed");
                            }
                        }
                        Err(e) => failed.push(TaskError::new(task_id.clone(), &e)),
                    }
                }
                _ => {
                    // Mid-flight or running: the upstream kill will
                    // deliver the terminal event.
                    if let Err(e) = task.transition(TaskState::Killing) {
                        failed.push(TaskError::new(task_id.clone(), &e));
                    }
                }
            }
        }
        KillTasksResponse { failed }
    }

    /// Apply upstream state feedback. Events that do not apply (stale
    /// attempt, illegal edge, unknown task) are dropped silently and
    /// metered.
    pub async fn update_tasks_state(
        &self,
        request: UpdateTasksStateRequest,
    ) -> UpdateTasksStateResponse {
        let mut counts = UpdateTasksStateResponse::default();
        for update in &request.updates {
            self.apply_state_update(update, &mut counts);
        }
        counts
    }

    fn apply_state_update(&self, update: &TaskStateUpdate, counts: &mut UpdateTasksStateResponse) {
        let Some(task) = self.tracker.get_task(&update.task_id) else {
            tracing::debug!(task_id = %update.task_id, "state update for unknown task dropped");
            counts.dropped += 1;
            return;
        };
        match task.transition_for_attempt(update.state, &update.attempt_id) {
            Ok(_) => {
                counts.applied += 1;
                if update.state.is_terminal() {
                    if let Err(e) = self
                        .tracker
                        .mark_it_done(&update.task_id, &update.attempt_id)
                    {
                        tracing::error!(task_id = %update.task_id, error = %e, "terminal cleanup failed");
                    }
                }
            }
            Err(Error::StaleAttempt { .. }) => {
                tracing::info!(task_id = %update.task_id, "stale-attempt update dropped");
                counts.stale_attempt += 1;
            }
            Err(Error::IllegalTransition { from, .. }) if from.is_terminal() => {
                counts.dropped += 1;
            }
            Err(Error::IllegalTransition { from, to }) => {
                tracing::info!(
                    task_id = %update.task_id,
                    from = %from,
                    to = %to,
                    "illegal-transition update dropped"
                );
                counts.illegal_transition += 1;
            }
            Err(e) => {
                tracing::warn!(task_id = %update.task_id, error = %e, "state update dropped");
                counts.dropped += 1;
            }
        }
    }

    /// Consume a batch of ordered status-stream events. Every event is
    /// acknowledged by advancing the purge offset whether or not it
    /// applied.
    pub async fn notify_task_updates(
        &self,
        request: NotifyTaskUpdatesRequest,
    ) -> NotifyTaskUpdatesResponse {
        let mut purge_offset = 0;
        let mut counts = UpdateTasksStateResponse::default();
        for event in &request.events {
            purge_offset = purge_offset.max(event.offset);
            let update = TaskStateUpdate {
                task_id: event.task_id.clone(),
                attempt_id: event.attempt_id.clone(),
                state: event.state,
            };
            self.apply_state_update(&update, &mut counts);
        }
        tracing::debug!(
            purge_offset,
            applied = counts.applied,
            stale = counts.stale_attempt,
            "status events consumed"
        );
        NotifyTaskUpdatesResponse { purge_offset }
    }

    // -----------------------------------------------------------------------
    // Read-only queries
    // -----------------------------------------------------------------------

    pub async fn get_active_tasks(&self, request: GetActiveTasksRequest) -> GetActiveTasksResponse {
        let snapshots = self
            .tracker
            .tasks_in_states(&request.states, request.job_id.as_deref());
        GetActiveTasksResponse {
            tasks: snapshots
                .into_iter()
                .map(|snapshot| ActiveTask {
                    task_id: snapshot.id,
                    pool_id: snapshot.pool_id,
                    state: snapshot.state,
                    hostname: snapshot.hostname,
                })
                .collect(),
        }
    }

    pub async fn get_pending_tasks(
        &self,
        request: GetPendingTasksRequest,
    ) -> Result<GetPendingTasksResponse> {
        let pool = self.tree.get(&request.pool_id)?;
        let queues = pool
            .pending_snapshot(request.limit.max(1))
            .into_iter()
            .map(|(queue, gangs)| PendingQueueEntry { queue, gangs })
            .collect();
        Ok(GetPendingTasksResponse { queues })
    }

    pub async fn get_tasks_by_hosts(
        &self,
        request: GetTasksByHostsRequest,
    ) -> GetTasksByHostsResponse {
        let hosts = self
            .tracker
            .tasks_by_hosts(&request.hostnames)
            .into_iter()
            .map(|(host, snapshots)| {
                let tasks = snapshots
                    .into_iter()
                    .map(|snapshot| ActiveTask {
                        task_id: snapshot.id,
                        pool_id: snapshot.pool_id,
                        state: snapshot.state,
                        hostname: snapshot.hostname,
                    })
                    .collect();
                (host, tasks)
            })
            .collect();
        GetTasksByHostsResponse { hosts }
    }

    /// Block up to the caller's timeout for preemption candidates,
    /// transitioning each surviving victim `running -> preempting`.
    pub async fn get_preemptible_tasks(
        &self,
        request: GetPreemptibleTasksRequest,
    ) -> GetPreemptibleTasksResponse {
        let candidates = self
            .preemption_queue
            .dequeue(
                request.limit.max(1),
                Duration::from_millis(request.timeout_ms),
            )
            .await;
        let mut tasks = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(task) = self.tracker.get_task(&candidate.task_id) else {
                continue;
            };
            match task.transition(TaskState::Preempting) {
                Ok(_) => tasks.push(candidate),
                Err(e) => {
                    tracing::info!(
                        task_id = %candidate.task_id,
                        error = %e,
                        "victim no longer preemptible"
                    );
                }
            }
        }
        GetPreemptibleTasksResponse { tasks }
    }
}
