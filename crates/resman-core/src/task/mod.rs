//! Task entities, the state machine, the tracker, the admission
//! scheduler, and the shared timeout wheel.

pub mod backoff;
pub mod scheduler;
pub mod state;
pub mod timeout;
pub mod tracker;

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use resman_api::{AttemptId, Error, Result, TaskDesc, TaskId, TaskState};

/// A point-in-time view of a tracked task, used by read-only queries so
/// they never block transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub pool_id: String,
    pub state: TaskState,
    pub attempt_id: AttemptId,
    pub hostname: Option<String>,
    pub last_transition: DateTime<Utc>,
}

struct RmTaskState {
    state: TaskState,
    goal_state: TaskState,
    attempt_id: AttemptId,
    placement_retries: u32,
    invalidated: bool,
    /// True from pool admission until the allocation is released.
    admitted: bool,
    hostname: Option<String>,
    last_transition: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

/// A task tracked by the resource manager.
///
/// Holds the immutable producer description plus the mutable lifecycle
/// state behind a per-task mutex. Tasks reference their pool by id only;
/// pool lookups go through the tree.
pub struct RmTask {
    desc: TaskDesc,
    pool_id: String,
    inner: Mutex<RmTaskState>,
}

impl RmTask {
    pub fn new(desc: TaskDesc, pool_id: impl Into<String>) -> Self {
        let attempt_id = desc.attempt_id.clone();
        Self {
            desc,
            pool_id: pool_id.into(),
            inner: Mutex::new(RmTaskState {
                state: TaskState::Initialized,
                goal_state: TaskState::Succeeded,
                attempt_id,
                placement_retries: 0,
                invalidated: false,
                admitted: false,
                hostname: None,
                last_transition: Utc::now(),
                started_at: None,
            }),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.desc.id
    }

    pub fn desc(&self) -> &TaskDesc {
        &self.desc
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn attempt_id(&self) -> AttemptId {
        self.lock().attempt_id.clone()
    }

    pub fn goal_state(&self) -> TaskState {
        self.lock().goal_state
    }

    pub fn set_goal_state(&self, goal: TaskState) {
        self.lock().goal_state = goal;
    }

    pub fn hostname(&self) -> Option<String> {
        self.lock().hostname.clone()
    }

    pub fn set_hostname(&self, hostname: Option<String>) {
        self.lock().hostname = hostname;
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.lock().last_transition
    }

    pub fn placement_retries(&self) -> u32 {
        self.lock().placement_retries
    }

    pub fn increment_placement_retries(&self) -> u32 {
        let mut inner = self.lock();
        inner.placement_retries += 1;
        inner.placement_retries
    }

    pub fn is_admitted(&self) -> bool {
        self.lock().admitted
    }

    pub fn set_admitted(&self, admitted: bool) {
        self.lock().admitted = admitted;
    }

    /// Record an invalidation for a task that is mid-flight and cannot
    /// be evicted yet.
    pub fn mark_invalid(&self) {
        self.lock().invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.lock().invalidated
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock();
        TaskSnapshot {
            id: self.desc.id.clone(),
            pool_id: self.pool_id.clone(),
            state: inner.state,
            attempt_id: inner.attempt_id.clone(),
            hostname: inner.hostname.clone(),
            last_transition: inner.last_transition,
        }
    }

    /// Execute a state transition. Returns the previous state.
    ///
    /// Rejects illegal edges with `IllegalTransition`. Entering
    /// `running` records the start timestamp used for preemption
    /// ordering.
    pub fn transition(&self, to: TaskState) -> Result<TaskState> {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, to)
    }

    /// Execute a state transition on behalf of an upstream message
    /// carrying an attempt id; rejected with `StaleAttempt` when the id
    /// does not match the current attempt.
    pub fn transition_for_attempt(&self, to: TaskState, attempt: &AttemptId) -> Result<TaskState> {
        let mut inner = self.lock();
        if &inner.attempt_id != attempt {
            return Err(Error::StaleAttempt {
                task: self.desc.id.clone(),
                current: inner.attempt_id.clone(),
                got: attempt.clone(),
            });
        }
        self.transition_locked(&mut inner, to)
    }

    /// Supersede the current attempt with a new one while the task is in
    /// a recoverable state. The task returns to `ready` with reset
    /// placement retries.
    pub fn supersede(&self, new_attempt: AttemptId) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.is_recoverable() {
            return Err(Error::IllegalTransition {
                from: inner.state,
                to: TaskState::Ready,
            });
        }
        if inner.attempt_id == new_attempt {
            return Err(Error::AlreadyExist(self.desc.id.clone()));
        }
        self.transition_locked(&mut inner, TaskState::Ready)?;
        inner.attempt_id = new_attempt;
        inner.placement_retries = 0;
        inner.hostname = None;
        Ok(())
    }

    /// Restart the attempt after a launch timeout: mint a fresh attempt
    /// id, return to `ready`, reset the retry budget.
    pub fn restart_attempt(&self) -> Result<AttemptId> {
        let mut inner = self.lock();
        self.transition_locked(&mut inner, TaskState::Ready)?;
        let attempt = AttemptId::generate(&self.desc.id);
        inner.attempt_id = attempt.clone();
        inner.placement_retries = 0;
        inner.hostname = None;
        Ok(attempt)
    }

    fn transition_locked(
        &self,
        inner: &mut RmTaskState,
        to: TaskState,
    ) -> Result<TaskState> {
        let from = inner.state;
        if !state::is_valid_transition(from, to) {
            return Err(Error::IllegalTransition { from, to });
        }
        inner.state = to;
        inner.last_transition = Utc::now();
        if to == TaskState::Running && inner.started_at.is_none() {
            inner.started_at = Some(inner.last_transition);
        }
        tracing::debug!(task_id = %self.desc.id, from = %from, to = %to, "task transition");
        Ok(from)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RmTaskState> {
        self.inner.lock().expect("task lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use resman_api::Resources;

    use super::*;

    fn task() -> RmTask {
        RmTask::new(
            TaskDesc {
                id: TaskId::new("job1", 0),
                attempt_id: AttemptId::from("job1-0-a"),
                name: "job1-0".to_owned(),
                resources: Resources::new(1.0, 100.0, 10.0, 0.0),
                priority: 0,
                preemptible: true,
                controller: false,
                revocable: false,
                min_instances: 1,
                placement_timeout_seconds: 60,
                placement_retry_limit: 3,
            },
            "respool1",
        )
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let t = task();
        t.transition(TaskState::Pending).unwrap();
        let err = t.transition(TaskState::Running).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(t.state(), TaskState::Pending);
    }

    #[test]
    fn test_transition_for_attempt_rejects_stale() {
        let t = task();
        t.transition(TaskState::Pending).unwrap();
        let err = t
            .transition_for_attempt(TaskState::Ready, &AttemptId::from("job1-0-other"))
            .unwrap_err();
        assert!(matches!(err, Error::StaleAttempt { .. }));

        t.transition_for_attempt(TaskState::Ready, &AttemptId::from("job1-0-a"))
            .expect("matching attempt transitions");
        assert_eq!(t.state(), TaskState::Ready);
    }

    #[test]
    fn test_supersede_only_in_recoverable_states() {
        let t = task();
        t.transition(TaskState::Pending).unwrap();
        let err = t.supersede(AttemptId::from("job1-0-b")).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));

        t.transition(TaskState::Ready).unwrap();
        t.transition(TaskState::Placing).unwrap();
        t.increment_placement_retries();

        t.supersede(AttemptId::from("job1-0-b"))
            .expect("recoverable state supersedes");
        assert_eq!(t.state(), TaskState::Ready);
        assert_eq!(t.attempt_id(), AttemptId::from("job1-0-b"));
        assert_eq!(t.placement_retries(), 0);
    }

    #[test]
    fn test_supersede_same_attempt_is_already_exist() {
        let t = task();
        t.transition(TaskState::Pending).unwrap();
        t.transition(TaskState::Ready).unwrap();
        t.transition(TaskState::Placing).unwrap();
        let err = t.supersede(AttemptId::from("job1-0-a")).unwrap_err();
        assert!(matches!(err, Error::AlreadyExist(_)));
    }

    #[test]
    fn test_restart_attempt_mints_new_id() {
        let t = task();
        for to in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
        ] {
            t.transition(to).unwrap();
        }
        let old = t.attempt_id();
        let fresh = t.restart_attempt().expect("launching may restart");
        assert_ne!(fresh, old);
        assert_eq!(t.state(), TaskState::Ready);
    }

    #[test]
    fn test_started_at_set_once_on_running() {
        let t = task();
        for to in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
            TaskState::Launched,
            TaskState::Starting,
        ] {
            t.transition(to).unwrap();
        }
        assert!(t.started_at().is_none());
        t.transition(TaskState::Running).unwrap();
        assert!(t.started_at().is_some());
    }
}
