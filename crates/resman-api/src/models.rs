//! Core wire types: identifiers, task and job states, gangs, placements,
//! status events, and resource-pool configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scalar::Resources;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of a task instance: the owning job plus the instance index.
///
/// The canonical string form is `<job_id>-<instance_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: String,
    pub instance_id: u32,
}

impl TaskId {
    pub fn new(job_id: impl Into<String>, instance_id: u32) -> Self {
        Self {
            job_id: job_id.into(),
            instance_id,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.job_id, self.instance_id)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, instance) = s
            .rsplit_once('-')
            .ok_or_else(|| TaskIdParseError(s.to_owned()))?;
        let instance_id = instance
            .parse::<u32>()
            .map_err(|_| TaskIdParseError(s.to_owned()))?;
        if job.is_empty() {
            return Err(TaskIdParseError(s.to_owned()));
        }
        Ok(Self {
            job_id: job.to_owned(),
            instance_id,
        })
    }
}

/// Error returned when parsing an invalid [`TaskId`] string.
#[derive(Debug, Clone)]
pub struct TaskIdParseError(pub String);

impl fmt::Display for TaskIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task id: {:?}", self.0)
    }
}

impl std::error::Error for TaskIdParseError {}

/// Identity of a single launch attempt of a task instance.
///
/// Attempt ids are minted by the upstream cluster manager and are opaque
/// to the resource manager; it only ever compares them for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub String);

impl AttemptId {
    /// Mint a fresh attempt id. Used when the manager itself restarts an
    /// attempt (e.g. a launch timeout), mirroring the format the
    /// upstream uses: `<task_id>-<uuid>`.
    pub fn generate(task_id: &TaskId) -> Self {
        Self(format!("{}-{}", task_id, Uuid::new_v4()))
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttemptId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Initialized,
    Pending,
    Ready,
    Placing,
    Placed,
    Launching,
    Launched,
    Starting,
    Running,
    Succeeded,
    Failed,
    Killed,
    Lost,
    Preempting,
    Killing,
    Reserved,
}

impl TaskState {
    /// Terminal states absorb no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Killed | Self::Lost
        )
    }

    /// States from which a re-enqueue with a new attempt id may supersede
    /// the current attempt.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Placing | Self::Placed | Self::Launching)
    }

    /// States counted against a job's running-instance throttle.
    pub fn is_scheduled(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Ready
                | Self::Placing
                | Self::Placed
                | Self::Launching
                | Self::Launched
                | Self::Starting
                | Self::Running
                | Self::Preempting
                | Self::Killing
        )
    }

    /// States at or past the point where the task has started on a host.
    pub fn is_after_start(self) -> bool {
        matches!(
            self,
            Self::Starting
                | Self::Running
                | Self::Succeeded
                | Self::Failed
                | Self::Lost
                | Self::Preempting
                | Self::Killing
                | Self::Killed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Placing => "placing",
            Self::Placed => "placed",
            Self::Launching => "launching",
            Self::Launched => "launched",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Lost => "lost",
            Self::Preempting => "preempting",
            Self::Killing => "killing",
            Self::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "placing" => Ok(Self::Placing),
            "placed" => Ok(Self::Placed),
            "launching" => Ok(Self::Launching),
            "launched" => Ok(Self::Launched),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            "lost" => Ok(Self::Lost),
            "preempting" => Ok(Self::Preempting),
            "killing" => Ok(Self::Killing),
            "reserved" => Ok(Self::Reserved),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Aggregate state of a job, derived from its task-state counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initialized,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = JobStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            other => Err(JobStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobState`] string.
#[derive(Debug, Clone)]
pub struct JobStateParseError(pub String);

impl fmt::Display for JobStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job state: {:?}", self.0)
    }
}

impl std::error::Error for JobStateParseError {}

// ---------------------------------------------------------------------------
// Tasks and gangs
// ---------------------------------------------------------------------------

/// A producer-submitted task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDesc {
    pub id: TaskId,
    /// Current attempt id, minted by the upstream cluster manager.
    pub attempt_id: AttemptId,
    pub name: String,
    pub resources: Resources,
    /// Higher priority dequeues earlier.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub revocable: bool,
    /// Number of leading gang members that must proceed atomically.
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "default_placement_timeout")]
    pub placement_timeout_seconds: u64,
    /// Placement retries allowed per attempt before the task falls back
    /// to the pending queue.
    #[serde(default = "default_placement_retry_limit")]
    pub placement_retry_limit: u32,
}

fn default_placement_timeout() -> u64 {
    60
}

fn default_placement_retry_limit() -> u32 {
    3
}

/// An ordered set of tasks admitted, placed, and launched together.
///
/// All members share a priority and preemption class; the id of a gang
/// is the id of its first task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gang {
    pub tasks: Vec<TaskDesc>,
}

impl Gang {
    pub fn new(tasks: Vec<TaskDesc>) -> Self {
        Self { tasks }
    }

    /// The gang id: the id of the first member. Panics on an empty gang,
    /// which enqueue validation rejects before any gang is stored.
    pub fn id(&self) -> &TaskId {
        &self.tasks[0].id
    }

    pub fn priority(&self) -> u32 {
        self.tasks.first().map(|t| t.priority).unwrap_or(0)
    }

    /// Total resource demand across members.
    pub fn resources(&self) -> Resources {
        let mut total = Resources::ZERO;
        for task in &self.tasks {
            total += task.resources;
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Placements and status events
// ---------------------------------------------------------------------------

/// A placement-engine result: a host and offer bound to a set of tasks
/// from a single pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub hostname: String,
    pub offer_id: String,
    pub pool_id: String,
    pub tasks: Vec<TaskId>,
}

/// A status event from the upstream cluster manager's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub attempt_id: AttemptId,
    pub state: TaskState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Monotone acknowledgement cursor.
    pub offset: u64,
}

/// Persisted runtime of one task instance, as read from the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub state: TaskState,
    pub goal_state: TaskState,
    pub attempt_id: AttemptId,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// A task id paired with its persisted runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub runtime: TaskRuntime,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Static job configuration, read from the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub instance_count: u32,
    /// Cap on concurrently scheduled instances; zero means unlimited.
    #[serde(default)]
    pub max_running_instances: u32,
    pub goal_state: JobState,
}

/// Mutable job runtime, derived from task-state counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRuntime {
    pub state: JobState,
    pub goal_state: JobState,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    /// Per-state task counts as of the last update.
    #[serde(default)]
    pub task_stats: HashMap<TaskState, u32>,
}

impl JobRuntime {
    pub fn new(goal_state: JobState) -> Self {
        Self {
            state: JobState::Initialized,
            goal_state,
            start_time: None,
            completion_time: None,
            task_stats: HashMap::new(),
        }
    }
}

/// Compare two task-stat maps as multisets of counts: missing keys count
/// as zero, map identity is irrelevant.
pub fn task_stats_equal(a: &HashMap<TaskState, u32>, b: &HashMap<TaskState, u32>) -> bool {
    let zero = 0;
    a.iter()
        .all(|(state, count)| b.get(state).unwrap_or(&zero) == count)
        && b.iter()
            .all(|(state, count)| a.get(state).unwrap_or(&zero) == count)
}

// ---------------------------------------------------------------------------
// Resource pools
// ---------------------------------------------------------------------------

/// Scheduling policy of a resource pool. Priority-FIFO is the only
/// policy the manager implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    #[default]
    PriorityFifo,
}

/// Static configuration of one resource-pool node, read from the
/// resource-pool store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    pub name: String,
    /// Parent pool name; `None` only for the root.
    #[serde(default)]
    pub parent: Option<String>,
    pub reservation: Resources,
    pub limit: Resources,
    #[serde(default = "default_share")]
    pub share: f64,
    #[serde(default)]
    pub policy: SchedulingPolicy,
}

fn default_share() -> f64 {
    1.0
}
