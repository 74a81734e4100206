//! Shared data model for the resource manager: task and job states,
//! resource vectors, gangs, placements, status events, and the typed
//! error kinds returned by every service operation.

pub mod error;
pub mod models;
pub mod scalar;

pub use error::{Error, ErrorKind, Result, TaskError};
pub use models::{
    task_stats_equal, AttemptId, Gang, JobConfig, JobRuntime, JobState, Placement,
    ResourcePoolConfig, SchedulingPolicy, TaskDesc, TaskEvent, TaskId, TaskInfo, TaskRuntime,
    TaskState,
};
pub use scalar::Resources;
