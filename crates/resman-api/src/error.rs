//! Typed error kinds shared by every service operation.
//!
//! Batch operations accumulate per-task failures into partial-success
//! responses instead of failing wholesale; [`TaskError`] is the
//! wire-level shape of one such failure.

use serde::{Deserialize, Serialize};

use crate::models::{AttemptId, TaskId, TaskState};

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds of the resource manager. These are semantic kinds, not
/// transport codes; the server surface maps them onto status codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("task {0} already exists with a live attempt")]
    AlreadyExist(TaskId),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("stale attempt for task {task}: current {current}, got {got}")]
    StaleAttempt {
        task: TaskId,
        current: AttemptId,
        got: AttemptId,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExist(_) => ErrorKind::AlreadyExist,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::StaleAttempt { .. } => ErrorKind::StaleAttempt,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Wire-level error kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExist,
    QueueFull,
    StaleAttempt,
    IllegalTransition,
    StoreUnavailable,
    Internal,
}

/// One failed task inside a batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: TaskId,
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(task_id: TaskId, err: &Error) -> Self {
        Self {
            task_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
