//! Task state machine edges.
//!
//! Validates transitions against the allowed graph. Attempt-identity
//! checks and timestamp management live on the task entity; this module
//! only answers whether an edge is legal.

use resman_api::TaskState;

/// Check whether a transition from `from` to `to` is a valid edge in
/// the state graph.
///
/// ```text
/// initialized -> pending                      (enqueue)
/// pending     -> ready                        (pool admission)
/// ready       -> placing                      (dequeue to placement)
/// placing     -> placed | ready | pending     (placed / timeout / retries exhausted)
/// placed      -> launching | ready            (launch handoff / un-launch)
/// launching   -> launched | ready             (launched / timeout, new attempt)
/// launched    -> starting -> running          (upstream status)
/// running     -> preempting                   (preemption victim)
/// preempting  -> killing                      (victim kill issued)
/// <any non-terminal except reserved> -> killing -> killed
/// <any non-terminal> -> succeeded|failed|killed|lost  (matching upstream status)
/// ```
pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
    if from.is_terminal() {
        return false;
    }
    // Terminal upstream statuses are accepted from any live state; the
    // attempt-id check on the entity filters stale ones.
    if to.is_terminal() {
        return true;
    }
    if to == TaskState::Killing {
        return from != TaskState::Reserved;
    }
    matches!(
        (from, to),
        (TaskState::Initialized, TaskState::Pending)
            | (TaskState::Pending, TaskState::Ready)
            | (TaskState::Ready, TaskState::Placing)
            | (TaskState::Placing, TaskState::Placed)
            | (TaskState::Placing, TaskState::Ready)
            | (TaskState::Placing, TaskState::Pending)
            | (TaskState::Placed, TaskState::Launching)
            | (TaskState::Placed, TaskState::Ready)
            | (TaskState::Launching, TaskState::Launched)
            | (TaskState::Launching, TaskState::Ready)
            | (TaskState::Launched, TaskState::Starting)
            | (TaskState::Starting, TaskState::Running)
            | (TaskState::Running, TaskState::Preempting)
            | (TaskState::Preempting, TaskState::Killing)
    )
}
