//! Persistent-store interfaces consumed by the resource manager.
//!
//! The manager never owns durability: jobs, tasks, and resource-pool
//! configurations live in an external store, and recovery after leader
//! election is a re-read, not a journal replay. The traits here are the
//! full surface the core calls; [`memory::MemoryStore`] is the bundled
//! implementation used by the server binary and by tests.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use resman_api::{
    JobConfig, JobRuntime, JobState, ResourcePoolConfig, Result, TaskId, TaskInfo, TaskRuntime,
    TaskState,
};

/// Job-level reads and the single runtime write-back the updater makes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Ids of jobs currently in any of `states`.
    async fn get_jobs_by_states(&self, states: &[JobState]) -> Result<Vec<String>>;

    async fn get_job_config(&self, job_id: &str) -> Result<JobConfig>;

    async fn get_job_runtime(&self, job_id: &str) -> Result<JobRuntime>;

    async fn update_job_runtime(&self, job_id: &str, runtime: JobRuntime) -> Result<()>;
}

/// Task-level reads and batched write-back.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_tasks_for_job_and_states(
        &self,
        job_id: &str,
        states: &[TaskState],
    ) -> Result<Vec<TaskInfo>>;

    async fn get_task_runtime(&self, id: &TaskId) -> Result<TaskRuntime>;

    /// Tasks of `job_id` with instance id in `[from, to)`.
    async fn get_task_runtimes_for_job_by_range(
        &self,
        job_id: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<TaskInfo>>;

    async fn update_tasks(&self, tasks: &[TaskInfo]) -> Result<()>;

    async fn get_task_ids_for_job_and_state(
        &self,
        job_id: &str,
        state: TaskState,
    ) -> Result<Vec<TaskId>>;

    /// Per-state task counts for one job.
    async fn get_task_state_summary_for_job(
        &self,
        job_id: &str,
    ) -> Result<HashMap<TaskState, u32>>;
}

/// Resource-pool configuration reads, consumed once at tree build and
/// again on admin-triggered refresh.
#[async_trait]
pub trait ResourcePoolStore: Send + Sync {
    async fn get_all_resource_pools(&self) -> Result<Vec<ResourcePoolConfig>>;
}
