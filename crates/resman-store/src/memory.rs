//! In-memory store implementation.
//!
//! Backs the server binary and tests. All maps live under `RwLock`s;
//! nothing is held across an await point.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use resman_api::{
    Error, JobConfig, JobRuntime, JobState, ResourcePoolConfig, Result, TaskId, TaskInfo,
    TaskRuntime, TaskState,
};

use crate::{JobStore, ResourcePoolStore, TaskStore};

#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
    tasks: RwLock<HashMap<TaskId, TaskRuntime>>,
    pools: RwLock<Vec<ResourcePoolConfig>>,
}

struct JobRecord {
    config: JobConfig,
    runtime: JobRuntime,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job_id: &str, config: JobConfig) {
        let runtime = JobRuntime::new(config.goal_state);
        self.jobs
            .write()
            .expect("jobs lock poisoned")
            .insert(job_id.to_owned(), JobRecord { config, runtime });
    }

    pub fn insert_task(&self, id: TaskId, runtime: TaskRuntime) {
        self.tasks
            .write()
            .expect("tasks lock poisoned")
            .insert(id, runtime);
    }

    pub fn set_pools(&self, pools: Vec<ResourcePoolConfig>) {
        *self.pools.write().expect("pools lock poisoned") = pools;
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_jobs_by_states(&self, states: &[JobState]) -> Result<Vec<String>> {
        let jobs = self.jobs.read().expect("jobs lock poisoned");
        let mut ids: Vec<String> = jobs
            .iter()
            .filter(|(_, rec)| states.contains(&rec.runtime.state))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_job_config(&self, job_id: &str) -> Result<JobConfig> {
        let jobs = self.jobs.read().expect("jobs lock poisoned");
        jobs.get(job_id)
            .map(|rec| rec.config.clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    async fn get_job_runtime(&self, job_id: &str) -> Result<JobRuntime> {
        let jobs = self.jobs.read().expect("jobs lock poisoned");
        jobs.get(job_id)
            .map(|rec| rec.runtime.clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    async fn update_job_runtime(&self, job_id: &str, runtime: JobRuntime) -> Result<()> {
        let mut jobs = self.jobs.write().expect("jobs lock poisoned");
        let rec = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        rec.runtime = runtime;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_tasks_for_job_and_states(
        &self,
        job_id: &str,
        states: &[TaskState],
    ) -> Result<Vec<TaskInfo>> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        let mut infos: Vec<TaskInfo> = tasks
            .iter()
            .filter(|(id, rt)| id.job_id == job_id && states.contains(&rt.state))
            .map(|(id, rt)| TaskInfo {
                id: id.clone(),
                runtime: rt.clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.id.instance_id);
        Ok(infos)
    }

    async fn get_task_runtime(&self, id: &TaskId) -> Result<TaskRuntime> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn get_task_runtimes_for_job_by_range(
        &self,
        job_id: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<TaskInfo>> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        let mut infos: Vec<TaskInfo> = tasks
            .iter()
            .filter(|(id, _)| {
                id.job_id == job_id && id.instance_id >= from && id.instance_id < to
            })
            .map(|(id, rt)| TaskInfo {
                id: id.clone(),
                runtime: rt.clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.id.instance_id);
        Ok(infos)
    }

    async fn update_tasks(&self, updates: &[TaskInfo]) -> Result<()> {
        let mut tasks = self.tasks.write().expect("tasks lock poisoned");
        for info in updates {
            tasks.insert(info.id.clone(), info.runtime.clone());
        }
        Ok(())
    }

    async fn get_task_ids_for_job_and_state(
        &self,
        job_id: &str,
        state: TaskState,
    ) -> Result<Vec<TaskId>> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        let mut ids: Vec<TaskId> = tasks
            .iter()
            .filter(|(id, rt)| id.job_id == job_id && rt.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by_key(|id| id.instance_id);
        Ok(ids)
    }

    async fn get_task_state_summary_for_job(
        &self,
        job_id: &str,
    ) -> Result<HashMap<TaskState, u32>> {
        let tasks = self.tasks.read().expect("tasks lock poisoned");
        let mut summary: HashMap<TaskState, u32> = HashMap::new();
        for (id, rt) in tasks.iter() {
            if id.job_id == job_id {
                *summary.entry(rt.state).or_insert(0) += 1;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl ResourcePoolStore for MemoryStore {
    async fn get_all_resource_pools(&self) -> Result<Vec<ResourcePoolConfig>> {
        Ok(self.pools.read().expect("pools lock poisoned").clone())
    }
}
