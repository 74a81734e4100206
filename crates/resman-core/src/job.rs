//! Job runtime updater: derives a job's aggregate state from its
//! task-state counts and writes it back to the job store.
//!
//! Also enforces the running-instance throttle: when a job caps
//! concurrently scheduled instances, only enough initialized tasks to
//! fill the cap are handed back for scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use resman_api::{task_stats_equal, JobState, Result, TaskId, TaskState};
use resman_store::{JobStore, TaskStore};

/// Outcome of one updater pass over a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdateOutcome {
    pub state: JobState,
    /// The derived state is `initialized` with instances missing:
    /// recovery should re-create them. An explicit signal, not an
    /// error.
    pub recovery_needed: bool,
    /// False when the stats were unchanged and nothing was written.
    pub stats_changed: bool,
    /// Initialized tasks the caller should schedule now, bounded by the
    /// job's running-instance cap.
    pub to_start: Vec<TaskId>,
}

/// Derive the aggregate job state from task-state counts. Rules apply
/// in order, first match wins. Returns the state plus whether recovery
/// is needed.
pub fn derive_job_state(
    stats: &HashMap<TaskState, u32>,
    instances: u32,
    tasks_created: u32,
) -> (JobState, bool) {
    let count = |state: TaskState| stats.get(&state).copied().unwrap_or(0);
    let succeeded = count(TaskState::Succeeded);
    let failed = count(TaskState::Failed);
    let killed = count(TaskState::Killed);
    let running = count(TaskState::Running);

    if tasks_created < instances {
        (JobState::Initialized, true)
    } else if succeeded == instances {
        (JobState::Succeeded, false)
    } else if succeeded + failed == instances {
        (JobState::Failed, false)
    } else if killed > 0 && succeeded + failed + killed == instances {
        (JobState::Killed, false)
    } else if running > 0 {
        (JobState::Running, false)
    } else {
        (JobState::Pending, false)
    }
}

pub struct JobRuntimeUpdater {
    job_store: Arc<dyn JobStore>,
    task_store: Arc<dyn TaskStore>,
}

impl JobRuntimeUpdater {
    pub fn new(job_store: Arc<dyn JobStore>, task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            job_store,
            task_store,
        }
    }

    /// Run one update pass for `job_id`.
    pub async fn update_job(&self, job_id: &str) -> Result<JobUpdateOutcome> {
        let mut runtime = self.job_store.get_job_runtime(job_id).await?;
        let config = self.job_store.get_job_config(job_id).await?;

        let stats = self
            .task_store
            .get_task_state_summary_for_job(job_id)
            .await?;
        let tasks_created: u32 = stats.values().sum();

        if !runtime.task_stats.is_empty() && task_stats_equal(&stats, &runtime.task_stats) {
            tracing::debug!(job_id, "task stats unchanged");
            return Ok(JobUpdateOutcome {
                state: runtime.state,
                recovery_needed: false,
                stats_changed: false,
                to_start: Vec::new(),
            });
        }

        let infos = self
            .task_store
            .get_task_runtimes_for_job_by_range(job_id, 0, config.instance_count)
            .await?;

        // Start time: first update of any task at or past starting.
        if runtime.start_time.is_none() {
            let first_started: Option<DateTime<Utc>> = infos
                .iter()
                .filter(|info| info.runtime.state.is_after_start())
                .map(|info| info.runtime.last_update)
                .min();
            runtime.start_time = first_started;
        }
        let completion_time: Option<DateTime<Utc>> =
            infos.iter().map(|info| info.runtime.last_update).max();

        let (state, recovery_needed) =
            derive_job_state(&stats, config.instance_count, tasks_created);
        if state.is_terminal() {
            runtime.completion_time = completion_time;
        }
        runtime.state = state;
        runtime.task_stats = stats.clone();
        self.job_store
            .update_job_runtime(job_id, runtime.clone())
            .await?;

        let to_start = if config.max_running_instances > 0 {
            self.instances_to_start(job_id, &config.goal_state, &runtime.goal_state, &stats, config.max_running_instances)
                .await?
        } else {
            Vec::new()
        };

        tracing::info!(job_id, state = %state, "job runtime updated");
        Ok(JobUpdateOutcome {
            state,
            recovery_needed,
            stats_changed: true,
            to_start,
        })
    }

    /// Initialized tasks to schedule while staying under the
    /// running-instance cap. Skipped entirely for jobs being killed.
    async fn instances_to_start(
        &self,
        job_id: &str,
        config_goal: &JobState,
        runtime_goal: &JobState,
        stats: &HashMap<TaskState, u32>,
        max_running_instances: u32,
    ) -> Result<Vec<TaskId>> {
        if *config_goal == JobState::Killed || *runtime_goal == JobState::Killed {
            return Ok(Vec::new());
        }

        let scheduled: u32 = stats
            .iter()
            .filter(|(state, _)| state.is_scheduled())
            .map(|(_, count)| *count)
            .sum();
        if scheduled >= max_running_instances {
            tracing::debug!(job_id, scheduled, "no instances to start");
            return Ok(Vec::new());
        }
        let mut budget = max_running_instances - scheduled;

        let initialized = self
            .task_store
            .get_task_ids_for_job_and_state(job_id, TaskState::Initialized)
            .await?;

        let mut to_start = Vec::new();
        for id in initialized {
            if budget == 0 {
                break;
            }
            // The summary view may lag; confirm the task really is
            // still initialized.
            let task_runtime = match self.task_store.get_task_runtime(&id).await {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(job_id, task_id = %id, error = %e, "failed to fetch task runtime");
                    continue;
                }
            };
            if task_runtime.state != TaskState::Initialized {
                budget -= 1;
                continue;
            }
            to_start.push(id);
            budget -= 1;
        }
        Ok(to_start)
    }
}
