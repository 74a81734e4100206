//! Task reconciliation against the upstream cluster manager.
//!
//! Two alternating phases on a periodic tick: an explicit reconcile
//! that streams the attempt ids of every launched/starting/running task
//! in bounded batches, and an implicit reconcile that sends an empty
//! task list so the upstream reports everything it knows. A tick that
//! lands while an explicit run is live is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use resman_api::{AttemptId, JobState, Result, TaskState};
use resman_store::{JobStore, TaskStore};

/// Job states the explicit reconcile walks.
const NON_TERMINAL_JOB_STATES: [JobState; 3] =
    [JobState::Initialized, JobState::Pending, JobState::Running];

/// Task states eligible for explicit reconcile.
const RECONCILE_TASK_STATES: [TaskState; 3] = [
    TaskState::Launched,
    TaskState::Starting,
    TaskState::Running,
];

/// One task entry in a reconcile call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub attempt_id: AttemptId,
    pub agent_id: Option<String>,
}

/// The scheduler-stream call the reconciler consumes. An empty task
/// list means implicit reconcile.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn reconcile(
        &self,
        stream_id: &str,
        framework_id: &str,
        tasks: Vec<ReconcileTask>,
    ) -> Result<()>;
}

/// Identity of this framework on the upstream scheduler stream.
pub trait FrameworkInfo: Send + Sync {
    fn stream_id(&self) -> String;
    fn framework_id(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Tasks per explicit reconcile call.
    pub batch_size: usize,
    /// Spacing between explicit batches.
    pub batch_interval: Duration,
    /// Tick period of the reconciler worker loop.
    pub period: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_interval: Duration::from_secs(1),
            period: Duration::from_secs(1800),
        }
    }
}

pub struct TaskReconciler {
    client: Arc<dyn ClusterClient>,
    info: Arc<dyn FrameworkInfo>,
    job_store: Arc<dyn JobStore>,
    task_store: Arc<dyn TaskStore>,
    config: ReconcilerConfig,
    is_explicit_turn: AtomicBool,
    is_explicit_running: AtomicBool,
}

impl TaskReconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        info: Arc<dyn FrameworkInfo>,
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            info,
            job_store,
            task_store,
            config,
            is_explicit_turn: AtomicBool::new(true),
            is_explicit_running: AtomicBool::new(false),
        })
    }

    pub fn is_explicit_turn(&self) -> bool {
        self.is_explicit_turn.load(Ordering::SeqCst)
    }

    pub fn is_explicit_running(&self) -> bool {
        self.is_explicit_running.load(Ordering::SeqCst)
    }

    /// One reconciler tick: start the phase whose turn it is, in the
    /// background. A no-op while an explicit run is still live.
    pub fn reconcile(self: &Arc<Self>, running: Arc<AtomicBool>) {
        if self.is_explicit_running.load(Ordering::SeqCst) {
            tracing::info!("explicit reconcile still running, skipping tick");
            return;
        }
        let this = Arc::clone(self);
        if self.is_explicit_turn.load(Ordering::SeqCst) {
            tokio::spawn(async move { this.run_explicit(running).await });
        } else {
            tokio::spawn(async move { this.run_implicit().await });
        }
    }

    /// Worker loop: tick until the running flag clears or the token
    /// fires.
    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !running.load(Ordering::SeqCst) {
                        tracing::info!("reconciler no longer running, exiting");
                        break;
                    }
                    self.reconcile(Arc::clone(&running));
                }
            }
        }
    }

    async fn run_explicit(&self, running: Arc<AtomicBool>) {
        self.is_explicit_running.store(true, Ordering::SeqCst);
        self.is_explicit_turn.store(false, Ordering::SeqCst);
        if let Err(e) = self.explicit_cycle(&running).await {
            tracing::error!(error = %e, "explicit reconcile aborted");
        }
        self.is_explicit_running.store(false, Ordering::SeqCst);
    }

    async fn explicit_cycle(&self, running: &AtomicBool) -> Result<()> {
        let jobs = self
            .job_store
            .get_jobs_by_states(&NON_TERMINAL_JOB_STATES)
            .await?;

        let mut tasks = Vec::new();
        for job_id in jobs {
            let infos = self
                .task_store
                .get_tasks_for_job_and_states(&job_id, &RECONCILE_TASK_STATES)
                .await?;
            tasks.extend(infos.into_iter().map(|info| ReconcileTask {
                attempt_id: info.runtime.attempt_id,
                agent_id: info.runtime.agent_id,
            }));
        }

        tracing::info!(task_count = tasks.len(), "explicit reconcile starting");
        let stream_id = self.info.stream_id();
        let framework_id = self.info.framework_id();

        for batch in tasks.chunks(self.config.batch_size.max(1)) {
            if !running.load(Ordering::SeqCst) {
                tracing::info!("explicit reconcile interrupted at batch boundary");
                return Ok(());
            }
            self.client
                .reconcile(&stream_id, &framework_id, batch.to_vec())
                .await?;
            tokio::time::sleep(self.config.batch_interval).await;
        }
        Ok(())
    }

    async fn run_implicit(&self) {
        let stream_id = self.info.stream_id();
        let framework_id = self.info.framework_id();
        if let Err(e) = self
            .client
            .reconcile(&stream_id, &framework_id, Vec::new())
            .await
        {
            tracing::error!(error = %e, "implicit reconcile failed");
        }
        self.is_explicit_turn.store(true, Ordering::SeqCst);
    }
}
