//! The root resource-manager context.
//!
//! Owns the tree, tracker, and worker loops as explicit injected
//! handles. Collaborators (stores, the upstream cluster client) come in
//! at construction; nothing is a module-level singleton, so independent
//! managers can coexist in one process (and in parallel tests).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use resman_api::Result;
use resman_store::{JobStore, ResourcePoolStore, TaskStore};

use crate::handler::{HandlerConfig, ServiceHandler};
use crate::job::JobRuntimeUpdater;
use crate::preemption::{PreemptionQueue, Preemptor, PreemptorConfig};
use crate::reconcile::{ClusterClient, FrameworkInfo, ReconcilerConfig, TaskReconciler};
use crate::respool::Tree;
use crate::task::scheduler::{Scheduler, SchedulerConfig};
use crate::task::timeout::{TaskTimerConfig, TimeoutWheel};
use crate::task::tracker::Tracker;

#[derive(Debug, Clone, Default)]
pub struct ResourceManagerConfig {
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub preemptor: PreemptorConfig,
    pub timers: TaskTimerConfig,
    pub handler: HandlerConfig,
    /// Per-pool pending sub-queue bound.
    pub pool_queue_bound: usize,
}

impl ResourceManagerConfig {
    fn pool_queue_bound(&self) -> usize {
        if self.pool_queue_bound == 0 {
            10_000
        } else {
            self.pool_queue_bound
        }
    }
}

pub struct ResourceManager {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    handler: Arc<ServiceHandler>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<TaskReconciler>,
    preemptor: Arc<Preemptor>,
    updater: Arc<JobRuntimeUpdater>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ResourceManager {
    /// Build a manager: read the pool configs, assemble the tree, and
    /// wire every component. Workers start on [`Self::start`].
    pub async fn new(
        pool_store: Arc<dyn ResourcePoolStore>,
        job_store: Arc<dyn JobStore>,
        task_store: Arc<dyn TaskStore>,
        cluster_client: Arc<dyn ClusterClient>,
        framework_info: Arc<dyn FrameworkInfo>,
        config: ResourceManagerConfig,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tree = Tree::from_store(pool_store.as_ref(), config.pool_queue_bound()).await?;
        let tracker = Tracker::new(tree.clone());
        let ready_notify = Arc::new(Notify::new());

        let wheel = TimeoutWheel::spawn(
            tracker.clone(),
            tree.clone(),
            ready_notify.clone(),
            config.timers.clone(),
            cancel.clone(),
        );

        let preemption_queue = PreemptionQueue::new(config.preemptor.queue_bound);
        let handler = ServiceHandler::new(
            tree.clone(),
            tracker.clone(),
            wheel,
            ready_notify.clone(),
            preemption_queue.clone(),
            config.handler.clone(),
        );
        let scheduler = Scheduler::new(
            tree.clone(),
            tracker.clone(),
            ready_notify,
            config.scheduler.clone(),
        );
        let preemptor = Preemptor::new(
            tree.clone(),
            tracker.clone(),
            preemption_queue,
            config.preemptor.clone(),
        );
        let reconciler = TaskReconciler::new(
            cluster_client,
            framework_info,
            job_store.clone(),
            task_store.clone(),
            config.reconciler.clone(),
        );
        let updater = Arc::new(JobRuntimeUpdater::new(job_store, task_store));

        Ok(Self {
            tree,
            tracker,
            handler,
            scheduler,
            reconciler,
            preemptor,
            updater,
            running: Arc::new(AtomicBool::new(false)),
            cancel,
        })
    }

    /// Spawn the scheduler, preemption-evaluator, and reconciler
    /// workers.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(Arc::clone(&self.scheduler).run(self.cancel.clone()));
        tokio::spawn(Arc::clone(&self.preemptor).run(self.cancel.clone()));
        tokio::spawn(
            Arc::clone(&self.reconciler).run(Arc::clone(&self.running), self.cancel.clone()),
        );
        tracing::info!("resource manager started");
    }

    /// Cooperative shutdown: clear the running flag and cancel every
    /// worker; each exits at its next safe point.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        tracing::info!("resource manager stopping");
    }

    pub fn handler(&self) -> Arc<ServiceHandler> {
        Arc::clone(&self.handler)
    }

    pub fn tree(&self) -> Arc<Tree> {
        Arc::clone(&self.tree)
    }

    pub fn tracker(&self) -> Arc<Tracker> {
        Arc::clone(&self.tracker)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn reconciler(&self) -> Arc<TaskReconciler> {
        Arc::clone(&self.reconciler)
    }

    pub fn preemptor(&self) -> Arc<Preemptor> {
        Arc::clone(&self.preemptor)
    }

    pub fn job_updater(&self) -> Arc<JobRuntimeUpdater> {
        Arc::clone(&self.updater)
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
