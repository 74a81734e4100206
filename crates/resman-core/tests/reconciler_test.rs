//! Integration tests for the task reconciler: explicit batching,
//! explicit/implicit alternation, failure aborts, and the no-op guard
//! while a run is live.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use resman_api::{AttemptId, Error, JobConfig, JobState, Result, TaskId, TaskRuntime, TaskState};
use resman_core::reconcile::{
    ClusterClient, FrameworkInfo, ReconcileTask, ReconcilerConfig, TaskReconciler,
};
use resman_store::memory::MemoryStore;

const STREAM_ID: &str = "stream-1";
const FRAMEWORK_ID: &str = "framework-1";
const INSTANCE_COUNT: u32 = 5;
const BATCH_SIZE: usize = 3;

struct RecordingClient {
    calls: Mutex<Vec<Vec<ReconcileTask>>>,
    fail_remaining: AtomicUsize,
}

impl RecordingClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(0),
        })
    }

    fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<Vec<ReconcileTask>> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn reconcile(
        &self,
        stream_id: &str,
        framework_id: &str,
        tasks: Vec<ReconcileTask>,
    ) -> Result<()> {
        assert_eq!(stream_id, STREAM_ID);
        assert_eq!(framework_id, FRAMEWORK_ID);
        self.calls.lock().expect("calls lock poisoned").push(tasks);
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::StoreUnavailable("fake error".to_owned()));
        }
        Ok(())
    }
}

struct TestFrameworkInfo;

impl FrameworkInfo for TestFrameworkInfo {
    fn stream_id(&self) -> String {
        STREAM_ID.to_owned()
    }

    fn framework_id(&self) -> String {
        FRAMEWORK_ID.to_owned()
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_job(
        "testJob0",
        JobConfig {
            name: "testJob0".to_owned(),
            instance_count: INSTANCE_COUNT,
            max_running_instances: 0,
            goal_state: JobState::Succeeded,
        },
    );
    let states = [
        TaskState::Launched,
        TaskState::Launched,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Running,
    ];
    for (instance, state) in states.iter().enumerate() {
        store.insert_task(
            TaskId::new("testJob0", instance as u32),
            TaskRuntime {
                state: *state,
                goal_state: TaskState::Succeeded,
                attempt_id: AttemptId::from(format!("testJob0-{instance}-a").as_str()),
                agent_id: Some("agent-1".to_owned()),
                hostname: Some("host-1".to_owned()),
                last_update: Utc::now(),
            },
        );
    }
    store
}

fn reconciler(client: Arc<RecordingClient>, store: Arc<MemoryStore>) -> Arc<TaskReconciler> {
    TaskReconciler::new(
        client,
        Arc::new(TestFrameworkInfo),
        store.clone(),
        store,
        ReconcilerConfig {
            batch_size: BATCH_SIZE,
            batch_interval: Duration::from_millis(50),
            period: Duration::from_secs(3600),
        },
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_explicit_batches_then_implicit_alternation() {
    let client = RecordingClient::new();
    let reconciler = reconciler(client.clone(), seeded_store());
    let running = Arc::new(AtomicBool::new(true));

    assert!(reconciler.is_explicit_turn());
    assert!(!reconciler.is_explicit_running());

    // First tick: explicit run with 5 tasks in batches of 3 and 2.
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| reconciler.is_explicit_running()).await;
    assert!(!reconciler.is_explicit_turn());
    wait_until(|| !reconciler.is_explicit_running()).await;

    let calls = client.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].len(), BATCH_SIZE);
    assert_eq!(calls[1].len(), INSTANCE_COUNT as usize - BATCH_SIZE);
    assert_eq!(calls[0][0].agent_id.as_deref(), Some("agent-1"));
    assert!(!reconciler.is_explicit_turn());

    // Second tick: implicit run with an empty task list.
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| client.calls().len() == 3).await;
    assert!(client.calls()[2].is_empty());
    wait_until(|| reconciler.is_explicit_turn()).await;

    // Third tick: explicit again.
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| !reconciler.is_explicit_running() && client.calls().len() == 5).await;
    assert_eq!(client.calls()[3].len(), BATCH_SIZE);
}

#[tokio::test]
async fn test_explicit_failure_aborts_run_and_flips_turn() {
    let client = RecordingClient::new();
    let reconciler = reconciler(client.clone(), seeded_store());
    let running = Arc::new(AtomicBool::new(true));

    client.fail_next(1);
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| client.calls().len() == 1 && !reconciler.is_explicit_running()).await;

    // Aborted after the first failed batch; no second batch.
    assert_eq!(client.calls().len(), 1);
    assert!(!reconciler.is_explicit_turn());

    // Next tick falls through to implicit, which restores the turn.
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| client.calls().len() == 2).await;
    assert!(client.calls()[1].is_empty());
    wait_until(|| reconciler.is_explicit_turn()).await;
}

#[tokio::test]
async fn test_tick_is_noop_while_explicit_run_is_live() {
    let client = RecordingClient::new();
    let reconciler = reconciler(client.clone(), seeded_store());
    let running = Arc::new(AtomicBool::new(true));

    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| reconciler.is_explicit_running()).await;

    // A tick while the run is live starts nothing new.
    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| !reconciler.is_explicit_running()).await;
    assert_eq!(client.calls().len(), 2, "only the original run's batches");
}

#[tokio::test]
async fn test_clearing_running_flag_stops_at_batch_boundary() {
    let client = RecordingClient::new();
    let reconciler = reconciler(client.clone(), seeded_store());
    let running = Arc::new(AtomicBool::new(true));

    reconciler.reconcile(Arc::clone(&running));
    wait_until(|| client.calls().len() == 1).await;
    running.store(false, Ordering::SeqCst);
    wait_until(|| !reconciler.is_explicit_running()).await;

    // The second batch was never sent.
    assert_eq!(client.calls().len(), 1);
    assert!(!reconciler.is_explicit_turn());
}
