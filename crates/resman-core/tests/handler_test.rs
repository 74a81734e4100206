//! Integration tests for the service handler: enqueue/dequeue ordering,
//! gang atomicity, attempt supersession, placements, kills, and state
//! updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use resman_api::{AttemptId, ErrorKind, Placement, Resources, TaskEvent, TaskId, TaskState};
use resman_core::handler::{
    DequeueGangsRequest, EnqueueGangsRequest, GetActiveTasksRequest, GetPendingTasksRequest,
    GetPlacementsRequest, HandlerConfig, KillTasksRequest, NotifyTaskUpdatesRequest,
    ServiceHandler, SetPlacementsRequest, TaskStateUpdate, UpdateTasksStateRequest,
};
use resman_core::preemption::PreemptionQueue;
use resman_core::respool::Tree;
use resman_core::task::scheduler::{Scheduler, SchedulerConfig};
use resman_core::task::timeout::{TaskTimerConfig, TimeoutWheel};
use resman_core::task::tracker::Tracker;
use resman_test_utils::{gang_of, sample_pool_configs, single_task_gang, TaskDescBuilder};

struct Harness {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    handler: Arc<ServiceHandler>,
    scheduler: Arc<Scheduler>,
    _cancel: CancellationToken,
}

fn setup() -> Harness {
    let tree = Tree::build(&sample_pool_configs(), 10_000).expect("valid tree");
    let tracker = Tracker::new(tree.clone());
    let ready_notify = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let wheel = TimeoutWheel::spawn(
        tracker.clone(),
        tree.clone(),
        ready_notify.clone(),
        TaskTimerConfig::default(),
        cancel.clone(),
    );
    let handler = ServiceHandler::new(
        tree.clone(),
        tracker.clone(),
        wheel,
        ready_notify.clone(),
        PreemptionQueue::new(100),
        HandlerConfig::default(),
    );
    let scheduler = Scheduler::new(
        tree.clone(),
        tracker.clone(),
        ready_notify,
        SchedulerConfig::default(),
    );
    Harness {
        tree,
        tracker,
        handler,
        scheduler,
        _cancel: cancel,
    }
}

fn entitle(harness: &Harness, pool: &str, cpu: f64) {
    harness
        .tree
        .get(pool)
        .expect("pool exists")
        .set_entitlement(Resources::new(cpu, 10_000.0, 10_000.0, 10.0));
}

#[tokio::test]
async fn test_enqueue_dequeue_priority_fifo_order() {
    let harness = setup();
    entitle(&harness, "respool3", 10.0);

    let enq = harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool3".to_owned(),
            gangs: vec![
                single_task_gang("job-p0", 0, 0, 1.0),
                single_task_gang("job-p2", 0, 2, 1.0),
                single_task_gang("job-p1", 0, 1, 1.0),
            ],
        })
        .await;
    assert!(enq.failed.is_empty(), "unexpected failures: {:?}", enq.failed);

    harness.scheduler.schedule_once();

    let deq = harness
        .handler
        .dequeue_gangs(DequeueGangsRequest {
            limit: 10,
            timeout_ms: 1_000,
        })
        .await;
    let order: Vec<String> = deq
        .gangs
        .iter()
        .map(|gang| gang.id().job_id.clone())
        .collect();
    assert_eq!(order, vec!["job-p2", "job-p1", "job-p0"]);
    for gang in &deq.gangs {
        for task in &gang.tasks {
            assert_eq!(
                harness.tracker.get_task(&task.id).expect("tracked").state(),
                TaskState::Placing
            );
        }
    }
}

#[tokio::test]
async fn test_dequeue_empty_returns_after_timeout() {
    let harness = setup();
    let started = std::time::Instant::now();
    let deq = harness
        .handler
        .dequeue_gangs(DequeueGangsRequest {
            limit: 1,
            timeout_ms: 150,
        })
        .await;
    assert!(deq.gangs.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_gang_admission_is_all_or_nothing() {
    let harness = setup();
    entitle(&harness, "respool11", 1.0);

    harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool11".to_owned(),
            gangs: vec![gang_of("gangjob", 2, 0, 1.0)],
        })
        .await;

    harness.scheduler.schedule_once();
    for instance in 0..2 {
        assert_eq!(
            harness
                .tracker
                .get_task(&TaskId::new("gangjob", instance))
                .expect("tracked")
                .state(),
            TaskState::Pending
        );
    }

    entitle(&harness, "respool11", 2.0);
    harness.scheduler.schedule_once();
    for instance in 0..2 {
        assert_eq!(
            harness
                .tracker
                .get_task(&TaskId::new("gangjob", instance))
                .expect("tracked")
                .state(),
            TaskState::Ready
        );
    }
}

#[tokio::test]
async fn test_enqueue_duplicate_attempt_is_already_exist() {
    let harness = setup();
    let gang = single_task_gang("dup", 0, 0, 1.0);

    let first = harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool21".to_owned(),
            gangs: vec![gang.clone()],
        })
        .await;
    assert!(first.failed.is_empty());

    let second = harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool21".to_owned(),
            gangs: vec![gang],
        })
        .await;
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].kind, ErrorKind::AlreadyExist);
}

#[tokio::test]
async fn test_enqueue_unknown_pool_fails_every_task() {
    let harness = setup();
    let resp = harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "nope".to_owned(),
            gangs: vec![gang_of("j", 2, 0, 1.0)],
        })
        .await;
    assert_eq!(resp.failed.len(), 2);
    assert!(resp.failed.iter().all(|f| f.kind == ErrorKind::NotFound));
}

async fn drive_to_launching(harness: &Harness, job: &str) -> AttemptId {
    entitle(harness, "respool3", 10.0);
    harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool3".to_owned(),
            gangs: vec![single_task_gang(job, 0, 0, 1.0)],
        })
        .await;
    harness.scheduler.schedule_once();
    let deq = harness
        .handler
        .dequeue_gangs(DequeueGangsRequest {
            limit: 1,
            timeout_ms: 1_000,
        })
        .await;
    assert_eq!(deq.gangs.len(), 1);

    let task_id = TaskId::new(job, 0);
    harness
        .handler
        .set_placements(SetPlacementsRequest {
            placements: vec![Placement {
                hostname: "host-1".to_owned(),
                offer_id: "offer-1".to_owned(),
                pool_id: "respool3".to_owned(),
                tasks: vec![task_id.clone()],
            }],
        })
        .await;
    let got = harness
        .handler
        .get_placements(GetPlacementsRequest {
            limit: 1,
            timeout_ms: 1_000,
        })
        .await;
    assert_eq!(got.placements.len(), 1);
    assert_eq!(
        harness.tracker.get_task(&task_id).expect("tracked").state(),
        TaskState::Launching
    );
    harness.tracker.get_task(&task_id).expect("tracked").attempt_id()
}

#[tokio::test]
async fn test_set_get_placements_round_trip() {
    let harness = setup();
    drive_to_launching(&harness, "place").await;

    let by_hosts = harness
        .handler
        .get_tasks_by_hosts(resman_core::handler::GetTasksByHostsRequest {
            hostnames: vec!["host-1".to_owned()],
        })
        .await;
    let on_host = by_hosts.hosts.get("host-1").expect("host is populated");
    assert_eq!(on_host.len(), 1);
    assert_eq!(on_host[0].task_id, TaskId::new("place", 0));
    assert_eq!(on_host[0].state, TaskState::Launching);
}

#[tokio::test]
async fn test_set_placements_strips_non_placing_tasks() {
    let harness = setup();
    entitle(&harness, "respool3", 10.0);
    harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool3".to_owned(),
            gangs: vec![single_task_gang("strip", 0, 0, 1.0)],
        })
        .await;
    harness.scheduler.schedule_once();
    harness
        .handler
        .dequeue_gangs(DequeueGangsRequest {
            limit: 1,
            timeout_ms: 1_000,
        })
        .await;

    // One real placing task, one ghost.
    let resp = harness
        .handler
        .set_placements(SetPlacementsRequest {
            placements: vec![Placement {
                hostname: "host-1".to_owned(),
                offer_id: "offer-1".to_owned(),
                pool_id: "respool3".to_owned(),
                tasks: vec![TaskId::new("strip", 0), TaskId::new("ghost", 7)],
            }],
        })
        .await;
    assert!(resp.failed.is_empty(), "stripping is transparent");

    let got = harness
        .handler
        .get_placements(GetPlacementsRequest {
            limit: 10,
            timeout_ms: 1_000,
        })
        .await;
    assert_eq!(got.placements.len(), 1);
    assert_eq!(got.placements[0].tasks, vec![TaskId::new("strip", 0)]);
}

#[tokio::test]
async fn test_new_attempt_supersedes_launching_task() {
    let harness = setup();
    let old_attempt = drive_to_launching(&harness, "super").await;

    let task_id = TaskId::new("super", 0);
    let new_gang = resman_api::Gang::new(vec![
        TaskDescBuilder::new("super", 0).attempt("super-0-attempt-1").build(),
    ]);
    let resp = harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool3".to_owned(),
            gangs: vec![new_gang],
        })
        .await;
    assert!(resp.failed.is_empty(), "supersede should succeed: {:?}", resp.failed);

    let task = harness.tracker.get_task(&task_id).expect("tracked");
    assert_eq!(task.state(), TaskState::Ready);
    assert_eq!(task.attempt_id(), AttemptId::from("super-0-attempt-1"));
    assert_ne!(task.attempt_id(), old_attempt);
    assert_eq!(task.placement_retries(), 0);

    // The superseded task is immediately dequeueable again.
    let deq = harness
        .handler
        .dequeue_gangs(DequeueGangsRequest {
            limit: 1,
            timeout_ms: 1_000,
        })
        .await;
    assert_eq!(deq.gangs.len(), 1);
    assert_eq!(
        deq.gangs[0].tasks[0].attempt_id,
        AttemptId::from("super-0-attempt-1")
    );
}

#[tokio::test]
async fn test_kill_pending_task_collects_it() {
    let harness = setup();
    harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool21".to_owned(),
            gangs: vec![single_task_gang("kill", 0, 0, 1.0)],
        })
        .await;

    let resp = harness
        .handler
        .kill_tasks(KillTasksRequest {
            task_ids: vec![TaskId::new("kill", 0), TaskId::new("missing", 0)],
        })
        .await;
    assert_eq!(resp.failed.len(), 1);
    assert_eq!(resp.failed[0].kind, ErrorKind::NotFound);
    assert!(harness.tracker.get_task(&TaskId::new("kill", 0)).is_none());

    // Scheduler finds nothing left to admit.
    entitle(&harness, "respool21", 10.0);
    assert_eq!(harness.scheduler.schedule_once(), 0);
}

#[tokio::test]
async fn test_update_tasks_state_rejects_stale_attempt() {
    let harness = setup();
    let attempt = drive_to_launching(&harness, "upd").await;
    let task_id = TaskId::new("upd", 0);

    let resp = harness
        .handler
        .update_tasks_state(UpdateTasksStateRequest {
            updates: vec![TaskStateUpdate {
                task_id: task_id.clone(),
                attempt_id: AttemptId::from("upd-0-bogus"),
                state: TaskState::Launched,
            }],
        })
        .await;
    assert_eq!(resp.stale_attempt, 1);
    assert_eq!(resp.applied, 0);
    assert_eq!(
        harness.tracker.get_task(&task_id).expect("tracked").state(),
        TaskState::Launching
    );

    let resp = harness
        .handler
        .update_tasks_state(UpdateTasksStateRequest {
            updates: vec![TaskStateUpdate {
                task_id: task_id.clone(),
                attempt_id: attempt,
                state: TaskState::Launched,
            }],
        })
        .await;
    assert_eq!(resp.applied, 1);
    assert_eq!(
        harness.tracker.get_task(&task_id).expect("tracked").state(),
        TaskState::Launched
    );
}

#[tokio::test]
async fn test_notify_task_updates_acks_highest_offset() {
    let harness = setup();
    let attempt = drive_to_launching(&harness, "notif").await;
    let task_id = TaskId::new("notif", 0);

    let event = |offset: u64, attempt_id: AttemptId, state: TaskState| TaskEvent {
        task_id: task_id.clone(),
        attempt_id,
        state,
        reason: None,
        message: None,
        agent_id: Some("agent-1".to_owned()),
        timestamp: Utc::now(),
        offset,
    };

    let resp = harness
        .handler
        .notify_task_updates(NotifyTaskUpdatesRequest {
            events: vec![
                event(3, attempt.clone(), TaskState::Launched),
                event(4, AttemptId::from("notif-0-stale"), TaskState::Running),
                event(5, attempt.clone(), TaskState::Starting),
            ],
        })
        .await;
    // Stale events are acknowledged but not applied.
    assert_eq!(resp.purge_offset, 5);
    assert_eq!(
        harness.tracker.get_task(&task_id).expect("tracked").state(),
        TaskState::Starting
    );

    // A matching terminal event collects the task.
    let resp = harness
        .handler
        .notify_task_updates(NotifyTaskUpdatesRequest {
            events: vec![
                event(6, attempt.clone(), TaskState::Running),
                event(7, attempt, TaskState::Succeeded),
            ],
        })
        .await;
    assert_eq!(resp.purge_offset, 7);
    assert!(harness.tracker.get_task(&task_id).is_none());
    assert_eq!(
        harness.tree.get("respool3").expect("pool").allocation(),
        Resources::ZERO
    );
}

#[tokio::test]
async fn test_pending_and_active_task_queries() {
    let harness = setup();
    harness
        .handler
        .enqueue_gangs(EnqueueGangsRequest {
            pool_id: "respool11".to_owned(),
            gangs: vec![
                single_task_gang("qa", 0, 1, 1.0),
                single_task_gang("qb", 0, 0, 1.0),
            ],
        })
        .await;

    let pending = harness
        .handler
        .get_pending_tasks(GetPendingTasksRequest {
            pool_id: "respool11".to_owned(),
            limit: 10,
        })
        .await
        .expect("pool exists");
    let batch_queue = pending
        .queues
        .iter()
        .find(|entry| entry.queue == "pending")
        .expect("pending queue listed");
    assert_eq!(
        batch_queue.gangs,
        vec![vec![TaskId::new("qa", 0)], vec![TaskId::new("qb", 0)]]
    );

    let active = harness
        .handler
        .get_active_tasks(GetActiveTasksRequest {
            job_id: None,
            states: vec![TaskState::Pending],
        })
        .await;
    assert_eq!(active.tasks.len(), 2);

    let err = harness
        .handler
        .get_pending_tasks(GetPendingTasksRequest {
            pool_id: "nope".to_owned(),
            limit: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
