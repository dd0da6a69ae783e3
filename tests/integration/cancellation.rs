//! Cooperative cancellation integration tests.
//!
//! Cancellation stops dispatch of new tasks; tasks already running finish
//! and their outcome is persisted.

use tokio_test::assert_err;

use bgjobs::job::JobRecordStore;
use bgjobs::{Error, JobEvent, JobStatus, TaskStatus};

use crate::fixtures::{progress_values, seeds, Gate, Harness};

/// Test: Cancel partway through a run
/// Given 6 tasks with a limit of 2, tasks 0 and 1 done and 2 and 3 running
/// When the job is cancelled
/// Then 2 and 3 finish, 4 and 5 never start and progress stays at 33
#[tokio::test]
async fn test_cancel_stops_dispatch() {
    let mut h = Harness::new();
    let mut gate = Gate::register(&h.registry, "gated", 2);

    let handle = h.manager.start_job("six", "alice", seeds(6), "gated").await.unwrap();
    let id = handle.id();

    let mut started = vec![gate.next_start().await, gate.next_start().await];
    gate.release(2);
    started.push(gate.next_start().await);
    started.push(gate.next_start().await);
    started.sort_unstable();
    assert_eq!(started, vec![0, 1, 2, 3]);

    h.manager.cancel_job(&id).await.unwrap();
    gate.release(10);
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert!(gate.started.try_recv().is_err(), "no task starts after cancel");

    let record = h.jobs.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.progress, 33);
    assert!(record.finished_at.is_some());

    let page = h.manager.tasks_page(&id, 0, 10).await.unwrap();
    let statuses: Vec<TaskStatus> = page.tasks.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::Scheduled,
            TaskStatus::Scheduled
        ]
    );

    let events = h.drain_events(id);
    assert_eq!(progress_values(&events), vec![17, 33]);
    let finished: Vec<&JobEvent> = events
        .iter()
        .filter(|e| matches!(e, JobEvent::JobFinished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(matches!(
        finished[0],
        JobEvent::JobFinished {
            status: JobStatus::Cancelled,
            ..
        }
    ));
}

/// Test: Cancellation recorded by another process
/// Given a run in this process with task 0 in flight
/// When a peer marks the job CANCELLED in the shared record store
/// Then the run starts nothing else and task 0's completion pushes no progress
#[tokio::test]
async fn test_external_cancel_observed_at_dispatch() {
    let mut h = Harness::new();
    let mut gate = Gate::register(&h.registry, "gated", 1);

    let handle = h.manager.start_job("three", "alice", seeds(3), "gated").await.unwrap();
    let id = handle.id();
    assert_eq!(gate.next_start().await, 0);

    h.peer().cancel_job(&id).await.unwrap();
    gate.release(10);
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert!(gate.started.try_recv().is_err());

    let store = h.manager.stores().open(id).await.unwrap();
    assert_eq!(store.get(0).await.unwrap().unwrap().status, TaskStatus::Done);
    assert_eq!(store.get(1).await.unwrap().unwrap().status, TaskStatus::Scheduled);
    let record = h.jobs.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.progress, 0);

    let events = h.drain_events(id);
    assert!(progress_values(&events).is_empty());
    assert!(!events
        .iter()
        .any(|e| matches!(e, JobEvent::JobFinished { status: JobStatus::Done, .. })));
}

/// Test: A second cancel is rejected
#[tokio::test]
async fn test_cancel_twice() {
    let h = Harness::new();
    let mut gate = Gate::register(&h.registry, "gated", 1);

    let handle = h.manager.start_job("twice", "alice", seeds(2), "gated").await.unwrap();
    let id = handle.id();
    gate.next_start().await;

    h.manager.cancel_job(&id).await.unwrap();
    let err = assert_err!(h.manager.cancel_job(&id).await);
    assert!(matches!(
        err,
        Error::JobAlreadyFinished {
            status: JobStatus::Cancelled,
            ..
        }
    ));

    gate.release(10);
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
}

/// Test: Cancelling an unknown job
#[tokio::test]
async fn test_cancel_unknown_job() {
    let h = Harness::new();
    let err = assert_err!(h.manager.cancel_job(&bgjobs::JobId::new()).await);
    assert!(matches!(err, Error::JobNotFound(_)));
}

/// Test: Cancel with only the first two tasks dispatched
/// Given 6 tasks with a limit of 2 and tasks 0 and 1 in flight
/// When the job is cancelled and the handlers are released
/// Then 0 and 1 finish DONE and the other 4 stay SCHEDULED
#[tokio::test]
async fn test_cancel_with_two_in_flight() {
    let mut h = Harness::new();
    let mut gate = Gate::register(&h.registry, "gated", 2);

    let handle = h.manager.start_job("six", "alice", seeds(6), "gated").await.unwrap();
    let id = handle.id();
    let mut started = vec![gate.next_start().await, gate.next_start().await];
    started.sort_unstable();
    assert_eq!(started, vec![0, 1]);

    h.manager.cancel_job(&id).await.unwrap();
    gate.release(10);
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Cancelled);
    assert!(gate.started.try_recv().is_err());

    let store = h.manager.stores().open(id).await.unwrap();
    for i in 0..2 {
        assert_eq!(store.get(i).await.unwrap().unwrap().status, TaskStatus::Done);
    }
    for i in 2..6 {
        assert_eq!(store.get(i).await.unwrap().unwrap().status, TaskStatus::Scheduled);
    }
    let record = h.jobs.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.progress, 0);
    assert!(progress_values(&h.drain_events(id)).is_empty());
}
