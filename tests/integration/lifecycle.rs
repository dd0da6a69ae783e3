//! Job lifecycle integration tests.
//!
//! Start a job, watch its progress, aggregate failures, page its tasks and
//! delete it.

use std::sync::Arc;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use bgjobs::job::{JobRecordStore, JsonJobStore};
use bgjobs::task::store_dir;
use bgjobs::{Error, HandlerRegistry, JobEvent, JobManager, JobStatus, TaskContext, TaskStatus};

use crate::fixtures::{progress_values, register_logging, seeds, Harness};

/// Test: Progress reported after each task
/// Given 5 tasks and a limit of 2
/// When all succeed
/// Then progress goes 20, 40, 60, 80, 100 and the job ends DONE
#[tokio::test]
async fn test_progress_sequence() {
    let mut h = Harness::new();
    register_logging(&h.registry, "noop", 2);

    let handle = assert_ok!(h.manager.start_job("five", "alice", seeds(5), "noop").await);
    let id = handle.id();
    assert_eq!(assert_ok!(handle.wait().await), JobStatus::Done);

    let events = h.drain_events(id);
    assert_eq!(progress_values(&events), vec![20, 40, 60, 80, 100]);
    assert!(matches!(events.first(), Some(JobEvent::JobStarted { progress: 0, .. })));
    assert!(matches!(
        events.last(),
        Some(JobEvent::JobFinished {
            status: JobStatus::Done,
            ..
        })
    ));

    let record = h.jobs.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.progress, 100);
    assert!(record.finished_at.is_some());
}

/// Test: One failed task
/// Given 4 tasks where index 2 fails
/// When the job runs
/// Then it ends DONE_WITH_ERRORS and the other tasks are DONE
#[tokio::test]
async fn test_failed_task_gives_done_with_errors() {
    let h = Harness::new();
    h.registry
        .register("flaky", 2, |ctx: TaskContext| async move {
            if ctx.index() == 2 {
                return Err(Error::task("row 2 is malformed"));
            }
            ctx.set_state(json!("ok")).await
        })
        .unwrap();

    let handle = h.manager.start_job("import", "alice", seeds(4), "flaky").await.unwrap();
    let id = handle.id();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::DoneWithErrors);

    let page = h.manager.tasks_page(&id, 0, 10).await.unwrap();
    let statuses: Vec<TaskStatus> = page.tasks.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Done
        ]
    );
    // A failed task keeps the state it had.
    assert_eq!(page.tasks[2].state, json!(2));
    assert_eq!(page.tasks[3].state, json!("ok"));
    assert_eq!(h.jobs.get(&id).await.unwrap().unwrap().progress, 100);
}

/// Test: Task state written by the handler survives
#[tokio::test]
async fn test_handler_state_persisted() {
    let h = Harness::new();
    h.registry
        .register("tag", 3, |ctx: TaskContext| async move {
            let n: u64 = ctx.state_as().await?;
            ctx.set_state(json!({"n": n, "tagged": true})).await
        })
        .unwrap();

    let handle = h.manager.start_job("tag", "alice", seeds(3), "tag").await.unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    let store = h.manager.stores().open(id).await.unwrap();
    let rec = store.get(1).await.unwrap().unwrap();
    assert_eq!(rec.state, json!({"n": 1, "tagged": true}));
    assert_eq!(rec.status, TaskStatus::Done);
}

/// Test: Paging through tasks
/// Given a finished job of 5 tasks
/// When pages of 2 are requested
/// Then pages follow index order and the last has no next offset
#[tokio::test]
async fn test_tasks_page_pagination() {
    let h = Harness::new();
    register_logging(&h.registry, "noop", 1);
    h.registry.register_presentation("noop", "components/Noop.vue");

    let handle = h.manager.start_job("pages", "alice", seeds(5), "noop").await.unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    let first = h.manager.tasks_page(&id, 0, 2).await.unwrap();
    assert_eq!(first.tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(first.next_offset, Some(2));
    assert_eq!(first.presentation.as_deref(), Some("components/Noop.vue"));

    let second = h.manager.tasks_page(&id, 2, 2).await.unwrap();
    assert_eq!(second.tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(second.next_offset, Some(4));

    let last = h.manager.tasks_page(&id, 4, 2).await.unwrap();
    assert_eq!(last.tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![4]);
    assert_eq!(last.next_offset, None);

    let past_end = h.manager.tasks_page(&id, 9, 2).await.unwrap();
    assert!(past_end.tasks.is_empty());
    assert_eq!(past_end.next_offset, None);
}

/// Test: Listing is scoped to the starting actor, newest first
#[tokio::test]
async fn test_list_jobs_for_actor() {
    let h = Harness::new();
    register_logging(&h.registry, "noop", 1);

    for (name, actor) in [("a", "alice"), ("b", "bob"), ("c", "alice")] {
        let handle = h.manager.start_job(name, actor, seeds(1), "noop").await.unwrap();
        handle.wait().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let alice = h.manager.list_jobs_for("alice").await.unwrap();
    assert_eq!(alice.iter().map(|j| j.name.as_str()).collect::<Vec<_>>(), vec!["c", "a"]);
    assert!(alice.iter().all(|j| j.status == JobStatus::Done && j.progress == 100));
    assert!(h.manager.list_jobs_for("carol").await.unwrap().is_empty());
}

/// Test: Deleting a job removes its task store
#[tokio::test]
async fn test_delete_removes_store() {
    let h = Harness::new();
    register_logging(&h.registry, "noop", 1);

    let handle = h.manager.start_job("gone", "alice", seeds(3), "noop").await.unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();
    let dir = store_dir(h.root(), &id);
    assert!(dir.exists());

    assert_ok!(h.manager.delete_job(&id).await);
    assert!(!dir.exists());
    assert!(h.jobs.get(&id).await.unwrap().is_none());
    assert_eq!(h.manager.stores().open_count().await, 0);

    let err = assert_err!(h.manager.delete_job(&id).await);
    assert!(matches!(err, Error::JobNotFound(_)));
}

/// Test: Cancelling a finished job is rejected and leaves it unchanged
#[tokio::test]
async fn test_cancel_finished_job_rejected() {
    let h = Harness::new();
    register_logging(&h.registry, "noop", 1);

    let handle = h.manager.start_job("done", "alice", seeds(2), "noop").await.unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    let err = assert_err!(h.manager.cancel_job(&id).await);
    assert!(matches!(
        err,
        Error::JobAlreadyFinished {
            status: JobStatus::Done,
            ..
        }
    ));
    assert_eq!(h.jobs.get(&id).await.unwrap().unwrap().status, JobStatus::Done);
}

/// Test: Job-level fields round through the record store
#[tokio::test]
async fn test_job_fields_while_running() {
    let h = Harness::new();
    register_logging(&h.registry, "noop", 1);

    let handle = h.manager.start_job("fields", "alice", seeds(2), "noop").await.unwrap();
    let id = handle.id();
    h.manager.set_job_field(&id, "source", json!("upload.csv")).await.unwrap();
    handle.wait().await.unwrap();

    assert_eq!(
        h.manager.get_job_field(&id, "source").await.unwrap(),
        Some(json!("upload.csv"))
    );
}

/// Test: The file-backed record store works end to end
/// Given a manager over a jobs.json file
/// When a job finishes and the file is reopened
/// Then the finished record is read back
#[tokio::test]
async fn test_json_store_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("jobs.json");
    let registry = Arc::new(HandlerRegistry::new());
    register_logging(&registry, "noop", 2);
    let manager = JobManager::new(
        Arc::new(JsonJobStore::new(&path)),
        Arc::new(bgjobs::events::NoopSink),
        registry,
        dir.path().join("stores"),
    );

    let handle = manager.start_job("persisted", "alice", seeds(3), "noop").await.unwrap();
    let id = handle.id();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Done);

    let reopened = JsonJobStore::new(&path);
    let record = reopened.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.progress, 100);
    assert_eq!(record.handler_name, "noop");
}
