//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A manager wired to temporary stores and a channel event sink
//! - Simulating a process restart over the same stores
//! - Handlers that can be gated, counted and observed

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

use bgjobs::events::ChannelSink;
use bgjobs::job::{JobRecordStore, MemoryJobStore, NewJob};
use bgjobs::task::{TaskRecord, TaskStore};
use bgjobs::{Error, HandlerRegistry, JobEvent, JobId, JobManager, TaskContext, TaskSeed, TaskStatus};

/// A manager over a temporary store root and an in-memory job store.
pub struct Harness {
    /// Holds the store root alive for the test's duration.
    pub temp_dir: TempDir,
    pub jobs: Arc<MemoryJobStore>,
    pub registry: Arc<HandlerRegistry>,
    pub manager: JobManager,
    pub events: mpsc::UnboundedReceiver<(String, JobEvent)>,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let jobs = Arc::new(MemoryJobStore::new());
        let (registry, manager, events) = wire(jobs.clone(), temp_dir.path());
        Self {
            temp_dir,
            jobs,
            registry,
            manager,
            events,
        }
    }

    /// A fresh manager and registry over the same stores, as after a restart.
    pub fn restart(&mut self) {
        let (registry, manager, events) = wire(self.jobs.clone(), self.temp_dir.path());
        self.registry = registry;
        self.manager = manager;
        self.events = events;
    }

    /// A second manager sharing the stores, standing in for another process.
    pub fn peer(&self) -> JobManager {
        wire(self.jobs.clone(), self.temp_dir.path()).1
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Everything published so far for `job_id`.
    pub fn drain_events(&mut self, job_id: JobId) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok((_, event)) = self.events.try_recv() {
            if event.job_id() == job_id {
                out.push(event);
            }
        }
        out
    }

    /// Create an IN_PROGRESS record and write the given task records,
    /// as a crashed process would have left them.
    pub async fn seed_job(&self, handler: &str, records: &[TaskRecord]) -> (JobId, TaskStore) {
        let record = self
            .jobs
            .create(NewJob::in_progress("seeded", "alice", handler))
            .await
            .expect("Failed to create job record");
        let store = self
            .manager
            .stores()
            .open(record.id)
            .await
            .expect("Failed to open task store");
        for (index, rec) in records.iter().enumerate() {
            store.put(index, rec).await.expect("Failed to seed task");
        }
        (record.id, store)
    }
}

fn wire(
    jobs: Arc<MemoryJobStore>,
    root: &Path,
) -> (
    Arc<HandlerRegistry>,
    JobManager,
    mpsc::UnboundedReceiver<(String, JobEvent)>,
) {
    let registry = Arc::new(HandlerRegistry::new());
    let (sink, events) = ChannelSink::new();
    let manager = JobManager::new(jobs, Arc::new(sink), registry.clone(), root);
    (registry, manager, events)
}

/// `n` seeds whose state is their index.
pub fn seeds(n: usize) -> Vec<TaskSeed> {
    (0..n).map(|i| TaskSeed::new(json!(i))).collect()
}

/// Scheduled records whose state is their index.
pub fn scheduled(n: usize) -> Vec<TaskRecord> {
    (0..n).map(|i| TaskRecord::scheduled(json!(i))).collect()
}

pub fn record(state: Value, status: TaskStatus) -> TaskRecord {
    TaskRecord::new(state, status)
}

/// Progress values from `JobProgress` events, in publish order.
pub fn progress_values(events: &[JobEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::JobProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

/// Records which task indices a handler was invoked for.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<usize>>>,
}

impl CallLog {
    pub fn push(&self, index: usize) {
        self.calls.lock().expect("call log poisoned").push(index);
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    pub fn sorted(&self) -> Vec<usize> {
        let mut calls = self.calls();
        calls.sort_unstable();
        calls
    }
}

/// Register `name` as a handler that logs its index and succeeds.
pub fn register_logging(registry: &HandlerRegistry, name: &str, limit: usize) -> CallLog {
    let log = CallLog::default();
    let calls = log.clone();
    registry
        .register(name, limit, move |ctx: TaskContext| {
            let calls = calls.clone();
            async move {
                calls.push(ctx.index());
                Ok::<_, Error>(())
            }
        })
        .expect("Failed to register handler");
    log
}

/// Handlers that block until the test releases them.
///
/// Each invocation reports its index on `started`, then waits for one
/// permit from the gate.
pub struct Gate {
    permits: Arc<Semaphore>,
    pub started: mpsc::UnboundedReceiver<usize>,
}

impl Gate {
    pub fn register(registry: &HandlerRegistry, name: &str, limit: usize) -> Self {
        let permits = Arc::new(Semaphore::new(0));
        let (tx, started) = mpsc::unbounded_channel();
        let gate = permits.clone();
        registry
            .register(name, limit, move |ctx: TaskContext| {
                let gate = gate.clone();
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ctx.index());
                    gate.acquire()
                        .await
                        .map_err(|e| Error::task(e))?
                        .forget();
                    Ok::<_, Error>(())
                }
            })
            .expect("Failed to register handler");
        Self { permits, started }
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Wait for the next handler start, failing the test after a timeout.
    pub async fn next_start(&mut self) -> usize {
        tokio::time::timeout(Duration::from_secs(5), self.started.recv())
            .await
            .expect("Timed out waiting for a task to start")
            .expect("Handler channel closed")
    }
}

/// Tracks how many handlers run at once.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}
