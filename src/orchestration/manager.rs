//! Job lifecycle: start, bounded execution, cancellation and deletion.
//!
//! Each run dispatches its tasks in index order through a FIFO semaphore
//! sized to the handler's concurrency limit. Workers live in a `JoinSet`
//! and the dispatcher drains it before writing the terminal status, so a
//! job is never reported finished while one of its tasks is still running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{EventSink, JobEvent, JOBS_TOPIC};
use crate::job::{
    JobFilter, JobId, JobRecord, JobRecordStore, JobStatus, JobSummary, JobUpdate, NewJob,
    SortOrder,
};
use crate::orchestration::progress::{ProgressTracker, Settlement, Tally};
use crate::registry::{HandlerEntry, HandlerRegistry, TaskContext, TaskHandlerFn};
use crate::task::{ScanEntry, TaskRecord, TaskSeed, TaskStatus, TaskStore, TaskStores};
use crate::{jlog, jlog_debug, jlog_error, jlog_warn};

/// Handle to a job running in the background.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    join: JoinHandle<Result<JobStatus>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the run to end and return the job's final status.
    pub async fn wait(self) -> Result<JobStatus> {
        self.join
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}

/// One task as shown to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub index: usize,
    pub state: Value,
    pub status: TaskStatus,
}

/// A page of a job's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksPage {
    pub tasks: Vec<TaskView>,
    /// Offset of the next page, absent when this page ends the listing.
    pub next_offset: Option<usize>,
    /// Presentation reference registered for the job's handler.
    pub presentation: Option<String>,
}

/// Per-run controls shared with `cancel_job` and `delete_job`.
#[derive(Clone)]
pub(crate) struct RunControl {
    cancel: CancellationToken,
    tally: Arc<Mutex<Tally>>,
}

struct ManagerInner {
    jobs: Arc<dyn JobRecordStore>,
    events: Arc<dyn EventSink>,
    registry: Arc<HandlerRegistry>,
    stores: TaskStores,
    running: Mutex<HashMap<JobId, RunControl>>,
    // Serializes read-modify-write of job-level state.
    state_lock: Mutex<()>,
}

/// Entry point for starting, observing and controlling jobs.
///
/// Cheap to clone; clones share the same stores and running-job table.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        events: Arc<dyn EventSink>,
        registry: Arc<HandlerRegistry>,
        store_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                jobs,
                events,
                registry,
                stores: TaskStores::new(store_root),
                running: Mutex::new(HashMap::new()),
                state_lock: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn jobs(&self) -> &Arc<dyn JobRecordStore> {
        &self.inner.jobs
    }

    pub fn stores(&self) -> &TaskStores {
        &self.inner.stores
    }

    /// Whether a run for `job_id` is active in this process.
    pub async fn is_running(&self, job_id: &JobId) -> bool {
        self.inner.running.lock().await.contains_key(job_id)
    }

    /// Create a job, seed its task store and start running it.
    ///
    /// Returns once the record exists and every task is durably SCHEDULED.
    pub async fn start_job(
        &self,
        name: &str,
        started_by: &str,
        tasks: Vec<TaskSeed>,
        handler_name: &str,
    ) -> Result<JobHandle> {
        self.start_job_with_state(
            name,
            started_by,
            tasks,
            handler_name,
            Value::Object(Map::new()),
        )
        .await
    }

    /// Like [`JobManager::start_job`], with job-level fields present on the
    /// record from the moment it is created. `initial_state` must be an
    /// object; `null` means no fields.
    pub async fn start_job_with_state(
        &self,
        name: &str,
        started_by: &str,
        tasks: Vec<TaskSeed>,
        handler_name: &str,
        initial_state: Value,
    ) -> Result<JobHandle> {
        let initial_state = match initial_state {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other => {
                return Err(Error::Configuration(format!(
                    "initial job state must be an object, got {}",
                    other
                )))
            }
        };
        if name.trim().is_empty() {
            return Err(Error::Configuration("job name is empty".to_string()));
        }
        if started_by.trim().is_empty() {
            return Err(Error::Configuration("job has no starting actor".to_string()));
        }
        if tasks.is_empty() {
            return Err(Error::Configuration(format!("job '{}' has no tasks", name)));
        }
        let entry = self.inner.registry.get(handler_name)?;

        let record = self
            .inner
            .jobs
            .create(NewJob::in_progress(name, started_by, handler_name).with_state(initial_state))
            .await?;
        jlog!(
            "Job {} '{}' started by {}: {} tasks via '{}' (limit {})",
            record.id.short(),
            record.name,
            record.started_by,
            tasks.len(),
            handler_name,
            entry.concurrency
        );
        self.inner.events.publish(
            JOBS_TOPIC,
            JobEvent::JobStarted {
                job_id: record.id,
                name: record.name.clone(),
                status: record.status,
                progress: record.progress,
                created_at: record.created_at,
            },
        );

        let store = self.inner.stores.open(record.id).await?;
        seed_tasks(&store, &tasks, entry.concurrency).await?;

        let control = self
            .track(record.id)
            .await
            .ok_or_else(|| Error::Validation(format!("job {} is already running", record.id)))?;
        Ok(self.spawn_run(record.id, tasks, store, &entry, control))
    }

    /// Run `tasks` of an existing job to completion in the caller's task.
    ///
    /// Seeds carrying a prior outcome are counted but not executed. At most
    /// `limit` handlers run at once; tasks start in index order.
    pub async fn run_tasks(
        &self,
        job_id: &JobId,
        tasks: Vec<TaskSeed>,
        store: TaskStore,
        handler: TaskHandlerFn,
        limit: usize,
    ) -> Result<JobStatus> {
        let control = self
            .track(*job_id)
            .await
            .ok_or_else(|| Error::Validation(format!("job {} is already running", job_id)))?;
        let result = self
            .execute(*job_id, tasks, store, handler, limit, control)
            .await;
        self.untrack(job_id).await;
        result
    }

    /// Mark a job CANCELLED. Running tasks finish; no new task starts.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let control = self.control(job_id).await;
        // Held so no progress push or terminal write interleaves with ours.
        let _tally = match &control {
            Some(control) => Some(control.tally.lock().await),
            None => None,
        };

        let record = self.require(job_id).await?;
        if record.status.is_terminal() {
            return Err(Error::JobAlreadyFinished {
                id: *job_id,
                status: record.status,
            });
        }
        if let Some(control) = &control {
            control.cancel.cancel();
        }

        let update = JobUpdate::finish(JobStatus::Cancelled);
        let finished_at = update.finished_at.unwrap_or_else(chrono::Utc::now);
        self.inner.jobs.update(job_id, update).await?;
        self.inner.events.publish(
            JOBS_TOPIC,
            JobEvent::JobFinished {
                job_id: *job_id,
                status: JobStatus::Cancelled,
                finished_at,
            },
        );
        jlog!(
            "Job {} cancelled at {}% ({})",
            job_id.short(),
            record.progress,
            if control.is_some() { "running here" } else { "not running here" }
        );
        Ok(())
    }

    /// Remove a job record and destroy its task store.
    pub async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        self.require(job_id).await?;
        if let Some(control) = self.control(job_id).await {
            jlog_warn!("Job {} deleted while running; stopping dispatch", job_id.short());
            control.cancel.cancel();
        }
        self.inner.stores.destroy(job_id).await?;
        if !self.inner.jobs.delete(job_id).await? {
            return Err(Error::JobNotFound(*job_id));
        }
        jlog!("Job {} deleted", job_id.short());
        Ok(())
    }

    /// Summaries of jobs started by `actor`, newest first.
    pub async fn list_jobs_for(&self, actor: &str) -> Result<Vec<JobSummary>> {
        let records = self
            .inner
            .jobs
            .list(&JobFilter::started_by(actor), None, SortOrder::NewestFirst)
            .await?;
        Ok(records.iter().map(JobRecord::summary).collect())
    }

    /// Up to `limit` tasks starting at `offset`, in index order.
    ///
    /// Malformed records are skipped; the listing ends at the first missing
    /// index.
    pub async fn tasks_page(&self, job_id: &JobId, offset: usize, limit: usize) -> Result<TasksPage> {
        let record = self.require(job_id).await?;
        let presentation = self.inner.registry.presentation(&record.handler_name);
        if limit == 0 {
            return Ok(TasksPage {
                tasks: Vec::new(),
                next_offset: Some(offset),
                presentation,
            });
        }

        let store = self.inner.stores.open(*job_id).await?;
        let mut entries = store.scan_from(offset, limit.saturating_add(1)).await?;
        let next_offset = if entries.len() > limit {
            entries.truncate(limit);
            Some(offset + limit)
        } else {
            None
        };
        let tasks = entries
            .into_iter()
            .filter_map(|entry| match entry {
                ScanEntry::Valid(index, TaskRecord { state, status }) => Some(TaskView {
                    index,
                    state,
                    status,
                }),
                ScanEntry::Stale(..) => None,
            })
            .collect();
        Ok(TasksPage {
            tasks,
            next_offset,
            presentation,
        })
    }

    /// Job-level state, `None` when the job does not exist.
    pub async fn get_job_state(&self, job_id: &JobId) -> Result<Option<Value>> {
        Ok(self.inner.jobs.get(job_id).await?.map(|r| r.state))
    }

    pub async fn get_job_field(&self, job_id: &JobId, key: &str) -> Result<Option<Value>> {
        let record = self.require(job_id).await?;
        Ok(record.state.get(key).cloned())
    }

    /// Set one key of the job-level state object.
    pub async fn set_job_field(&self, job_id: &JobId, key: &str, value: Value) -> Result<()> {
        let _guard = self.inner.state_lock.lock().await;
        let record = self.require(job_id).await?;
        let mut state = match record.state {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Validation(format!(
                    "job {} state is not an object: {}",
                    job_id, other
                )))
            }
        };
        state.insert(key.to_string(), value);
        self.inner
            .jobs
            .update(job_id, JobUpdate::state(Value::Object(state)))
            .await
    }

    async fn require(&self, job_id: &JobId) -> Result<JobRecord> {
        self.inner
            .jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(*job_id))
    }

    async fn control(&self, job_id: &JobId) -> Option<RunControl> {
        self.inner.running.lock().await.get(job_id).cloned()
    }

    /// Register a run for `job_id`; `None` if one is already active.
    pub(crate) async fn track(&self, job_id: JobId) -> Option<RunControl> {
        let mut running = self.inner.running.lock().await;
        if running.contains_key(&job_id) {
            return None;
        }
        let control = RunControl {
            cancel: CancellationToken::new(),
            tally: Arc::new(Mutex::new(Tally::default())),
        };
        running.insert(job_id, control.clone());
        Some(control)
    }

    pub(crate) async fn untrack(&self, job_id: &JobId) {
        self.inner.running.lock().await.remove(job_id);
    }

    pub(crate) fn spawn_run(
        &self,
        job_id: JobId,
        tasks: Vec<TaskSeed>,
        store: TaskStore,
        entry: &HandlerEntry,
        control: RunControl,
    ) -> JobHandle {
        let manager = self.clone();
        let handler = entry.handler.clone();
        let limit = entry.concurrency;
        let join = tokio::spawn(async move {
            let result = manager
                .execute(job_id, tasks, store, handler, limit, control)
                .await;
            manager.untrack(&job_id).await;
            if let Err(e) = &result {
                jlog_error!("Job {} stopped: {}", job_id.short(), e);
            }
            result
        });
        JobHandle { id: job_id, join }
    }

    async fn execute(
        &self,
        job_id: JobId,
        tasks: Vec<TaskSeed>,
        store: TaskStore,
        handler: TaskHandlerFn,
        limit: usize,
        control: RunControl,
    ) -> Result<JobStatus> {
        if limit == 0 {
            return Err(Error::Configuration(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        let cancel = control.cancel.clone();
        let tracker = Arc::new(ProgressTracker::new(
            job_id,
            tasks.len(),
            control.tally.clone(),
            self.inner.jobs.clone(),
            self.inner.events.clone(),
            cancel.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(limit));
        // Tripped when a worker hits a store failure.
        let halt = CancellationToken::new();
        let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut workers = JoinSet::new();
        let mut cancelled = cancel.is_cancelled();

        jlog_debug!(
            "Job {}: dispatching {} tasks with limit {}",
            job_id.short(),
            tracker.total(),
            limit
        );

        let dispatch: Result<()> = async {
            let prior: Vec<TaskStatus> = tasks.iter().filter_map(|seed| seed.skip).collect();
            tracker.settle_prior(&prior).await?;
            for (index, seed) in tasks.into_iter().enumerate() {
                if halt.is_cancelled() {
                    break;
                }
                if seed.skip.is_some() {
                    continue;
                }
                if !cancelled {
                    let permit = tokio::select! {
                        biased;
                        _ = halt.cancelled() => break,
                        _ = cancel.cancelled() => None,
                        permit = semaphore.clone().acquire_owned() => Some(
                            permit.map_err(|e| Error::TaskJoin(e.to_string()))?,
                        ),
                    };
                    if let Some(permit) = permit {
                        if !self.cancel_requested(&job_id).await? {
                            let worker = Worker {
                                job_id,
                                index,
                                store: store.clone(),
                                handler: handler.clone(),
                                tracker: tracker.clone(),
                                events: self.inner.events.clone(),
                            };
                            let halt = halt.clone();
                            let fatal = fatal.clone();
                            workers.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = worker.run().await {
                                    fatal.lock().await.get_or_insert(e);
                                    halt.cancel();
                                }
                            });
                            continue;
                        }
                    }
                    cancelled = true;
                    cancel.cancel();
                    jlog!(
                        "Job {} cancelled; skipping tasks from index {}",
                        job_id.short(),
                        index
                    );
                }
                tracker.settle(Settlement::Cancelled).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = dispatch {
            fatal.lock().await.get_or_insert(e);
            halt.cancel();
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                fatal
                    .lock()
                    .await
                    .get_or_insert(Error::TaskJoin(e.to_string()));
            }
        }
        if let Some(e) = fatal.lock().await.take() {
            return Err(e);
        }

        let tally = tracker.lock().await;
        if cancelled || cancel.is_cancelled() || self.cancel_requested(&job_id).await? {
            return Ok(JobStatus::Cancelled);
        }
        let status = if tally.failed > 0 {
            JobStatus::DoneWithErrors
        } else {
            JobStatus::Done
        };
        let mut update = JobUpdate::finish(status);
        update.progress = Some(crate::util::percent(tally.completed, tracker.total()));
        let finished_at = update.finished_at.unwrap_or_else(chrono::Utc::now);
        self.inner.jobs.update(&job_id, update).await?;
        drop(tally);

        self.inner.events.publish(
            JOBS_TOPIC,
            JobEvent::JobFinished {
                job_id,
                status,
                finished_at,
            },
        );
        jlog!("Job {} finished: {}", job_id.short(), status);
        Ok(status)
    }

    /// Whether the persisted record says the job was cancelled.
    async fn cancel_requested(&self, job_id: &JobId) -> Result<bool> {
        let record = self.require(job_id).await?;
        Ok(record.status == JobStatus::Cancelled)
    }
}

/// Write one record per seed, SCHEDULED unless it carries a prior outcome.
async fn seed_tasks(store: &TaskStore, tasks: &[TaskSeed], limit: usize) -> Result<()> {
    let writes = tasks.iter().enumerate().map(|(index, seed)| {
        let store = store.clone();
        let record = TaskRecord::new(
            seed.state.clone(),
            seed.skip.unwrap_or(TaskStatus::Scheduled),
        );
        async move { store.put(index, &record).await }
    });
    let results: Vec<Result<()>> = stream::iter(writes)
        .buffer_unordered(limit.max(1))
        .collect()
        .await;
    results.into_iter().collect()
}

/// One task execution, bound to its job's store and tracker.
struct Worker {
    job_id: JobId,
    index: usize,
    store: TaskStore,
    handler: TaskHandlerFn,
    tracker: Arc<ProgressTracker>,
    events: Arc<dyn EventSink>,
}

impl Worker {
    /// Run the handler and persist the outcome.
    ///
    /// Handler errors and panics mark the task FAILED. Only store failures
    /// are returned.
    async fn run(self) -> Result<()> {
        self.mark(TaskStatus::InProgress).await?;

        let ctx = TaskContext::new(self.store.clone(), self.index);
        let outcome = match tokio::spawn((self.handler)(ctx)).await {
            Ok(Ok(())) => TaskStatus::Done,
            Ok(Err(e)) => {
                jlog_error!(
                    "Job {} task {} failed: {}",
                    self.job_id.short(),
                    self.index,
                    e
                );
                TaskStatus::Failed
            }
            Err(e) => {
                jlog_error!(
                    "Job {} task {} panicked: {}",
                    self.job_id.short(),
                    self.index,
                    e
                );
                TaskStatus::Failed
            }
        };

        self.mark(outcome).await?;
        let settlement = if outcome == TaskStatus::Done {
            Settlement::Done
        } else {
            Settlement::Failed
        };
        self.tracker.settle(settlement).await?;
        Ok(())
    }

    async fn mark(&self, status: TaskStatus) -> Result<()> {
        self.store.set_status(self.index, status).await?;
        self.events.publish(
            JOBS_TOPIC,
            JobEvent::TaskStatusChanged {
                job_id: self.job_id,
                index: self.index,
                status,
            },
        );
        Ok(())
    }
}
