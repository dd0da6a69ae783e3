//! Completion accounting for one job run.
//!
//! Every settled task goes through [`ProgressTracker::settle`], which bumps
//! the shared tally and pushes the recomputed progress while holding the
//! tally lock. Two tasks finishing together therefore never compute
//! progress from the same count. The record's stored progress is the floor
//! for a run, so a resumed job never reports less than an earlier run did.
//! `cancel_job` and the terminal-status write take the same lock.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{EventSink, JobEvent, JOBS_TOPIC};
use crate::job::{JobId, JobRecordStore, JobUpdate};
use crate::task::TaskStatus;
use crate::util::percent;

/// How a task counted toward completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The handler ran and succeeded.
    Done,
    /// The handler returned an error or panicked.
    Failed,
    /// Settled in an earlier run; counted, not executed.
    Skipped(TaskStatus),
    /// Short-circuited because the job was cancelled.
    Cancelled,
}

impl Settlement {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            Settlement::Failed | Settlement::Skipped(TaskStatus::Failed)
        )
    }
}

/// Counters shared by a job's workers.
#[derive(Debug, Default)]
pub struct Tally {
    pub completed: usize,
    pub failed: usize,
    /// Highest progress known to be stored; nothing at or below it is pushed.
    pub pushed: u8,
}

pub struct ProgressTracker {
    job_id: JobId,
    total: usize,
    tally: Arc<Mutex<Tally>>,
    jobs: Arc<dyn JobRecordStore>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl ProgressTracker {
    pub fn new(
        job_id: JobId,
        total: usize,
        tally: Arc<Mutex<Tally>>,
        jobs: Arc<dyn JobRecordStore>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            total,
            tally,
            jobs,
            events,
            cancel,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Count tasks settled by an earlier run in one step.
    ///
    /// Adopts the record's stored progress as the floor and pushes at most
    /// once, so resuming never replays lower values.
    pub async fn settle_prior(&self, prior: &[TaskStatus]) -> Result<u8> {
        let mut tally = self.tally.lock().await;
        let record = self
            .jobs
            .get(&self.job_id)
            .await?
            .ok_or(Error::JobNotFound(self.job_id))?;
        tally.pushed = tally.pushed.max(record.progress);
        if prior.is_empty() {
            return Ok(tally.pushed);
        }

        tally.completed += prior.len();
        tally.failed += prior
            .iter()
            .filter(|status| Settlement::Skipped(**status).is_failure())
            .count();
        let progress = percent(tally.completed, self.total);
        self.push(&mut tally, progress).await?;
        Ok(progress)
    }

    /// Count one task and push the new progress unless the job was cancelled.
    ///
    /// Returns the recomputed progress.
    pub async fn settle(&self, settlement: Settlement) -> Result<u8> {
        let mut tally = self.tally.lock().await;
        tally.completed += 1;
        if settlement.is_failure() {
            tally.failed += 1;
        }
        let progress = percent(tally.completed, self.total);
        self.push(&mut tally, progress).await?;
        Ok(progress)
    }

    /// Store and publish `progress` if it is above the floor and the job is
    /// still live. A terminal record trips the run's token instead.
    async fn push(&self, tally: &mut Tally, progress: u8) -> Result<()> {
        if self.cancel.is_cancelled() || progress <= tally.pushed {
            return Ok(());
        }
        let record = self
            .jobs
            .get(&self.job_id)
            .await?
            .ok_or(Error::JobNotFound(self.job_id))?;
        if record.status.is_terminal() {
            self.cancel.cancel();
            return Ok(());
        }

        self.jobs
            .update(&self.job_id, JobUpdate::progress(progress))
            .await?;
        self.events.publish(
            JOBS_TOPIC,
            JobEvent::JobProgress {
                job_id: self.job_id,
                progress,
            },
        );
        tally.pushed = progress;
        Ok(())
    }

    /// Hold the tally lock, blocking concurrent settlements.
    pub async fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().await
    }
}
